//! Portable `poll(2)` fallback backend.
//!
//! No persistent kernel registration: the fd set is rebuilt from the watch
//! table on every dispatch. Slower than epoll for large watch counts but
//! available everywhere, and handy for exercising the driver against a
//! second backend.

use super::{
    timeout_to_ms, Backend, LoopWaker, SignalRegistrar, WakePipe, Watch, WatchKind, WatchTable,
};
use crate::callback::CallbackId;

use std::io;
use std::time::Duration;

pub struct PollBackend {
    wake: WakePipe,
    signals: SignalRegistrar,
    table: WatchTable,
}

impl PollBackend {
    pub fn new() -> io::Result<Self> {
        let wake = WakePipe::new()?;
        let signals = SignalRegistrar::new(wake.write_fd());

        Ok(Self {
            wake,
            signals,
            table: WatchTable::new(),
        })
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn activate(&mut self, watches: &[Watch]) -> io::Result<()> {
        for &watch in watches {
            self.table.add(watch);

            if let WatchKind::Signal(signo) = watch.kind {
                self.signals.install(signo);
            }
        }

        Ok(())
    }

    fn deactivate(&mut self, watch: Watch) {
        self.table.remove(watch);

        if let WatchKind::Signal(signo) = watch.kind {
            if !self.table.has_signal_watch(signo) {
                self.signals.remove(signo);
            }
        }
    }

    fn dispatch(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<CallbackId>,
    ) -> io::Result<()> {
        // Slot 0 is always the wake pipe.
        let mut fds = vec![libc::pollfd {
            fd: self.wake.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];

        for (fd, interest) in self.table.fd_interests() {
            let mut events = 0 as libc::c_short;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }

            fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }

        let n = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_to_ms(timeout),
            )
        };

        if n < 0 {
            let error = io::Error::last_os_error();

            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }

            return Err(error);
        }

        let mut signals = Vec::new();

        if fds[0].revents & libc::POLLIN != 0 {
            self.wake.drain(&mut signals);
        }

        for entry in &fds[1..] {
            let fault = entry.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            let readable = fault || entry.revents & libc::POLLIN != 0;
            let writable = fault || entry.revents & libc::POLLOUT != 0;

            if readable || writable {
                self.table.collect_fd(entry.fd, readable, writable, ready);
            }
        }

        for signo in signals {
            self.table.collect_signal(signo, ready);
        }

        Ok(())
    }

    fn waker(&self) -> Option<LoopWaker> {
        Some(self.wake.waker())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_pipe_read_readiness() {
        let mut backend = PollBackend::new().expect("failed to create poll backend");
        let (read_fd, write_fd) = pipe_pair();

        let watch = Watch {
            id: CallbackId(7),
            kind: WatchKind::Readable(read_fd),
        };
        backend.activate(&[watch]).expect("failed to activate");

        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut ready = Vec::new();
        backend
            .dispatch(Some(Duration::from_millis(100)), &mut ready)
            .expect("dispatch failed");
        assert_eq!(ready, vec![CallbackId(7)]);

        backend.deactivate(watch);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_write_readiness_on_fresh_pipe() {
        let mut backend = PollBackend::new().expect("failed to create poll backend");
        let (read_fd, write_fd) = pipe_pair();

        let watch = Watch {
            id: CallbackId(3),
            kind: WatchKind::Writable(write_fd),
        };
        backend.activate(&[watch]).expect("failed to activate");

        let mut ready = Vec::new();
        backend
            .dispatch(Some(Duration::from_millis(100)), &mut ready)
            .expect("dispatch failed");
        assert_eq!(ready, vec![CallbackId(3)], "an empty pipe is writable");

        backend.deactivate(watch);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
