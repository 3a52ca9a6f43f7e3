//! Level-triggered epoll backend for Linux.
//!
//! One epoll instance per driver; each watched descriptor carries the union
//! of its readable/writable interest. `EPOLLERR`/`EPOLLHUP` report the
//! descriptor to both directions' watchers so a dead peer still fires the
//! callbacks that could observe it.

use super::{
    timeout_to_ms, Backend, Interest, LoopWaker, SignalRegistrar, WakePipe, Watch, WatchKind,
    WatchTable,
};
use crate::callback::CallbackId;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

pub struct EpollBackend {
    epoll: OwnedFd,
    wake: WakePipe,
    signals: SignalRegistrar,
    table: WatchTable,
    events: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let epoll = unsafe { OwnedFd::from_raw_fd(fd) };
        let wake = WakePipe::new()?;

        // The wake pipe is a permanent read watch.
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake.read_fd() as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                wake.read_fd(),
                &mut event,
            )
        };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let signals = SignalRegistrar::new(wake.write_fd());

        Ok(Self {
            epoll,
            wake,
            signals,
            table: WatchTable::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; 64],
        })
    }

    /// Reconciles the kernel's interest in `fd` with the watch table after a
    /// watch was added or removed. `had` is the interest before the change.
    fn update_interest(&mut self, fd: RawFd, had: Interest) -> io::Result<()> {
        let now = self.table.interest(fd);

        let op = match (had.any(), now.any()) {
            (false, true) => libc::EPOLL_CTL_ADD,
            (true, true) if had != now => libc::EPOLL_CTL_MOD,
            (true, false) => libc::EPOLL_CTL_DEL,
            _ => return Ok(()),
        };

        let mut bits = 0u32;
        if now.read {
            bits |= libc::EPOLLIN as u32;
        }
        if now.write {
            bits |= libc::EPOLLOUT as u32;
        }

        let mut event = libc::epoll_event {
            events: bits,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn activate(&mut self, watches: &[Watch]) -> io::Result<()> {
        for &watch in watches {
            match watch.kind {
                WatchKind::Readable(fd) | WatchKind::Writable(fd) => {
                    let had = self.table.interest(fd);
                    self.table.add(watch);
                    self.update_interest(fd, had)?;
                }
                WatchKind::Signal(signo) => {
                    self.table.add(watch);
                    self.signals.install(signo);
                }
            }
        }

        Ok(())
    }

    fn deactivate(&mut self, watch: Watch) {
        match watch.kind {
            WatchKind::Readable(fd) | WatchKind::Writable(fd) => {
                let had = self.table.interest(fd);
                self.table.remove(watch);

                // The user may have closed the fd already; either way nothing
                // is watched afterwards.
                let _ = self.update_interest(fd, had);
            }
            WatchKind::Signal(signo) => {
                self.table.remove(watch);

                if !self.table.has_signal_watch(signo) {
                    self.signals.remove(signo);
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<CallbackId>,
    ) -> io::Result<()> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
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

        for i in 0..n as usize {
            let event = self.events[i];
            let fd = event.u64 as RawFd;

            if fd == self.wake.read_fd() {
                self.wake.drain(&mut signals);
                continue;
            }

            let bits = event.events;
            let fault = bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
            let readable = fault || bits & libc::EPOLLIN as u32 != 0;
            let writable = fault || bits & libc::EPOLLOUT as u32 != 0;

            self.table.collect_fd(fd, readable, writable, ready);
        }

        for signo in signals {
            self.table.collect_signal(signo, ready);
        }

        Ok(())
    }

    fn waker(&self) -> Option<LoopWaker> {
        Some(self.wake.waker())
    }

    fn raw_handle(&self) -> Option<RawFd> {
        Some(self.epoll.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_pipe_read_readiness() {
        let mut backend = EpollBackend::new().expect("failed to create epoll backend");
        let (read_fd, write_fd) = pipe_pair();

        let watch = Watch {
            id: CallbackId(1),
            kind: WatchKind::Readable(read_fd),
        };
        backend.activate(&[watch]).expect("failed to activate");

        unsafe {
            libc::write(write_fd, b"hello".as_ptr() as *const libc::c_void, 5);
        }

        let mut ready = Vec::new();
        backend
            .dispatch(Some(Duration::from_millis(100)), &mut ready)
            .expect("dispatch failed");
        assert_eq!(ready, vec![CallbackId(1)]);

        backend.deactivate(watch);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_nonblocking_dispatch_without_events() {
        let mut backend = EpollBackend::new().expect("failed to create epoll backend");

        let mut ready = Vec::new();
        backend
            .dispatch(Some(Duration::ZERO), &mut ready)
            .expect("dispatch failed");
        assert!(ready.is_empty());
    }

    #[test]
    fn test_waker_unblocks_dispatch() {
        let mut backend = EpollBackend::new().expect("failed to create epoll backend");
        let waker = backend.waker().expect("epoll backend has a waker");

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let mut ready = Vec::new();
        backend
            .dispatch(Some(Duration::from_secs(5)), &mut ready)
            .expect("dispatch failed");
        assert!(ready.is_empty(), "a wake is not a callback event");

        handle.join().unwrap();
    }
}
