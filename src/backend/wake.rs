//! Self-pipe plumbing shared by the concrete backends.
//!
//! A single non-blocking pipe serves two purposes: cross-thread wakes (byte
//! 0) and signal delivery (the signal number as a byte, written from the
//! process signal handler). The handler is async-signal-safe: it loads one
//! atomic and calls `write`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Byte written for a plain cross-thread wake; signal numbers use their own
/// value (1..=64).
const WAKE_BYTE: u8 = 0;

const NSIG: usize = 65;

// Write-end slot per signal number. The slot owner is the backend that
// installed the handler; one signal watched from two drivers at once is
// undefined behavior.
static SIGNAL_WAKE_FDS: [AtomicI32; NSIG] = [const { AtomicI32::new(-1) }; NSIG];

extern "C" fn signal_trampoline(signo: libc::c_int) {
    if signo <= 0 || signo >= NSIG as libc::c_int {
        return;
    }

    let fd = SIGNAL_WAKE_FDS[signo as usize].load(Ordering::Relaxed);

    if fd >= 0 {
        let byte = signo as u8;
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

fn set_nonblocking_cloexec(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

/// The self-pipe. The read end is registered with the backend's probe; the
/// write end is shared with [`LoopWaker`]s and the signal handler.
pub(crate) struct WakePipe {
    reader: OwnedFd,
    writer: Arc<OwnedFd>,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];

        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        set_nonblocking_cloexec(fds[0]);
        set_nonblocking_cloexec(fds[1]);

        Ok(Self {
            reader: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            writer: Arc::new(unsafe { OwnedFd::from_raw_fd(fds[1]) }),
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    pub(crate) fn write_fd(&self) -> RawFd {
        self.writer.as_raw_fd()
    }

    pub(crate) fn waker(&self) -> LoopWaker {
        LoopWaker {
            writer: self.writer.clone(),
        }
    }

    /// Drains the pipe, recording the distinct signal numbers seen.
    pub(crate) fn drain(&self, signals: &mut Vec<i32>) {
        let mut buf = [0u8; 64];

        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };

            if n <= 0 {
                return;
            }

            for &byte in &buf[..n as usize] {
                if byte != WAKE_BYTE {
                    let signo = byte as i32;

                    if !signals.contains(&signo) {
                        signals.push(signo);
                    }
                }
            }

            if (n as usize) < buf.len() {
                return;
            }
        }
    }
}

/// Cross-thread wake handle: `wake` makes a blocking dispatch return early.
///
/// This is the loop's only thread-safe surface. The handle keeps the pipe's
/// write end alive on its own, so it stays safe to call after the driver is
/// gone (the wake is simply lost).
#[derive(Clone)]
pub struct LoopWaker {
    writer: Arc<OwnedFd>,
}

impl LoopWaker {
    pub fn wake(&self) {
        let byte = WAKE_BYTE;

        // A full pipe already has a wake pending; the result is ignored.
        unsafe {
            libc::write(
                self.writer.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
    }
}

/// Installs forwarding handlers with `sigaction` and restores the previous
/// disposition when the last watch for a signal goes away.
pub(crate) struct SignalRegistrar {
    wake_fd: RawFd,
    previous: HashMap<i32, libc::sigaction>,
}

impl SignalRegistrar {
    pub(crate) fn new(wake_fd: RawFd) -> Self {
        Self {
            wake_fd,
            previous: HashMap::new(),
        }
    }

    pub(crate) fn install(&mut self, signo: i32) {
        if self.previous.contains_key(&signo) {
            return;
        }

        SIGNAL_WAKE_FDS[signo as usize].store(self.wake_fd, Ordering::Relaxed);

        let trampoline: extern "C" fn(libc::c_int) = signal_trampoline;
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = trampoline as usize;
        action.sa_flags = libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::sigaction(signo, &action, &mut previous) };
        assert!(rc == 0, "sigaction({}) failed", signo);

        log::trace!("installed forwarding handler for signal {}", signo);
        self.previous.insert(signo, previous);
    }

    pub(crate) fn remove(&mut self, signo: i32) {
        if let Some(previous) = self.previous.remove(&signo) {
            unsafe { libc::sigaction(signo, &previous, std::ptr::null_mut()) };
            SIGNAL_WAKE_FDS[signo as usize].store(-1, Ordering::Relaxed);
            log::trace!("restored previous handler for signal {}", signo);
        }
    }
}

impl Drop for SignalRegistrar {
    fn drop(&mut self) {
        let installed: Vec<i32> = self.previous.keys().copied().collect();

        for signo in installed {
            self.remove(signo);
        }
    }
}
