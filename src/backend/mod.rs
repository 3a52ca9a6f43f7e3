//! Pluggable readiness backends.
//!
//! A backend observes file descriptors and signals on the driver's behalf;
//! it never decides callback state. Two implementations ship with the crate:
//! epoll on Linux and a portable `poll(2)` fallback. Timer deadlines are
//! owned by the driver, which folds the earliest one into the dispatch
//! timeout.

use crate::callback::CallbackId;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

#[cfg(target_os = "linux")]
mod epoll;
mod poll;
mod wake;

#[cfg(target_os = "linux")]
pub use epoll::EpollBackend;
pub use poll::PollBackend;
pub use wake::LoopWaker;
pub(crate) use wake::{SignalRegistrar, WakePipe};

/// A single observation request handed to the backend at activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watch {
    pub id: CallbackId,
    pub kind: WatchKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Readable(RawFd),
    Writable(RawFd),
    Signal(i32),
}

/// Readiness probe consumed by the driver.
///
/// `dispatch` appends the ids of due callbacks to `ready`, coalesced so each
/// callback appears at most once per call. With `timeout = None` it blocks
/// until an event or an external wake; `Some(Duration::ZERO)` polls without
/// blocking.
pub trait Backend {
    fn name(&self) -> &'static str;

    /// Begins observing each watch. I/O errors (e.g. a dead descriptor) are
    /// fatal to the driver.
    fn activate(&mut self, watches: &[Watch]) -> io::Result<()>;

    /// Stops observing a single watch.
    fn deactivate(&mut self, watch: Watch);

    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<CallbackId>)
        -> io::Result<()>;

    /// Whether `on_signal` registrations can be honored.
    fn supports_signals(&self) -> bool {
        true
    }

    /// Cross-thread wake handle, when the backend has one.
    fn waker(&self) -> Option<LoopWaker> {
        None
    }

    /// Backend-specific observable handle (e.g. the epoll descriptor).
    fn raw_handle(&self) -> Option<RawFd> {
        None
    }
}

/// Creates the best backend available on this platform.
pub(crate) fn create_backend() -> io::Result<Box<dyn Backend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollBackend::new()?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(Box::new(poll::PollBackend::new()?))
    }
}

/// Placeholder wired into a driver while the thread's implicit driver is
/// being replaced. Registration still works (it only touches the registry);
/// reaching activation or dispatch means a callback re-entered a driver that
/// is mid-teardown, which is fatal.
pub(crate) struct PanicBackend;

impl Backend for PanicBackend {
    fn name(&self) -> &'static str {
        "panic"
    }

    fn activate(&mut self, _watches: &[Watch]) -> io::Result<()> {
        panic!("the event loop driver is being replaced; no backend is installed");
    }

    fn deactivate(&mut self, _watch: Watch) {}

    fn dispatch(
        &mut self,
        _timeout: Option<Duration>,
        _ready: &mut Vec<CallbackId>,
    ) -> io::Result<()> {
        panic!("the event loop driver is being replaced; no backend is installed");
    }

    fn supports_signals(&self) -> bool {
        false
    }
}

/// Read/write interest in a single descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    pub(crate) fn any(self) -> bool {
        self.read || self.write
    }
}

/// fd and signal bookkeeping shared by the concrete backends.
pub(crate) struct WatchTable {
    reads: HashMap<RawFd, Vec<CallbackId>>,
    writes: HashMap<RawFd, Vec<CallbackId>>,
    signals: HashMap<i32, Vec<CallbackId>>,
}

impl WatchTable {
    pub(crate) fn new() -> Self {
        Self {
            reads: HashMap::new(),
            writes: HashMap::new(),
            signals: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, watch: Watch) {
        let slot = match watch.kind {
            WatchKind::Readable(fd) => self.reads.entry(fd).or_default(),
            WatchKind::Writable(fd) => self.writes.entry(fd).or_default(),
            WatchKind::Signal(signo) => self.signals.entry(signo).or_default(),
        };

        if !slot.contains(&watch.id) {
            slot.push(watch.id);
        }
    }

    pub(crate) fn remove(&mut self, watch: Watch) {
        fn remove_from<K: std::hash::Hash + Eq>(
            map: &mut HashMap<K, Vec<CallbackId>>,
            key: K,
            id: CallbackId,
        ) {
            if let Some(ids) = map.get_mut(&key) {
                ids.retain(|other| *other != id);

                if ids.is_empty() {
                    map.remove(&key);
                }
            }
        }

        match watch.kind {
            WatchKind::Readable(fd) => remove_from(&mut self.reads, fd, watch.id),
            WatchKind::Writable(fd) => remove_from(&mut self.writes, fd, watch.id),
            WatchKind::Signal(signo) => remove_from(&mut self.signals, signo, watch.id),
        }
    }

    pub(crate) fn interest(&self, fd: RawFd) -> Interest {
        Interest {
            read: self.reads.contains_key(&fd),
            write: self.writes.contains_key(&fd),
        }
    }

    /// Every watched descriptor with its current interest.
    pub(crate) fn fd_interests(&self) -> Vec<(RawFd, Interest)> {
        let mut interests: Vec<(RawFd, Interest)> = Vec::new();

        for &fd in self.reads.keys().chain(self.writes.keys()) {
            if !interests.iter().any(|(seen, _)| *seen == fd) {
                interests.push((fd, self.interest(fd)));
            }
        }

        interests
    }

    pub(crate) fn has_signal_watch(&self, signo: i32) -> bool {
        self.signals.contains_key(&signo)
    }

    /// Appends the callbacks watching `fd` for the directions that became
    /// ready, skipping ids already collected this dispatch.
    pub(crate) fn collect_fd(
        &self,
        fd: RawFd,
        readable: bool,
        writable: bool,
        ready: &mut Vec<CallbackId>,
    ) {
        if readable {
            if let Some(ids) = self.reads.get(&fd) {
                for &id in ids {
                    if !ready.contains(&id) {
                        ready.push(id);
                    }
                }
            }
        }

        if writable {
            if let Some(ids) = self.writes.get(&fd) {
                for &id in ids {
                    if !ready.contains(&id) {
                        ready.push(id);
                    }
                }
            }
        }
    }

    pub(crate) fn collect_signal(&self, signo: i32, ready: &mut Vec<CallbackId>) {
        if let Some(ids) = self.signals.get(&signo) {
            for &id in ids {
                if !ready.contains(&id) {
                    ready.push(id);
                }
            }
        }
    }
}

/// Converts a dispatch timeout into milliseconds for the probe syscalls.
/// Rounds up so a timer is never woken before its deadline; `None` means
/// block indefinitely.
pub(crate) fn timeout_to_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => {
            let ms = (duration.as_nanos() + 999_999) / 1_000_000;
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
