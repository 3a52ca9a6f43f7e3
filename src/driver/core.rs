//! The scheduler/dispatcher at the heart of the loop.
//!
//! One tick walks a fixed sequence of phases: drain microtasks, activate
//! everything enabled since the last boundary, fire due defers, fire expired
//! timers, then let the backend dispatch I/O and signal readiness. Microtasks
//! drain again between every callback. The loop exits when the stop flag is
//! set or when no enabled+referenced callback remains and the microtask queue
//! is empty.
//!
//! All state lives behind a cheaply-cloneable handle; no `RefCell` borrow is
//! ever held across a user callback, so callbacks are free to register,
//! cancel, enable, disable and re-reference anything, including themselves.

use crate::backend::{create_backend, Backend, LoopWaker, PanicBackend};
use crate::callback::CallbackId;
use crate::clock::Clock;
use crate::error::{Error, UserError};
use crate::microtask::MicrotaskQueue;
use crate::registry::{Activation, Firing, Payload, Registry};

use super::info::DriverInfo;
use super::timer_queue::{TimerEntry, TimerQueue};

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

/// The event loop driver.
///
/// `Driver` is a handle: clones share one loop, and callbacks routinely keep
/// a clone to mutate the loop from inside a tick. It is intentionally not
/// `Send` — everything the loop does happens on the thread that created it,
/// and the only cross-thread surface is the [`LoopWaker`] from [`waker`].
///
/// [`waker`]: Driver::waker
#[derive(Clone)]
pub struct Driver {
    inner: Rc<Inner>,
}

struct Inner {
    clock: Clock,
    registry: RefCell<Registry>,
    microtasks: MicrotaskQueue,
    timers: RefCell<TimerQueue>,
    backend: RefCell<Box<dyn Backend>>,
    now_cache: Cell<Duration>,
    running: Cell<bool>,
    stopped: Cell<bool>,
    error_handler: RefCell<Option<Box<dyn FnMut(UserError)>>>,
}

// Clears the running flag even when a callback panic unwinds out of `run`.
struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Driver {
    /// Creates a driver with the best backend available on this platform.
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_backend(create_backend()?))
    }

    /// Creates a driver over an explicit backend.
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        log::debug!("event loop driver created (backend: {})", backend.name());

        let clock = Clock::new();
        let now = clock.now();

        Self {
            inner: Rc::new(Inner {
                clock,
                registry: RefCell::new(Registry::new()),
                microtasks: MicrotaskQueue::new(),
                timers: RefCell::new(TimerQueue::new()),
                backend: RefCell::new(backend),
                now_cache: Cell::new(now),
                running: Cell::new(false),
                stopped: Cell::new(false),
                error_handler: RefCell::new(None),
            }),
        }
    }

    /// Placeholder driver installed while the implicit driver is swapped.
    pub(crate) fn placeholder() -> Self {
        Self::with_backend(Box::new(PanicBackend))
    }

    /// Appends a microtask, run at the next phase boundary.
    ///
    /// Microtasks cannot be disabled, unreferenced or cancelled, and a
    /// microtask that enqueues another runs it within the same drain pass —
    /// a self-re-enqueueing microtask therefore loops forever.
    pub fn queue(&self, f: impl FnOnce() + 'static) {
        self.inner.microtasks.push(Box::new(f));
    }

    /// Registers a callback fired once in the next tick.
    ///
    /// The id is invalidated before the callback runs.
    pub fn defer(&self, callback: impl FnOnce(CallbackId) + 'static) -> CallbackId {
        self.inner.registry.borrow_mut().insert(Payload::Defer {
            callback: Some(Box::new(callback)),
        })
    }

    /// Registers a callback fired once, no earlier than `delay` from now.
    ///
    /// The id is invalidated before the callback runs.
    pub fn delay(&self, delay: Duration, callback: impl FnOnce(CallbackId) + 'static) -> CallbackId {
        let now = self.refresh_now();

        self.inner.registry.borrow_mut().insert(Payload::Delay {
            delay,
            expiration: now + delay,
            callback: Some(Box::new(callback)),
        })
    }

    /// Registers a callback fired every `interval`, re-armed from the time
    /// each invocation finishes. Missed intervals do not stack: a repeat
    /// fires at most once per tick.
    pub fn repeat(
        &self,
        interval: Duration,
        callback: impl FnMut(CallbackId) + 'static,
    ) -> CallbackId {
        let now = self.refresh_now();

        self.inner.registry.borrow_mut().insert(Payload::Repeat {
            interval,
            next_expiration: now + interval,
            callback: Some(Box::new(callback)),
        })
    }

    /// Registers a callback fired whenever `fd` is ready for reading.
    ///
    /// The loop does not own `fd`; closing it without cancelling the callback
    /// is undefined.
    pub fn on_readable(
        &self,
        fd: RawFd,
        callback: impl FnMut(CallbackId, RawFd) + 'static,
    ) -> CallbackId {
        self.inner.registry.borrow_mut().insert(Payload::Readable {
            fd,
            callback: Some(Box::new(callback)),
        })
    }

    /// Registers a callback fired whenever `fd` is ready for writing.
    pub fn on_writable(
        &self,
        fd: RawFd,
        callback: impl FnMut(CallbackId, RawFd) + 'static,
    ) -> CallbackId {
        self.inner.registry.borrow_mut().insert(Payload::Writable {
            fd,
            callback: Some(Box::new(callback)),
        })
    }

    /// Registers a callback fired whenever `signal` is delivered to the
    /// process. Watching the same signal from two drivers at once is
    /// undefined behavior.
    pub fn on_signal(
        &self,
        signal: i32,
        callback: impl FnMut(CallbackId, i32) + 'static,
    ) -> Result<CallbackId, Error> {
        {
            let backend = self.inner.backend.borrow();

            if !backend.supports_signals() {
                return Err(Error::UnsupportedFeature("signal handling", backend.name()));
            }
        }

        if !(1..=64).contains(&signal) {
            return Err(Error::InvalidState("signal number must be in 1..=64"));
        }

        Ok(self.inner.registry.borrow_mut().insert(Payload::Signal {
            signal,
            callback: Some(Box::new(callback)),
        }))
    }

    /// Re-enables a disabled callback. The callback becomes eligible for
    /// dispatch in the next tick, never the current one; timer expirations
    /// are re-anchored at the current time.
    pub fn enable(&self, id: CallbackId) -> Result<(), Error> {
        let now = self.refresh_now();
        self.inner.registry.borrow_mut().enable(id, now)
    }

    /// Disables a callback, effective immediately: a disabled callback does
    /// not fire in the current tick even if it was already due. Silent on
    /// unknown ids.
    pub fn disable(&self, id: CallbackId) {
        let watch = self.inner.registry.borrow_mut().disable(id);

        if let Some(watch) = watch {
            self.inner.backend.borrow_mut().deactivate(watch);
        }
    }

    /// Cancels a callback for good. Effective immediately, idempotent, and
    /// silent on unknown ids.
    pub fn cancel(&self, id: CallbackId) {
        let watch = self.inner.registry.borrow_mut().cancel(id);

        if let Some(watch) = watch {
            self.inner.backend.borrow_mut().deactivate(watch);
        }
    }

    /// Marks a callback as keeping the loop alive (the default).
    pub fn reference(&self, id: CallbackId) -> Result<(), Error> {
        self.inner.registry.borrow_mut().reference(id)
    }

    /// Marks a callback as not keeping the loop alive. Unreferenced callbacks
    /// still fire while something else keeps the loop running.
    pub fn unreference(&self, id: CallbackId) -> Result<(), Error> {
        self.inner.registry.borrow_mut().unreference(id)
    }

    /// Installs the error handler, returning the previous one.
    ///
    /// The handler receives the panics of user callbacks and microtasks.
    /// Without a handler (or when the handler itself panics) the payload
    /// unwinds out of [`run`](Driver::run) and stops the loop.
    pub fn set_error_handler(
        &self,
        handler: Option<Box<dyn FnMut(UserError)>>,
    ) -> Option<Box<dyn FnMut(UserError)>> {
        std::mem::replace(&mut *self.inner.error_handler.borrow_mut(), handler)
    }

    /// Snapshot of per-kind and liveness counts.
    pub fn info(&self) -> DriverInfo {
        self.inner
            .registry
            .borrow()
            .snapshot(self.inner.running.get())
    }

    /// The loop's cached monotonic time, as an offset from driver creation.
    /// Refreshed at tick phase boundaries and on registration.
    pub fn now(&self) -> Duration {
        self.inner.now_cache.get()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Backend-specific observable handle (e.g. the epoll descriptor).
    pub fn handle(&self) -> Option<RawFd> {
        self.inner.backend.borrow().raw_handle()
    }

    /// Cross-thread wake handle, when the backend has one.
    pub fn waker(&self) -> Option<LoopWaker> {
        self.inner.backend.borrow().waker()
    }

    /// Asks the loop to return after the current tick.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
    }

    /// Runs the loop until it is stopped or drained: no enabled+referenced
    /// callback left and no pending microtask.
    ///
    /// Fails with `InvalidState` when called re-entrantly, including from
    /// within a callback.
    pub fn run(&self) -> Result<(), Error> {
        self.run_while(|| true)
    }

    /// `run` with an extra continuation predicate, checked between ticks.
    /// Suspensions use this to park until their result arrives.
    pub(crate) fn run_while(&self, mut keep_going: impl FnMut() -> bool) -> Result<(), Error> {
        if self.inner.running.get() {
            return Err(Error::InvalidState("the event loop is already running"));
        }

        self.inner.stopped.set(false);
        self.inner.running.set(true);
        let _guard = RunningGuard(&self.inner.running);

        while keep_going() && !self.inner.stopped.get() && !self.is_drained() {
            self.tick();
        }

        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.inner.registry.borrow().enabled_referenced() == 0 && self.inner.microtasks.is_empty()
    }

    /// Tears down every registration and replaces the backend, dropping its
    /// watches, descriptors and signal handlers. Used when the thread's
    /// implicit driver is replaced.
    pub(crate) fn reclaim(&self) {
        self.inner.registry.borrow_mut().clear();
        self.inner.microtasks.clear();
        self.inner.timers.borrow_mut().clear();
        *self.inner.backend.borrow_mut() = Box::new(PanicBackend);
    }

    fn refresh_now(&self) -> Duration {
        let now = self.inner.clock.now();
        self.inner.now_cache.set(now);
        now
    }

    fn tick(&self) {
        self.drain_microtasks();

        // Activation: everything enabled since the last tick boundary becomes
        // visible to dispatch. Nothing activated here may fire before the
        // phases below run, which is what keeps same-tick enablement out.
        let pending = self.inner.registry.borrow_mut().take_pending();
        let mut due_defers: Vec<(u64, CallbackId)> = Vec::new();
        let mut watches = Vec::new();

        {
            let mut registry = self.inner.registry.borrow_mut();
            let mut timers = self.inner.timers.borrow_mut();

            for id in pending {
                match registry.activate(id) {
                    Some(Activation::Defer { seq }) => due_defers.push((seq, id)),
                    Some(Activation::Timer { expiration, seq }) => timers.push(TimerEntry {
                        expiration,
                        enable_seq: seq,
                        id,
                    }),
                    Some(Activation::Watch(watch)) => watches.push(watch),
                    None => {}
                }
            }
        }

        if !watches.is_empty() {
            self.inner
                .backend
                .borrow_mut()
                .activate(&watches)
                .expect("backend failed to activate watches");
        }

        // Defers, in enablement order, invalidated before each call.
        due_defers.sort_unstable();

        for (_, id) in due_defers {
            let firing = self.inner.registry.borrow_mut().begin_fire(id);

            if let Some(Firing::Once(callback)) = firing {
                self.invoke(move || callback(id));
                self.drain_microtasks();
            }
        }

        // Expired timers, ascending by expiration.
        let mut now = self.refresh_now();

        loop {
            let entry = self.inner.timers.borrow_mut().pop_due(now);
            let Some(entry) = entry else { break };

            if !self.inner.registry.borrow().timer_entry_live(
                entry.id,
                entry.enable_seq,
                entry.expiration,
            ) {
                continue;
            }

            let firing = self.inner.registry.borrow_mut().begin_fire(entry.id);

            match firing {
                Some(Firing::Once(callback)) => {
                    let id = entry.id;
                    self.invoke(move || callback(id));
                }
                Some(Firing::Repeat(mut callback)) => {
                    let result = catch_unwind(AssertUnwindSafe(|| callback(entry.id)));

                    // Re-arm from the post-invocation clock, then restore the
                    // callable, before any error routing can unwind.
                    now = self.refresh_now();
                    let rearmed =
                        self.inner
                            .registry
                            .borrow_mut()
                            .finish_repeat(entry.id, callback, now);

                    if let Some((expiration, enable_seq)) = rearmed {
                        self.inner.timers.borrow_mut().push(TimerEntry {
                            expiration,
                            enable_seq,
                            id: entry.id,
                        });
                    }

                    if let Err(payload) = result {
                        self.handle_user_panic(payload);
                    }
                }
                _ => continue,
            }

            self.drain_microtasks();
            now = self.refresh_now();
        }

        // I/O and signals. Blocking is only allowed when this tick produced
        // no new work for the next one and the loop will survive the exit
        // check; a blocking dispatch is still bounded by the earliest live
        // timer deadline.
        let blocking = self.inner.microtasks.is_empty()
            && self.inner.registry.borrow().pending_is_empty()
            && !self.inner.stopped.get()
            && self.inner.registry.borrow().enabled_referenced() > 0;

        let timeout = if blocking {
            let registry = self.inner.registry.borrow();
            self.inner
                .timers
                .borrow_mut()
                .next_deadline(|head| {
                    registry.timer_entry_live(head.id, head.enable_seq, head.expiration)
                })
                .map(|deadline| deadline.saturating_sub(now))
        } else {
            Some(Duration::ZERO)
        };

        let mut ready = Vec::new();
        self.inner
            .backend
            .borrow_mut()
            .dispatch(timeout, &mut ready)
            .expect("backend dispatch failed");

        {
            let registry = self.inner.registry.borrow();
            ready.sort_by_key(|id| registry.enable_seq_of(*id));
        }

        for id in ready {
            let firing = self.inner.registry.borrow_mut().begin_fire(id);

            match firing {
                Some(Firing::Io(mut callback, fd)) => {
                    let result = catch_unwind(AssertUnwindSafe(|| callback(id, fd)));
                    self.inner.registry.borrow_mut().restore_io(id, callback);

                    if let Err(payload) = result {
                        self.handle_user_panic(payload);
                    }
                }
                Some(Firing::Signal(mut callback, signal)) => {
                    let result = catch_unwind(AssertUnwindSafe(|| callback(id, signal)));
                    self.inner.registry.borrow_mut().restore_signal(id, callback);

                    if let Err(payload) = result {
                        self.handle_user_panic(payload);
                    }
                }
                _ => continue,
            }

            self.drain_microtasks();
        }
    }

    fn drain_microtasks(&self) {
        while let Some(task) = self.inner.microtasks.pop() {
            self.invoke(task);
        }
    }

    /// Runs a user callable, routing its panic to the error handler.
    fn invoke(&self, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            self.handle_user_panic(payload);
        }
    }

    fn handle_user_panic(&self, payload: Box<dyn std::any::Any + Send>) {
        // Taken out of the slot so the handler can use the driver freely.
        let handler = self.inner.error_handler.borrow_mut().take();

        match handler {
            Some(mut handler) => {
                log::error!("user callback panicked; routing to the error handler");

                match catch_unwind(AssertUnwindSafe(|| handler(UserError::new(payload)))) {
                    Ok(()) => {
                        let mut slot = self.inner.error_handler.borrow_mut();

                        // The handler may have installed a replacement.
                        if slot.is_none() {
                            *slot = Some(handler);
                        }
                    }
                    Err(handler_payload) => {
                        self.inner.stopped.set(true);
                        resume_unwind(handler_payload);
                    }
                }
            }
            None => {
                self.inner.stopped.set(true);
                resume_unwind(payload);
            }
        }
    }
}
