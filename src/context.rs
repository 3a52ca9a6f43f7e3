//! Thread-wide implicit driver and the facade free functions.
//!
//! Each thread gets one lazily-constructed driver; the free functions at the
//! crate root delegate to it, so simple programs never construct a [`Driver`]
//! by hand. The implicit driver can be replaced with [`set_driver`] while the
//! loop is quiescent.

use crate::builder::DriverBuilder;
use crate::callback::CallbackId;
use crate::driver::{Driver, DriverInfo};
use crate::error::{Error, UserError};
use crate::suspension::Suspension;

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::time::Duration;

thread_local! {
    /// The thread's implicit driver, created lazily on first use.
    static CURRENT_DRIVER: RefCell<Option<Driver>> = const { RefCell::new(None) };
}

/// Returns the thread's implicit driver, constructing it on first use.
///
/// # Panics
/// Panics if no backend can be constructed (e.g. descriptor exhaustion).
pub fn current() -> Driver {
    CURRENT_DRIVER.with(|cell| {
        let mut current = cell.borrow_mut();

        if current.is_none() {
            let driver = DriverBuilder::new()
                .build()
                .expect("failed to construct the default event loop backend");
            *current = Some(driver);
        }

        current.as_ref().expect("driver just installed").clone()
    })
}

/// Replaces the thread's implicit driver, returning the previous one.
///
/// Fails with `InvalidState` while a driver is running. During the swap a
/// placeholder driver is installed whose backend rejects activation and
/// dispatch, the old driver's registrations are reclaimed (dropping its
/// watches, descriptors and signal handlers), and only then is the new
/// driver exposed — so callbacks torn down mid-swap cannot re-enter the old
/// loop.
pub fn set_driver(driver: Driver) -> Result<Option<Driver>, Error> {
    CURRENT_DRIVER.with(|cell| {
        {
            let current = cell.borrow();

            if let Some(existing) = current.as_ref() {
                if existing.is_running() {
                    return Err(Error::InvalidState(
                        "cannot replace the event loop driver while it is running",
                    ));
                }
            }
        }

        let previous = cell.borrow_mut().replace(Driver::placeholder());

        if let Some(previous) = &previous {
            log::debug!("replacing the event loop driver");
            previous.reclaim();
        }

        *cell.borrow_mut() = Some(driver);
        Ok(previous)
    })
}

/// Appends a microtask to the implicit driver. See [`Driver::queue`].
pub fn queue(f: impl FnOnce() + 'static) {
    current().queue(f)
}

/// Registers a defer callback on the implicit driver. See [`Driver::defer`].
pub fn defer(callback: impl FnOnce(CallbackId) + 'static) -> CallbackId {
    current().defer(callback)
}

/// Registers a one-shot timer on the implicit driver. See [`Driver::delay`].
pub fn delay(after: Duration, callback: impl FnOnce(CallbackId) + 'static) -> CallbackId {
    current().delay(after, callback)
}

/// Registers a repeating timer on the implicit driver. See
/// [`Driver::repeat`].
pub fn repeat(interval: Duration, callback: impl FnMut(CallbackId) + 'static) -> CallbackId {
    current().repeat(interval, callback)
}

/// Registers a read-readiness watch on the implicit driver. See
/// [`Driver::on_readable`].
pub fn on_readable(fd: RawFd, callback: impl FnMut(CallbackId, RawFd) + 'static) -> CallbackId {
    current().on_readable(fd, callback)
}

/// Registers a write-readiness watch on the implicit driver. See
/// [`Driver::on_writable`].
pub fn on_writable(fd: RawFd, callback: impl FnMut(CallbackId, RawFd) + 'static) -> CallbackId {
    current().on_writable(fd, callback)
}

/// Registers a signal watch on the implicit driver. See
/// [`Driver::on_signal`].
pub fn on_signal(
    signal: i32,
    callback: impl FnMut(CallbackId, i32) + 'static,
) -> Result<CallbackId, Error> {
    current().on_signal(signal, callback)
}

/// See [`Driver::enable`].
pub fn enable(id: CallbackId) -> Result<(), Error> {
    current().enable(id)
}

/// See [`Driver::disable`].
pub fn disable(id: CallbackId) {
    current().disable(id)
}

/// See [`Driver::cancel`].
pub fn cancel(id: CallbackId) {
    current().cancel(id)
}

/// See [`Driver::reference`].
pub fn reference(id: CallbackId) -> Result<(), Error> {
    current().reference(id)
}

/// See [`Driver::unreference`].
pub fn unreference(id: CallbackId) -> Result<(), Error> {
    current().unreference(id)
}

/// See [`Driver::set_error_handler`].
pub fn set_error_handler(
    handler: Option<Box<dyn FnMut(UserError)>>,
) -> Option<Box<dyn FnMut(UserError)>> {
    current().set_error_handler(handler)
}

/// See [`Driver::info`].
pub fn info() -> DriverInfo {
    current().info()
}

/// Runs the implicit driver. See [`Driver::run`].
pub fn run() -> Result<(), Error> {
    current().run()
}

/// See [`Driver::stop`].
pub fn stop() {
    current().stop()
}

/// See [`Driver::is_running`].
pub fn is_running() -> bool {
    current().is_running()
}

/// See [`Driver::now`].
pub fn now() -> Duration {
    current().now()
}

/// Creates a suspension bound to the implicit driver's main context.
pub fn suspension<T>() -> Suspension<T> {
    Suspension::new(&current())
}
