//! Single-threaded, cooperatively-scheduled event loop.
//!
//! User code registers callbacks for deferral, timers, I/O readiness and
//! process signals; the driver dispatches them in strictly-ordered tick
//! phases, with a microtask queue drained between every firing. A reference
//! count over the enabled callbacks decides when the loop is idle and `run`
//! returns; a suspension primitive parks imperative code against the loop
//! and resumes it with a value or error from within callbacks.
//!
//! # Architecture
//!
//! - **Driver**: owns all loop state and implements the tick algorithm
//! - **Registry**: callback records, their state machine and liveness counts
//! - **Backend**: pluggable readiness probe (epoll on Linux, `poll(2)` fallback)
//! - **Suspension**: parks the main context and resumes it across ticks
//! - **Accessor**: thread-wide implicit driver behind the crate-root free functions
//! - **DriverBuilder**: fluent construction with backend injection
//!
//! # Example
//! ```ignore
//! use std::time::Duration;
//!
//! pulse::defer(|_| println!("first tick"));
//! pulse::delay(Duration::from_millis(50), |_| println!("50ms later"));
//! pulse::run().unwrap();
//! ```

mod backend;
mod builder;
mod callback;
mod clock;
mod context;
mod driver;
mod error;
mod microtask;
mod registry;
mod suspension;

#[cfg(target_os = "linux")]
pub use backend::EpollBackend;
pub use backend::{Backend, LoopWaker, PollBackend, Watch, WatchKind};
pub use builder::DriverBuilder;
pub use callback::CallbackId;
pub use context::{
    cancel, current, defer, delay, disable, enable, info, is_running, now, on_readable, on_signal,
    on_writable, queue, reference, repeat, run, set_driver, set_error_handler, stop, suspension,
    unreference,
};
pub use driver::{Driver, DriverInfo, KindCounts, WatcherCounts};
pub use error::{Error, SuspendError, UserError};
pub use suspension::Suspension;
