//! Driver subsystem modules.

mod core;
mod info;
mod timer_queue;

pub use core::Driver;
pub use info::{DriverInfo, KindCounts, WatcherCounts};
