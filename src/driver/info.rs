//! Snapshot of a driver's registered callbacks.

/// Enabled/disabled totals for one callback kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub enabled: usize,
    pub disabled: usize,
}

/// Liveness split of the enabled callbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherCounts {
    pub referenced: usize,
    pub unreferenced: usize,
}

/// Returned by [`Driver::info`](crate::Driver::info).
///
/// Invalidated callbacks are gone from the registry and count nowhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverInfo {
    pub defer: KindCounts,
    pub delay: KindCounts,
    pub repeat: KindCounts,
    pub on_readable: KindCounts,
    pub on_writable: KindCounts,
    pub on_signal: KindCounts,
    pub enabled_watchers: WatcherCounts,
    pub running: bool,
}
