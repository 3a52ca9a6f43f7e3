//! In-memory data model for registered callbacks.
//!
//! The registry owns every callback record, the pending-activation queue and
//! the enabled-referenced count that decides loop liveness. Invalidation is
//! represented by removal: ids are never reused, so an absent id below the
//! allocation watermark is exactly "invalidated".
//!
//! Records are mutated re-entrantly from inside user callbacks, so dispatch
//! follows a take/restore protocol: the callable is moved out of its record
//! before the call and put back afterwards, and a record that disappeared in
//! between (cancelled from within the callback) simply swallows the restore.

use crate::backend::{Watch, WatchKind};
use crate::callback::{CallbackId, IoCallback, OnceCallback, RepeatCallback, SignalCallback};
use crate::driver::{DriverInfo, KindCounts};
use crate::error::Error;

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;

/// Kind-specific payload of a callback record.
pub(crate) enum Payload {
    Defer {
        callback: Option<OnceCallback>,
    },
    Delay {
        delay: Duration,
        expiration: Duration,
        callback: Option<OnceCallback>,
    },
    Repeat {
        interval: Duration,
        next_expiration: Duration,
        callback: Option<RepeatCallback>,
    },
    Readable {
        fd: RawFd,
        callback: Option<IoCallback>,
    },
    Writable {
        fd: RawFd,
        callback: Option<IoCallback>,
    },
    Signal {
        signal: i32,
        callback: Option<SignalCallback>,
    },
}

impl Payload {
    /// The backend watch this payload corresponds to, for the kinds a
    /// backend observes.
    fn watch(&self, id: CallbackId) -> Option<Watch> {
        let kind = match *self {
            Payload::Readable { fd, .. } => WatchKind::Readable(fd),
            Payload::Writable { fd, .. } => WatchKind::Writable(fd),
            Payload::Signal { signal, .. } => WatchKind::Signal(signal),
            _ => return None,
        };

        Some(Watch { id, kind })
    }
}

/// A single registered callback.
///
/// `enabled` and `referenced` are orthogonal; `activated` implies `enabled`
/// and means the callback has crossed a tick boundary and is visible to the
/// backend. `enable_seq` is reassigned on every enablement and defines FIFO
/// order within a tick phase.
pub(crate) struct CallbackRecord {
    pub(crate) payload: Payload,
    pub(crate) enabled: bool,
    pub(crate) referenced: bool,
    pub(crate) activated: bool,
    pub(crate) enable_seq: u64,
}

/// What the driver must do with a callback that just activated.
pub(crate) enum Activation {
    Defer { seq: u64 },
    Timer { expiration: Duration, seq: u64 },
    Watch(Watch),
}

/// A validated, ready-to-run callable extracted from its record.
pub(crate) enum Firing {
    /// Defer or delay; the record is already invalidated.
    Once(OnceCallback),
    Repeat(RepeatCallback),
    Io(IoCallback, RawFd),
    Signal(SignalCallback, i32),
}

pub(crate) struct Registry {
    callbacks: HashMap<CallbackId, CallbackRecord>,
    next_id: u64,
    next_seq: u64,
    /// Ids enabled since the last tick boundary, in enablement order.
    pending: Vec<CallbackId>,
    enabled_referenced: usize,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            callbacks: HashMap::new(),
            next_id: 1,
            next_seq: 0,
            pending: Vec::new(),
            enabled_referenced: 0,
        }
    }

    /// Registers a new callback, enabled and referenced.
    pub(crate) fn insert(&mut self, payload: Payload) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;

        let enable_seq = self.next_seq;
        self.next_seq += 1;

        self.callbacks.insert(
            id,
            CallbackRecord {
                payload,
                enabled: true,
                referenced: true,
                activated: false,
                enable_seq,
            },
        );
        self.pending.push(id);
        self.enabled_referenced += 1;

        id
    }

    #[cfg(test)]
    fn contains(&self, id: CallbackId) -> bool {
        self.callbacks.contains_key(&id)
    }

    /// Re-enables a disabled callback; no-op when already enabled.
    ///
    /// Timer expirations are re-anchored at `now`, and activation is deferred
    /// to the next tick boundary via the pending queue.
    pub(crate) fn enable(&mut self, id: CallbackId, now: Duration) -> Result<(), Error> {
        let record = self
            .callbacks
            .get_mut(&id)
            .ok_or(Error::InvalidCallback(id))?;

        if record.enabled {
            return Ok(());
        }

        record.enabled = true;
        record.enable_seq = self.next_seq;
        self.next_seq += 1;

        match &mut record.payload {
            Payload::Delay {
                delay, expiration, ..
            } => *expiration = now + *delay,
            Payload::Repeat {
                interval,
                next_expiration,
                ..
            } => *next_expiration = now + *interval,
            _ => {}
        }

        self.pending.push(id);

        if record.referenced {
            self.enabled_referenced += 1;
        }

        Ok(())
    }

    /// Disables a callback; silent on unknown ids, no-op when already
    /// disabled. Returns the backend watch to drop, if one was active.
    pub(crate) fn disable(&mut self, id: CallbackId) -> Option<Watch> {
        let record = self.callbacks.get_mut(&id)?;

        if !record.enabled {
            return None;
        }

        record.enabled = false;

        if record.referenced {
            self.enabled_referenced -= 1;
        }

        if record.activated {
            record.activated = false;
            record.payload.watch(id)
        } else {
            None
        }
    }

    /// Removes a callback for good; silent on unknown ids. Returns the
    /// backend watch to drop, if one was active.
    pub(crate) fn cancel(&mut self, id: CallbackId) -> Option<Watch> {
        let record = self.callbacks.remove(&id)?;

        if record.enabled && record.referenced {
            self.enabled_referenced -= 1;
        }

        if record.activated {
            record.payload.watch(id)
        } else {
            None
        }
    }

    pub(crate) fn reference(&mut self, id: CallbackId) -> Result<(), Error> {
        let record = self
            .callbacks
            .get_mut(&id)
            .ok_or(Error::InvalidCallback(id))?;

        if !record.referenced {
            record.referenced = true;

            if record.enabled {
                self.enabled_referenced += 1;
            }
        }

        Ok(())
    }

    pub(crate) fn unreference(&mut self, id: CallbackId) -> Result<(), Error> {
        let record = self
            .callbacks
            .get_mut(&id)
            .ok_or(Error::InvalidCallback(id))?;

        if record.referenced {
            record.referenced = false;

            if record.enabled {
                self.enabled_referenced -= 1;
            }
        }

        Ok(())
    }

    /// Takes the ids enabled since the last tick boundary, in order.
    pub(crate) fn take_pending(&mut self) -> Vec<CallbackId> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn enabled_referenced(&self) -> usize {
        self.enabled_referenced
    }

    /// Marks `id` activated and describes what the driver must do with it.
    ///
    /// Returns `None` for ids that were cancelled or disabled while pending,
    /// and for duplicate pending entries of an already-activated id.
    pub(crate) fn activate(&mut self, id: CallbackId) -> Option<Activation> {
        let record = self.callbacks.get_mut(&id)?;

        if !record.enabled || record.activated {
            return None;
        }

        record.activated = true;

        let activation = match record.payload {
            Payload::Defer { .. } => Activation::Defer {
                seq: record.enable_seq,
            },
            Payload::Delay { expiration, .. } => Activation::Timer {
                expiration,
                seq: record.enable_seq,
            },
            Payload::Repeat {
                next_expiration, ..
            } => Activation::Timer {
                expiration: next_expiration,
                seq: record.enable_seq,
            },
            Payload::Readable { fd, .. } => Activation::Watch(Watch {
                id,
                kind: WatchKind::Readable(fd),
            }),
            Payload::Writable { fd, .. } => Activation::Watch(Watch {
                id,
                kind: WatchKind::Writable(fd),
            }),
            Payload::Signal { signal, .. } => Activation::Watch(Watch {
                id,
                kind: WatchKind::Signal(signal),
            }),
        };

        Some(activation)
    }

    /// Whether a timer-queue entry still refers to a live deadline.
    pub(crate) fn timer_entry_live(
        &self,
        id: CallbackId,
        enable_seq: u64,
        expiration: Duration,
    ) -> bool {
        match self.callbacks.get(&id) {
            Some(record)
                if record.enabled && record.activated && record.enable_seq == enable_seq =>
            {
                match &record.payload {
                    Payload::Delay { expiration: e, .. } => *e == expiration,
                    Payload::Repeat {
                        next_expiration: e, ..
                    } => *e == expiration,
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Enablement order key for dispatch sorting; absent ids sort last.
    pub(crate) fn enable_seq_of(&self, id: CallbackId) -> u64 {
        self.callbacks
            .get(&id)
            .map(|record| record.enable_seq)
            .unwrap_or(u64::MAX)
    }

    /// Validates `id` for dispatch and extracts its callable.
    ///
    /// One-shot kinds (defer, delay) are invalidated here, before the caller
    /// invokes them. Returns `None` when the callback was cancelled or
    /// disabled since it became due.
    pub(crate) fn begin_fire(&mut self, id: CallbackId) -> Option<Firing> {
        let record = self.callbacks.get_mut(&id)?;

        if !record.enabled || !record.activated {
            return None;
        }

        match &mut record.payload {
            Payload::Defer { .. } | Payload::Delay { .. } => {}
            Payload::Repeat { callback, .. } => {
                return callback.take().map(Firing::Repeat);
            }
            Payload::Readable { fd, callback } | Payload::Writable { fd, callback } => {
                let fd = *fd;
                return callback.take().map(|callback| Firing::Io(callback, fd));
            }
            Payload::Signal { signal, callback } => {
                let signal = *signal;
                return callback
                    .take()
                    .map(|callback| Firing::Signal(callback, signal));
            }
        }

        // One-shot kinds: the id is invalid from the callback's point of view.
        let record = self.callbacks.remove(&id)?;

        if record.referenced {
            self.enabled_referenced -= 1;
        }

        match record.payload {
            Payload::Defer { callback } | Payload::Delay { callback, .. } => {
                callback.map(Firing::Once)
            }
            _ => None,
        }
    }

    /// Puts a repeat callable back and re-arms its deadline at `now`.
    ///
    /// Returns the new heap entry data when the callback is still enabled and
    /// activated (i.e. was not disabled or cancelled from within itself).
    pub(crate) fn finish_repeat(
        &mut self,
        id: CallbackId,
        callback: RepeatCallback,
        now: Duration,
    ) -> Option<(Duration, u64)> {
        let record = self.callbacks.get_mut(&id)?;

        if let Payload::Repeat {
            interval,
            next_expiration,
            callback: slot,
        } = &mut record.payload
        {
            *slot = Some(callback);
            *next_expiration = now + *interval;

            if record.enabled && record.activated {
                return Some((*next_expiration, record.enable_seq));
            }
        }

        None
    }

    /// Puts an I/O callable back after dispatch; no-op when the record was
    /// cancelled from within the callback.
    pub(crate) fn restore_io(&mut self, id: CallbackId, callback: IoCallback) {
        if let Some(record) = self.callbacks.get_mut(&id) {
            if let Payload::Readable { callback: slot, .. } | Payload::Writable { callback: slot, .. } =
                &mut record.payload
            {
                *slot = Some(callback);
            }
        }
    }

    /// Puts a signal callable back after dispatch.
    pub(crate) fn restore_signal(&mut self, id: CallbackId, callback: SignalCallback) {
        if let Some(record) = self.callbacks.get_mut(&id) {
            if let Payload::Signal { callback: slot, .. } = &mut record.payload {
                *slot = Some(callback);
            }
        }
    }

    /// Drops every record and pending entry. Id allocation keeps going from
    /// the watermark so reclaimed ids stay invalid forever.
    pub(crate) fn clear(&mut self) {
        self.callbacks.clear();
        self.pending.clear();
        self.enabled_referenced = 0;
    }

    /// Snapshot of per-kind and liveness counts.
    pub(crate) fn snapshot(&self, running: bool) -> DriverInfo {
        let mut info = DriverInfo {
            running,
            ..DriverInfo::default()
        };

        for record in self.callbacks.values() {
            let counts: &mut KindCounts = match record.payload {
                Payload::Defer { .. } => &mut info.defer,
                Payload::Delay { .. } => &mut info.delay,
                Payload::Repeat { .. } => &mut info.repeat,
                Payload::Readable { .. } => &mut info.on_readable,
                Payload::Writable { .. } => &mut info.on_writable,
                Payload::Signal { .. } => &mut info.on_signal,
            };

            if record.enabled {
                counts.enabled += 1;

                if record.referenced {
                    info.enabled_watchers.referenced += 1;
                } else {
                    info.enabled_watchers.unreferenced += 1;
                }
            } else {
                counts.disabled += 1;
            }
        }

        info
    }

    #[cfg(test)]
    fn scan_enabled_referenced(&self) -> usize {
        self.callbacks
            .values()
            .filter(|record| record.enabled && record.referenced)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defer_payload() -> Payload {
        Payload::Defer {
            callback: Some(Box::new(|_| {})),
        }
    }

    fn delay_payload(delay: Duration, now: Duration) -> Payload {
        Payload::Delay {
            delay,
            expiration: now + delay,
            callback: Some(Box::new(|_| {})),
        }
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let mut registry = Registry::new();
        let first = registry.insert(defer_payload());
        let second = registry.insert(defer_payload());

        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn test_count_tracks_enable_disable_reference() {
        let mut registry = Registry::new();
        let id = registry.insert(delay_payload(Duration::from_secs(1), Duration::ZERO));
        assert_eq!(registry.enabled_referenced(), 1);

        registry.unreference(id).unwrap();
        assert_eq!(registry.enabled_referenced(), 0);

        registry.reference(id).unwrap();
        registry.disable(id);
        assert_eq!(registry.enabled_referenced(), 0);

        registry.enable(id, Duration::from_secs(2)).unwrap();
        assert_eq!(registry.enabled_referenced(), 1);

        registry.cancel(id);
        assert_eq!(registry.enabled_referenced(), 0);
    }

    #[test]
    fn test_count_matches_full_scan() {
        let mut registry = Registry::new();
        let ids: Vec<_> = (0..8).map(|_| registry.insert(defer_payload())).collect();

        registry.unreference(ids[0]).unwrap();
        registry.disable(ids[1]);
        registry.disable(ids[2]);
        registry.unreference(ids[2]).unwrap();
        registry.cancel(ids[3]);

        assert_eq!(registry.enabled_referenced(), registry.scan_enabled_referenced());
    }

    #[test]
    fn test_begin_fire_invalidates_one_shot_kinds() {
        let mut registry = Registry::new();
        let id = registry.insert(defer_payload());

        for pending in registry.take_pending() {
            registry.activate(pending);
        }

        assert!(matches!(registry.begin_fire(id), Some(Firing::Once(_))));
        assert!(!registry.contains(id));
        assert_eq!(registry.enabled_referenced(), 0);

        // A second fire attempt finds nothing.
        assert!(registry.begin_fire(id).is_none());
    }

    #[test]
    fn test_begin_fire_skips_disabled_callbacks() {
        let mut registry = Registry::new();
        let id = registry.insert(defer_payload());

        for pending in registry.take_pending() {
            registry.activate(pending);
        }

        registry.disable(id);
        assert!(registry.begin_fire(id).is_none());
        assert!(registry.contains(id));
    }

    #[test]
    fn test_activation_is_gated_on_pending_queue() {
        let mut registry = Registry::new();
        let id = registry.insert(defer_payload());

        // Not yet activated: dispatch must not see it.
        assert!(registry.begin_fire(id).is_none());

        let pending = registry.take_pending();
        assert_eq!(pending, vec![id]);
        assert!(matches!(
            registry.activate(id),
            Some(Activation::Defer { .. })
        ));
    }

    #[test]
    fn test_enable_reanchors_timer_expiration() {
        let mut registry = Registry::new();
        let now = Duration::from_millis(100);
        let id = registry.insert(delay_payload(Duration::from_millis(50), now));

        registry.disable(id);
        registry.enable(id, Duration::from_millis(300)).unwrap();
        registry.take_pending();
        registry.activate(id);

        assert!(registry.timer_entry_live(
            id,
            registry.enable_seq_of(id),
            Duration::from_millis(350)
        ));
    }

    #[test]
    fn test_unknown_ids_are_silent_only_for_cancel_and_disable() {
        let mut registry = Registry::new();
        let id = registry.insert(defer_payload());
        registry.cancel(id);

        assert!(matches!(
            registry.enable(id, Duration::ZERO),
            Err(Error::InvalidCallback(_))
        ));
        assert!(matches!(
            registry.reference(id),
            Err(Error::InvalidCallback(_))
        ));
        assert!(matches!(
            registry.unreference(id),
            Err(Error::InvalidCallback(_))
        ));

        // Idempotent and silent.
        assert!(registry.cancel(id).is_none());
        assert!(registry.disable(id).is_none());
    }
}
