//! Concurrency-safe latest-state table, keyed by device.
//!
//! The [`MergeStore`] holds one [`DeviceState`] per device behind a single
//! mutex. Two operations touch it: [`MergeStore::merge`] on every data record
//! and [`MergeStore::snapshot_and_evict`] on every flush. Both are bounded by
//! the size of the table, never by I/O.
//!
//! # Semantics
//!
//! A merge of slot `s` for sensor `k` on device `d` replaces the stored slot
//! `e` if and only if `s.observed_at >= e.observed_at`. Equal timestamps
//! overwrite, so of two merges at the same observation time the one applied
//! last wins. Every successful merge stamps the device's `last_seen` with the
//! merge time, whether or not any slot was replaced.
//!
//! A flush copies every live device's slots into a [`Snapshot`] and, in the
//! same critical section, deletes every device whose `last_seen` is more than
//! the TTL behind the flush time. An evicted device is not in the snapshot
//! and does not return until a fresh merge recreates it.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rustc_hash::FxHashMap;

use crate::slot::{MetricSlot, SensorMap};

/// Device id to sensor readings, detached from the live store.
pub type Snapshot = FxHashMap<String, SensorMap>;

/// Errors produced by [`MergeStore`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A merge named no device.
    #[error("device id is empty")]
    EmptyDeviceId,
}

#[derive(Debug, Clone, PartialEq)]
/// The latest known state of one device.
pub struct DeviceState {
    device_id: String,
    metrics: SensorMap,
    last_seen: i64,
}

impl DeviceState {
    fn new(device_id: &str, now_ms: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            metrics: SensorMap::default(),
            last_seen: now_ms,
        }
    }

    /// The device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The latest slot of every sensor seen for this device.
    #[must_use]
    pub fn metrics(&self) -> &SensorMap {
        &self.metrics
    }

    /// Epoch milliseconds of the last merge into this device.
    #[must_use]
    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    fn apply<I>(&mut self, sensors: I, now_ms: i64)
    where
        I: IntoIterator<Item = (String, MetricSlot)>,
    {
        for (sensor, slot) in sensors {
            if let Some(existing) = self.metrics.get_mut(&sensor) {
                if slot.supersedes(existing) {
                    *existing = slot;
                }
            } else {
                self.metrics.insert(sensor, slot);
            }
        }
        self.last_seen = now_ms;
    }
}

#[derive(Debug)]
/// The result of [`MergeStore::snapshot_and_evict`].
pub struct Flushed {
    /// Deep copy of every surviving device's slots.
    pub snapshot: Snapshot,
    /// Number of devices removed by the TTL sweep.
    pub evicted: usize,
}

#[derive(Debug, Default)]
/// The mutex-guarded device table.
pub struct MergeStore {
    devices: Mutex<FxHashMap<String, DeviceState>>,
}

impl MergeStore {
    /// Create an empty [`MergeStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // No critical section below can leave the table half-updated in a way
    // that matters, so a poisoned lock is simply taken over.
    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, DeviceState>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `sensors` into the state of `device_id` at time `now_ms`.
    ///
    /// See the module documentation for the replacement rule. Creates the
    /// device on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyDeviceId`] without touching the table if
    /// `device_id` is empty.
    pub fn merge<I>(&self, device_id: &str, sensors: I, now_ms: i64) -> Result<(), Error>
    where
        I: IntoIterator<Item = (String, MetricSlot)>,
    {
        if device_id.is_empty() {
            return Err(Error::EmptyDeviceId);
        }

        let mut devices = self.lock();
        if let Some(state) = devices.get_mut(device_id) {
            state.apply(sensors, now_ms);
        } else {
            let mut state = DeviceState::new(device_id, now_ms);
            state.apply(sensors, now_ms);
            devices.insert(device_id.to_string(), state);
        }
        Ok(())
    }

    /// Copy out the live state and evict idle devices, atomically.
    ///
    /// A device is evicted when `now_ms - last_seen > ttl`.
    #[must_use]
    pub fn snapshot_and_evict(&self, now_ms: i64, ttl: Duration) -> Flushed {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut snapshot = Snapshot::default();
        let mut evicted = 0;

        let mut devices = self.lock();
        snapshot.reserve(devices.len());
        devices.retain(|device_id, state| {
            if now_ms.saturating_sub(state.last_seen) > ttl_ms {
                evicted += 1;
                false
            } else {
                snapshot.insert(device_id.clone(), state.metrics.clone());
                true
            }
        });

        Flushed { snapshot, evicted }
    }

    /// A copy of one device's state, if present.
    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<DeviceState> {
        self.lock().get(device_id).cloned()
    }

    /// Number of devices currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
