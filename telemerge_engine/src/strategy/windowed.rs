//! Tumbling windows with allowed lateness.
//!
//! Each flush drops the snapshot into the bucket of the window containing
//! `now`, replacing any entry a device already had in that bucket. Each flush
//! also closes every bucket whose `start + size + lateness <= now`, emitting
//! one record per device with `produced_at` at the window end. A closed
//! bucket is gone; its devices are never emitted for that window again.
//!
//! Replacement within a bucket is wholesale. A device seen by two snapshots
//! in the same window keeps only the sensors of the second.

use std::{
    collections::BTreeMap,
    num::NonZeroU64,
    sync::{Mutex, MutexGuard, PoisonError},
};

use metrics::gauge;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    record::{OutputRecord, WINDOW_START},
    slot::SensorMap,
    store::Snapshot,
};

fn default_window_size_seconds() -> NonZeroU64 {
    NonZeroU64::new(120).unwrap_or(NonZeroU64::MIN)
}

fn default_allowed_lateness_seconds() -> u64 {
    10
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`WindowedEmit`]
pub struct Config {
    /// Length of each tumbling window.
    #[serde(default = "default_window_size_seconds")]
    pub window_size_seconds: NonZeroU64,
    /// How long after its nominal end a window stays open.
    #[serde(default = "default_allowed_lateness_seconds")]
    pub allowed_lateness_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size_seconds: default_window_size_seconds(),
            allowed_lateness_seconds: default_allowed_lateness_seconds(),
        }
    }
}

type Bucket = FxHashMap<String, SensorMap>;

#[derive(Debug)]
/// Buffers snapshots into windows and emits each window once it closes.
pub struct WindowedEmit {
    size_ms: i64,
    lateness_ms: i64,
    windows: Mutex<BTreeMap<i64, Bucket>>,
}

fn seconds_to_ms(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

impl WindowedEmit {
    /// Create a new [`WindowedEmit`]
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            size_ms: seconds_to_ms(config.window_size_seconds.get()),
            lateness_ms: seconds_to_ms(config.allowed_lateness_seconds),
            windows: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, Bucket>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start of the window containing `ts`.
    #[must_use]
    pub fn window_start(&self, ts: i64) -> i64 {
        ts - ts.rem_euclid(self.size_ms)
    }

    fn closes_by(&self, start: i64, now_ms: i64) -> bool {
        start
            .saturating_add(self.size_ms)
            .saturating_add(self.lateness_ms)
            <= now_ms
    }

    /// Number of windows currently buffered.
    #[must_use]
    pub fn open_windows(&self) -> usize {
        self.lock().len()
    }

    /// Record `snapshot` in the current window and emit every closed window.
    ///
    /// Closed windows are emitted oldest first, devices within a window by id.
    #[must_use]
    pub fn on_flush(&self, snapshot: &Snapshot, now_ms: i64) -> Vec<OutputRecord> {
        let current = self.window_start(now_ms);

        let mut windows = self.lock();
        if !snapshot.is_empty() {
            let bucket = windows.entry(current).or_default();
            for (device_id, sensors) in snapshot {
                bucket.insert(device_id.clone(), sensors.clone());
            }
        }

        let closed: Vec<i64> = windows
            .keys()
            .copied()
            .take_while(|start| self.closes_by(*start, now_ms))
            .collect();

        let mut records = Vec::new();
        for start in closed {
            let Some(bucket) = windows.remove(&start) else {
                continue;
            };
            let end = start.saturating_add(self.size_ms);
            let devices: BTreeMap<String, SensorMap> = bucket.into_iter().collect();
            debug!(window_start = start, devices = devices.len(), "window closed");
            records.extend(devices.into_iter().map(|(device_id, sensors)| {
                OutputRecord::device(device_id, sensors, end)
                    .with_metadata(WINDOW_START, start.to_string())
            }));
        }

        #[allow(clippy::cast_precision_loss)]
        let open = windows.len() as f64;
        gauge!("windows_open", "strategy" => "windowed_emit").set(open);
        records
    }
}
