//! The value of one sensor on one device at one observation time.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Sensor name to [`MetricSlot`], one slot per sensor.
pub type SensorMap = FxHashMap<String, MetricSlot>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
/// An opaque scalar reading.
///
/// The engine never interprets these, it only carries them from ingest to
/// emission. Arrays and objects are not readings and reject the record.
pub enum Scalar {
    /// An explicit `null` reading.
    Null,
    /// A boolean reading.
    Bool(bool),
    /// A numeric reading, integer or floating point.
    Number(serde_json::Number),
    /// A textual reading.
    String(String),
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A sensor reading and the epoch millisecond it was observed at.
///
/// Slots are replaced wholesale, never mutated in place. On the wire the
/// observation time is named `received_at`; a reading without one is treated
/// as observed at the epoch.
pub struct MetricSlot {
    value: Scalar,
    #[serde(rename = "received_at", default)]
    observed_at: i64,
}

impl MetricSlot {
    /// Create a new [`MetricSlot`].
    #[must_use]
    pub fn new(value: impl Into<Scalar>, observed_at: i64) -> Self {
        Self {
            value: value.into(),
            observed_at,
        }
    }

    /// The reading.
    #[must_use]
    pub fn value(&self) -> &Scalar {
        &self.value
    }

    /// Epoch milliseconds at which the reading was observed.
    #[must_use]
    pub fn observed_at(&self) -> i64 {
        self.observed_at
    }

    /// Whether `self` should replace `existing` for the same sensor.
    ///
    /// Last write wins: the newer observation replaces the older, and on equal
    /// timestamps the incoming slot overwrites.
    #[must_use]
    pub fn supersedes(&self, existing: &MetricSlot) -> bool {
        self.observed_at >= existing.observed_at
    }
}
