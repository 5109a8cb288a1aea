//! Pack several devices into each emitted record.

use serde::{Deserialize, Serialize};

use crate::{
    record::{DeviceData, OutputRecord},
    store::Snapshot,
    strategy::immediate::Immediate,
};

fn default_batch_size() -> usize {
    1
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`BatchedEmit`]
pub struct Config {
    /// Maximum number of devices per emitted record. Values of 0 and 1 emit
    /// one record per device.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
/// Emits devices in groups of up to `batch_size` per record.
///
/// For `V` devices exactly `ceil(V / batch_size)` records are produced, the
/// last one possibly short. Multi-device records carry no routing key.
pub struct BatchedEmit {
    batch_size: usize,
}

impl BatchedEmit {
    /// Create a new [`BatchedEmit`]
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
        }
    }

    /// Build the batched records for `snapshot`.
    #[must_use]
    pub fn on_flush(&self, snapshot: &Snapshot, now_ms: i64) -> Vec<OutputRecord> {
        if self.batch_size <= 1 {
            return Immediate.on_flush(snapshot, now_ms);
        }

        let mut ids: Vec<&String> = snapshot.keys().collect();
        ids.sort_unstable();
        ids.chunks(self.batch_size)
            .map(|group| {
                let data = group
                    .iter()
                    .map(|id| DeviceData::new(id.as_str(), snapshot[*id].clone()))
                    .collect();
                OutputRecord::batch(data, now_ms)
            })
            .collect()
    }
}
