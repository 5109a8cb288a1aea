//! Publish merged state to an external key-value cache.
//!
//! Every device in the snapshot is written under `<prefix><device_id>` as a
//! single-device record. Once all devices are written the index key receives
//! a JSON array of the ids just written, sorted. A reader fetches the index
//! and then each device key, see [`crate::publisher::Publisher`].
//!
//! Publication is at-least-once and not atomic. A failed write aborts the
//! flush, writes already made stay in place and the index is left as it was.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cache::Cache,
    record::{DeviceData, OutputRecord, Payload},
    store::Snapshot,
    strategy::{Error, Failure},
};

/// Default per-device key prefix.
pub const DEFAULT_PREFIX: &str = "latest:";
/// Default index key.
pub const DEFAULT_INDEX_KEY: &str = "latest:__index__";

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_index_key() -> String {
    DEFAULT_INDEX_KEY.to_string()
}

fn default_entry_ttl_seconds() -> u64 {
    300
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`CachePublish`]
pub struct Config {
    /// Prefix prepended to the device id to form each device key.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Key under which the JSON array of published device ids is written.
    #[serde(default = "default_index_key")]
    pub index_key: String,
    /// Expiry applied to each device entry. Zero disables expiry.
    #[serde(default = "default_entry_ttl_seconds")]
    pub entry_ttl_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            index_key: default_index_key(),
            entry_ttl_seconds: default_entry_ttl_seconds(),
        }
    }
}

impl Config {
    /// The cache key for `device_id`.
    #[must_use]
    pub fn device_key(&self, device_id: &str) -> String {
        format!("{prefix}{device_id}", prefix = self.prefix)
    }

    /// The expiry applied to device entries, if any.
    #[must_use]
    pub fn entry_ttl(&self) -> Option<Duration> {
        (self.entry_ttl_seconds > 0).then(|| Duration::from_secs(self.entry_ttl_seconds))
    }
}

#[derive(Debug)]
/// Writes the snapshot to a [`Cache`] and emits nothing.
pub struct CachePublish {
    config: Config,
    cache: Arc<dyn Cache>,
}

impl CachePublish {
    /// Create a new [`CachePublish`]
    #[must_use]
    pub fn new(config: &Config, cache: Arc<dyn Cache>) -> Self {
        Self {
            config: config.clone(),
            cache,
        }
    }

    /// Write every device in `snapshot`, then the index.
    ///
    /// # Errors
    ///
    /// Returns an error on the first failed write or serialization. Devices
    /// written before the failure are not rolled back.
    pub fn on_flush(&self, snapshot: &Snapshot, now_ms: i64) -> Result<Vec<OutputRecord>, Failure> {
        let mut ids: Vec<&String> = snapshot.keys().collect();
        ids.sort_unstable();

        let ttl = self.config.entry_ttl();
        for id in &ids {
            let payload = Payload::single(DeviceData::new(id.as_str(), snapshot[*id].clone()), now_ms);
            let bytes = serde_json::to_vec(&payload).map_err(Error::from)?;
            let key = self.config.device_key(id);
            self.cache
                .set(&key, bytes, ttl)
                .map_err(|source| Error::Cache { key, source })?;
        }

        let index = serde_json::to_vec(&ids).map_err(Error::from)?;
        self.cache
            .set(&self.config.index_key, index, None)
            .map_err(|source| Error::Cache {
                key: self.config.index_key.clone(),
                source,
            })?;
        debug!(devices = ids.len(), index_key = %self.config.index_key, "published");

        Ok(Vec::new())
    }
}
