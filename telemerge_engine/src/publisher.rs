//! Read published state back out of the cache.
//!
//! The counterpart of [`crate::strategy::cache_publish::CachePublish`]. The
//! index key is fetched first, then each listed device key. A device whose
//! entry has expired or does not parse is skipped; a missing index is an
//! error, since nothing has been published yet.

use std::sync::Arc;

use tracing::debug;

use crate::{
    cache::{self, Cache},
    record::{OutputRecord, Payload, ROUTING_KEY},
    strategy::cache_publish,
};

/// Errors produced by [`Publisher`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper around [`cache::Error`].
    #[error(transparent)]
    Cache(#[from] cache::Error),
    /// The index key holds no value.
    #[error("index key {key} is not present")]
    MissingIndex {
        /// The index key
        key: String,
    },
    /// The index key holds something other than a JSON array of ids.
    #[error("index key {key} is not a list of device ids: {source}")]
    Index {
        /// The index key
        key: String,
        /// The parse failure
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
/// Reconstructs per-device records from a cache written by
/// [`cache_publish::CachePublish`].
pub struct Publisher {
    cache: Arc<dyn Cache>,
    config: cache_publish::Config,
}

impl Publisher {
    /// Create a new [`Publisher`] reading the keys described by `config`.
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, config: &cache_publish::Config) -> Self {
        Self {
            cache,
            config: config.clone(),
        }
    }

    /// Read every published device, one record per device, routed by id.
    ///
    /// # Errors
    ///
    /// Function will error if the index is missing or unreadable, or if the
    /// cache itself fails.
    pub fn publish(&self) -> Result<Vec<OutputRecord>, Error> {
        let key = &self.config.index_key;
        let index = self
            .cache
            .get(key)?
            .ok_or_else(|| Error::MissingIndex { key: key.clone() })?;
        let ids: Vec<String> = serde_json::from_slice(&index).map_err(|source| Error::Index {
            key: key.clone(),
            source,
        })?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let device_key = self.config.device_key(&id);
            let Some(bytes) = self.cache.get(&device_key)? else {
                debug!(device_key = %device_key, "published entry missing, skipping");
                continue;
            };
            match serde_json::from_slice::<Payload>(&bytes) {
                Ok(payload) => {
                    // Route by the indexed id even if the entry disagrees.
                    records.push(OutputRecord::from_payload(payload).with_metadata(ROUTING_KEY, id));
                }
                Err(err) => {
                    debug!(device_key = %device_key, error = %err, "published entry unparsable, skipping");
                }
            }
        }
        Ok(records)
    }
}
