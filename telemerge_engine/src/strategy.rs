//! Flush strategies
//!
//! A flush strategy receives a detached [`Snapshot`] of merged state and
//! decides what, if anything, to emit downstream and what to publish
//! externally. Four strategies are supported; the engine holds exactly one,
//! chosen from configuration at construction.
//!
//! | strategy        | emits                              | side effect          |
//! |-----------------|------------------------------------|----------------------|
//! | `immediate`     | one record per device              | none                 |
//! | `batched_emit`  | `ceil(devices / batch_size)`       | none                 |
//! | `cache_publish` | nothing                            | cache entry + index  |
//! | `windowed_emit` | one record per device, per closed window | none           |

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{cache::Cache, record::OutputRecord, store::Snapshot};

pub mod batched;
pub mod cache_publish;
pub mod immediate;
pub mod windowed;

/// Errors produced by [`Strategy`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The cache-publishing strategy was configured without a cache.
    #[error("cache_publish strategy requires a cache")]
    MissingCache,
    /// A cache write failed, aborting the flush.
    #[error("cache write for {key} failed: {source}")]
    Cache {
        /// The key whose write failed
        key: String,
        /// The underlying cache error
        #[source]
        source: crate::cache::Error,
    },
    /// Wrapper around [`serde_json::Error`].
    #[error("failed to serialize flush payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A failed flush and whatever output it produced before failing.
#[derive(thiserror::Error, Debug)]
#[error("{source}")]
pub struct Failure {
    /// Why the flush failed.
    #[source]
    pub source: Error,
    /// Records produced before the failure. May be empty.
    pub partial: Vec<OutputRecord>,
}

impl From<Error> for Failure {
    fn from(source: Error) -> Self {
        Self {
            source,
            partial: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Strategy`]
pub enum Config {
    /// See [`immediate::Immediate`] for details.
    #[default]
    #[serde(alias = "inline")]
    Immediate,
    /// See [`batched::BatchedEmit`] for details.
    #[serde(alias = "log_compacted")]
    BatchedEmit(batched::Config),
    /// See [`cache_publish::CachePublish`] for details.
    #[serde(alias = "state_store")]
    CachePublish(cache_publish::Config),
    /// See [`windowed::WindowedEmit`] for details.
    #[serde(alias = "window_stream")]
    WindowedEmit(windowed::Config),
}

#[derive(Debug)]
/// The active flush strategy.
///
/// All strategies supported by telemerge are a variant of this enum. Please
/// see variant documentation for details.
pub enum Strategy {
    /// See [`immediate::Immediate`] for details.
    Immediate(immediate::Immediate),
    /// See [`batched::BatchedEmit`] for details.
    BatchedEmit(batched::BatchedEmit),
    /// See [`cache_publish::CachePublish`] for details.
    CachePublish(cache_publish::CachePublish),
    /// See [`windowed::WindowedEmit`] for details.
    WindowedEmit(windowed::WindowedEmit),
}

impl Strategy {
    /// Create a new [`Strategy`]
    ///
    /// `cache` is consulted only by the cache-publishing strategy.
    ///
    /// # Errors
    ///
    /// Function will error if the cache-publishing strategy is configured and
    /// no cache is supplied.
    pub fn new(config: &Config, cache: Option<Arc<dyn Cache>>) -> Result<Self, Error> {
        let strategy = match config {
            Config::Immediate => Self::Immediate(immediate::Immediate),
            Config::BatchedEmit(conf) => Self::BatchedEmit(batched::BatchedEmit::new(conf)),
            Config::CachePublish(conf) => {
                let cache = cache.ok_or(Error::MissingCache)?;
                Self::CachePublish(cache_publish::CachePublish::new(conf, cache))
            }
            Config::WindowedEmit(conf) => Self::WindowedEmit(windowed::WindowedEmit::new(conf)),
        };
        Ok(strategy)
    }

    /// Short name used to label logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Immediate(_) => "immediate",
            Self::BatchedEmit(_) => "batched_emit",
            Self::CachePublish(_) => "cache_publish",
            Self::WindowedEmit(_) => "windowed_emit",
        }
    }

    /// Hand a snapshot taken at `now_ms` to the strategy.
    ///
    /// # Errors
    ///
    /// Function will error if the strategy's external side effect fails. The
    /// returned [`Failure`] carries any records produced before the failure.
    pub fn on_flush(&self, snapshot: &Snapshot, now_ms: i64) -> Result<Vec<OutputRecord>, Failure> {
        match self {
            Self::Immediate(inner) => Ok(inner.on_flush(snapshot, now_ms)),
            Self::BatchedEmit(inner) => Ok(inner.on_flush(snapshot, now_ms)),
            Self::CachePublish(inner) => inner.on_flush(snapshot, now_ms),
            Self::WindowedEmit(inner) => Ok(inner.on_flush(snapshot, now_ms)),
        }
    }
}
