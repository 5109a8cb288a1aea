//! The merge engine.
//!
//! [`MergeEngine`] is the per-unit entry point. Data records are merged into
//! the [`MergeStore`] and absorbed; a flush trigger snapshots the store,
//! evicts idle devices and hands the snapshot to the configured [`Strategy`],
//! returning whatever it emits. The strategy always runs outside the store's
//! lock so a slow cache never stalls ingestion.
//!
//! The engine is safe to share between threads. It never blocks on anything
//! other than the store lock and the strategy itself.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    cache::Cache,
    clock::{Clock, SystemClock},
    record::{self, OutputRecord},
    store::{self, MergeStore},
    strategy::{self, Strategy},
    trigger::{self, Inbound},
};

/// Errors produced by [`MergeEngine`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The unit could not be interpreted as a flush trigger or data record.
    #[error(transparent)]
    Record(#[from] record::Error),
    /// The strategy could not be built from configuration.
    #[error("failed to build flush strategy: {0}")]
    Build(#[from] strategy::Error),
    /// The flush strategy failed. Records it produced first are kept.
    #[error("flush failed: {0}")]
    Flush(#[from] strategy::Failure),
}

impl Error {
    /// Records produced by a flush before it failed. Empty for other errors.
    #[must_use]
    pub fn partial(&self) -> &[OutputRecord] {
        match self {
            Self::Flush(failure) => &failure.partial,
            Self::Record(_) | Self::Build(_) => &[],
        }
    }

    /// Take the records produced by a flush before it failed.
    #[must_use]
    pub fn into_partial(self) -> Vec<OutputRecord> {
        match self {
            Self::Flush(failure) => failure.partial,
            Self::Record(_) | Self::Build(_) => Vec::new(),
        }
    }
}

fn default_device_ttl_seconds() -> u64 {
    600
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`MergeEngine`]
pub struct Config {
    /// Devices not written for longer than this are evicted at flush time.
    #[serde(default = "default_device_ttl_seconds")]
    pub device_ttl_seconds: u64,
    /// The flush strategy.
    #[serde(default)]
    pub strategy: strategy::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_ttl_seconds: default_device_ttl_seconds(),
            strategy: strategy::Config::default(),
        }
    }
}

#[derive(Debug)]
/// Merges data records and flushes on trigger.
pub struct MergeEngine<C: Clock = SystemClock> {
    store: MergeStore,
    strategy: Strategy,
    ttl: Duration,
    clock: C,
}

impl MergeEngine<SystemClock> {
    /// Create a new [`MergeEngine`] reading the system clock.
    ///
    /// `cache` is required by the cache-publishing strategy and ignored by
    /// the others.
    ///
    /// # Errors
    ///
    /// Function will error if the strategy cannot be built, see
    /// [`Strategy::new`].
    pub fn new(config: &Config, cache: Option<Arc<dyn Cache>>) -> Result<Self, Error> {
        Self::with_clock(config, cache, SystemClock)
    }
}

impl<C: Clock> MergeEngine<C> {
    /// Create a new [`MergeEngine`] reading `clock`.
    ///
    /// # Errors
    ///
    /// Function will error if the strategy cannot be built, see
    /// [`Strategy::new`].
    pub fn with_clock(
        config: &Config,
        cache: Option<Arc<dyn Cache>>,
        clock: C,
    ) -> Result<Self, Error> {
        let strategy = Strategy::new(&config.strategy, cache)?;
        Ok(Self {
            store: MergeStore::new(),
            strategy,
            ttl: Duration::from_secs(config.device_ttl_seconds),
            clock,
        })
    }

    /// The merge store backing this engine.
    #[must_use]
    pub fn store(&self) -> &MergeStore {
        &self.store
    }

    /// Name of the configured strategy.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Process one inbound unit.
    ///
    /// A data record is merged and produces no output. A record without a
    /// device id is dropped without error. A flush trigger runs
    /// [`MergeEngine::flush`] and returns its output.
    ///
    /// # Errors
    ///
    /// Function will error if the unit is malformed, leaving the store
    /// untouched, or if the flush it triggers fails.
    pub fn process(&self, body: &[u8]) -> Result<Vec<OutputRecord>, Error> {
        let strategy = self.strategy.name();
        let inbound = match trigger::classify(body) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(strategy, error = %err, "malformed record");
                counter!("records_malformed", "strategy" => strategy).increment(1);
                return Err(err.into());
            }
        };

        match inbound {
            Inbound::Flush => self.flush(),
            Inbound::Data(payload) => {
                let device_id = payload.data.id;
                let now_ms = self.clock.now_ms();
                match self.store.merge(&device_id, payload.data.sensors, now_ms) {
                    Ok(()) => {
                        counter!("records_merged", "strategy" => strategy).increment(1);
                    }
                    Err(store::Error::EmptyDeviceId) => {
                        debug!(strategy, "skipping record without device id");
                        counter!("records_skipped", "strategy" => strategy).increment(1);
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    /// Snapshot the store, evict idle devices and run the strategy.
    ///
    /// Flush statistics are recorded whether or not the strategy succeeds.
    ///
    /// # Errors
    ///
    /// Function will error if the strategy fails. The error carries any
    /// records produced before the failure, see [`Error::partial`].
    pub fn flush(&self) -> Result<Vec<OutputRecord>, Error> {
        let strategy = self.strategy.name();
        let start = Instant::now();
        let now_ms = self.clock.now_ms();

        let flushed = self.store.snapshot_and_evict(now_ms, self.ttl);
        let devices = flushed.snapshot.len();
        let result = self.strategy.on_flush(&flushed.snapshot, now_ms);
        let duration = start.elapsed();

        let emitted = match &result {
            Ok(records) => records.len(),
            Err(failure) => failure.partial.len(),
        };

        counter!("flush_total", "strategy" => strategy).increment(1);
        counter!("devices_evicted", "strategy" => strategy).increment(flushed.evicted as u64);
        counter!("messages_emitted", "strategy" => strategy).increment(emitted as u64);
        #[allow(clippy::cast_precision_loss)]
        let tracked = devices as f64;
        gauge!("devices_tracked", "strategy" => strategy).set(tracked);
        histogram!("flush_duration_seconds", "strategy" => strategy)
            .record(duration.as_secs_f64());

        match result {
            Ok(records) => {
                info!(
                    strategy,
                    duration_ms = duration.as_millis(),
                    devices,
                    evicted = flushed.evicted,
                    emitted,
                    "flush"
                );
                Ok(records)
            }
            Err(failure) => {
                counter!("flush_errors", "strategy" => strategy).increment(1);
                warn!(
                    strategy,
                    duration_ms = duration.as_millis(),
                    devices,
                    evicted = flushed.evicted,
                    emitted,
                    error = %failure,
                    "flush failed"
                );
                Err(failure.into())
            }
        }
    }

    /// Run one final flush as the engine goes away.
    ///
    /// Records the flush produces are logged by count and dropped: there is
    /// no downstream to hand them to once shutdown has begun.
    ///
    /// # Errors
    ///
    /// Function will error if the final flush fails.
    pub fn shutdown(&self) -> Result<(), Error> {
        let records = self.flush()?;
        info!(
            strategy = self.strategy.name(),
            dropped = records.len(),
            "shutdown flush complete, records are not emitted on shutdown"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use proptest::prelude::*;

    use super::{Config, Error, MergeEngine};
    use crate::{
        cache::{self, Cache, MemoryCache},
        clock::ManualClock,
        record::{Body, OutputRecord},
        slot::Scalar,
        strategy::{self, batched, cache_publish, windowed},
        trigger::FLUSH_TRIGGER,
    };

    fn engine(strategy: strategy::Config, clock: &ManualClock) -> MergeEngine<ManualClock> {
        let config = Config {
            strategy,
            ..Config::default()
        };
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        MergeEngine::with_clock(&config, Some(cache), clock.clone()).expect("engine")
    }

    fn data(id: &str, sensor: &str, value: &str, received_at: i64) -> Vec<u8> {
        format!(
            r#"{{"num_of_data":1,"data":{{"id":"{id}","{sensor}":{{"value":"{value}","received_at":{received_at}}}}},"produced_at":0}}"#
        )
        .into_bytes()
    }

    #[test]
    fn older_observation_does_not_win() {
        let clock = ManualClock::new(1_000);
        let engine = engine(strategy::Config::Immediate, &clock);
        assert!(engine.process(&data("V1", "s1", "1", 100)).expect("merge").is_empty());
        assert!(engine.process(&data("V1", "s1", "2", 50)).expect("merge").is_empty());

        let records = engine.process(FLUSH_TRIGGER).expect("flush");
        assert_eq!(records.len(), 1);
        let Body::Single(payload) = &records[0].payload else {
            panic!("immediate must emit single-device records");
        };
        assert_eq!(payload.data.id, "V1");
        assert_eq!(payload.data.sensors["s1"].value(), &Scalar::from("1"));
        assert_eq!(payload.produced_at, 1_000);
        assert_eq!(records[0].routing_key(), Some("V1"));
    }

    #[test]
    fn empty_store_flush_is_quiet() {
        let clock = ManualClock::new(1_000);
        for strategy in [
            strategy::Config::Immediate,
            strategy::Config::BatchedEmit(batched::Config { batch_size: 3 }),
            strategy::Config::CachePublish(cache_publish::Config::default()),
        ] {
            let engine = engine(strategy, &clock);
            let records = engine.flush().expect("empty flush must succeed");
            assert!(records.is_empty(), "{} emitted", engine.strategy_name());
        }
    }

    #[test]
    fn missing_device_id_is_skipped() {
        let clock = ManualClock::new(1_000);
        let engine = engine(strategy::Config::Immediate, &clock);
        let body = br#"{"num_of_data":1,"data":{"s1":{"value":"1","received_at":1}},"produced_at":1}"#;
        assert!(engine.process(body).expect("skip is not an error").is_empty());
        assert!(engine.store().is_empty());
        assert!(engine.flush().expect("flush").is_empty());
    }

    #[test]
    fn malformed_record_fails_only_that_unit() {
        let clock = ManualClock::new(1_000);
        let engine = engine(strategy::Config::Immediate, &clock);
        engine.process(&data("V1", "s1", "1", 1)).expect("merge");
        let err = engine
            .process(br#"{"data":{"id":"V2","s1":7}}"#)
            .expect_err("malformed must fail");
        assert!(matches!(err, Error::Record(_)));
        assert!(err.partial().is_empty());
        assert_eq!(engine.store().len(), 1);
        assert!(engine.store().device("V2").is_none());
    }

    #[test]
    fn idle_devices_are_evicted_at_flush() {
        let clock = ManualClock::new(0);
        let engine = engine(strategy::Config::Immediate, &clock);
        engine.process(&data("OLD", "s1", "1", 1)).expect("merge");
        clock.advance(300_000);
        engine.process(&data("NEW", "s1", "1", 1)).expect("merge");
        clock.advance(300_001);

        let records = engine.flush().expect("flush");
        let keys: Vec<_> = records.iter().filter_map(OutputRecord::routing_key).collect();
        assert_eq!(keys, ["NEW"]);
        assert!(engine.store().device("OLD").is_none());
    }

    #[test]
    fn cache_publish_emits_nothing_downstream() {
        let clock = ManualClock::new(5);
        let engine = engine(
            strategy::Config::CachePublish(cache_publish::Config::default()),
            &clock,
        );
        engine.process(&data("V1", "s1", "1", 1)).expect("merge");
        assert!(engine.process(FLUSH_TRIGGER).expect("flush").is_empty());
    }

    #[derive(Debug)]
    struct RefusingCache;

    impl Cache for RefusingCache {
        fn set(&self, key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<(), cache::Error> {
            Err(cache::Error::Write {
                key: key.to_string(),
                reason: "read only".to_string(),
            })
        }

        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, cache::Error> {
            Ok(None)
        }
    }

    #[test]
    fn failed_flush_reports_error_and_keeps_eviction() {
        let clock = ManualClock::new(0);
        let config = Config {
            strategy: strategy::Config::CachePublish(cache_publish::Config::default()),
            ..Config::default()
        };
        let cache: Arc<dyn Cache> = Arc::new(RefusingCache);
        let engine =
            MergeEngine::with_clock(&config, Some(cache), clock.clone()).expect("engine");

        engine.process(&data("IDLE", "s1", "1", 1)).expect("merge");
        clock.advance(600_001);
        engine.process(&data("V1", "s1", "1", 2)).expect("merge");
        engine.process(&data("V2", "s1", "1", 3)).expect("merge");

        let err = engine.flush().expect_err("refused writes must fail the flush");
        assert!(matches!(err, Error::Flush(_)));
        assert!(err.into_partial().is_empty());
        assert!(engine.store().device("IDLE").is_none());
        assert!(engine.store().device("V1").is_some());
        assert!(engine.store().device("V2").is_some());
        assert_eq!(engine.store().len(), 2);

        let err = engine.process(FLUSH_TRIGGER).expect_err("trigger surfaces the failure");
        assert!(matches!(err, Error::Flush(_)));
        assert!(engine.shutdown().is_err());
    }

    #[test]
    fn windowed_emits_after_window_closes() {
        let clock = ManualClock::new(1_000);
        let engine = engine(
            strategy::Config::WindowedEmit(windowed::Config::default()),
            &clock,
        );
        engine.process(&data("V1", "s1", "1", 1)).expect("merge");
        assert!(engine.flush().expect("flush").is_empty());
        clock.set(130_000);
        let records = engine.flush().expect("flush");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.produced_at(), 120_000);
    }

    #[test]
    fn shutdown_flushes_and_returns_nothing() {
        let clock = ManualClock::new(1_000);
        let engine = engine(strategy::Config::Immediate, &clock);
        engine.process(&data("V1", "s1", "1", 1)).expect("merge");
        engine.shutdown().expect("shutdown");
    }

    #[test]
    fn concurrent_processing_keeps_latest() {
        let clock = ManualClock::new(1_000);
        let engine = Arc::new(engine(strategy::Config::Immediate, &clock));
        let handles: Vec<_> = (0..8i64)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for step in 0..100i64 {
                        let at = worker * 100 + step;
                        engine
                            .process(&data("V1", "s1", &at.to_string(), at))
                            .expect("merge");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        let records = engine.flush().expect("flush");
        let Body::Single(payload) = &records[0].payload else {
            panic!("expected single-device record");
        };
        assert_eq!(payload.data.sensors["s1"].observed_at(), 799);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Merge { device: u8, at: i64 },
        Flush,
        Advance(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, 0i64..1_000).prop_map(|(device, at)| Op::Merge { device, at }),
            Just(Op::Flush),
            (0i64..400_000).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn batched_flush_accounts_for_every_device(
            ops in prop::collection::vec(op(), 1..60),
            batch_size in 2usize..5,
        ) {
            let clock = ManualClock::new(0);
            let engine = engine(
                strategy::Config::BatchedEmit(batched::Config { batch_size }),
                &clock,
            );
            for op in ops {
                match op {
                    Op::Merge { device, at } => {
                        let body = data(&format!("V{device}"), "s1", "x", at);
                        prop_assert!(engine.process(&body).expect("merge").is_empty());
                    }
                    Op::Flush => {
                        let devices = engine.store().len();
                        let records = engine.flush().expect("flush");
                        let survivors = engine.store().len();
                        prop_assert!(survivors <= devices);
                        prop_assert_eq!(records.len(), survivors.div_ceil(batch_size));
                        let total: usize = records.iter().map(|r| r.payload.device_count()).sum();
                        prop_assert_eq!(total, survivors);
                    }
                    Op::Advance(millis) => clock.advance(millis),
                }
            }
        }
    }
}
