//! Daemon orchestration.
//!
//! [`run`] starts the sink, every configured source, the periodic flush
//! trigger and, for the cache-publishing strategy, the cache reader. It then
//! waits for shutdown: an external cancellation, every source reaching the
//! end of its input, or the sink failing. Shutdown stops sources and timers, runs the
//! engine's final flush and lets the sink drain.
//!
//! Engine calls are synchronous and may block on cache I/O, so every unit is
//! processed on the blocking pool.

use std::{sync::Arc, time::Duration};

use metrics::counter;
use telemerge_engine::{
    MergeEngine,
    cache::{Cache, MemoryCache},
    engine,
    publisher::{self, Publisher},
    record::OutputRecord,
    trigger::FLUSH_TRIGGER,
};
use tokio::{
    sync::mpsc,
    task::{self, JoinSet},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    sink::{self, Sink},
    source::Source,
};

/// Capacity of the channel between the engine and the sink.
pub const OUTPUT_BUFFER: usize = 1024;

/// Errors produced by [`run`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The engine could not be built.
    #[error("Failed to build engine: {0}")]
    Engine(#[from] engine::Error),
    /// The sink failed.
    #[error("Sink failed: {0}")]
    Sink(#[from] sink::Error),
    /// A task could not be joined.
    #[error("Could not join task: {0}")]
    Join(#[from] task::JoinError),
}

#[derive(Debug, Clone)]
/// Submits units to a shared engine and forwards what it emits.
pub struct Handle {
    engine: Arc<MergeEngine>,
    output: mpsc::Sender<OutputRecord>,
}

impl Handle {
    /// Create a new [`Handle`]
    #[must_use]
    pub fn new(engine: Arc<MergeEngine>, output: mpsc::Sender<OutputRecord>) -> Self {
        Self { engine, output }
    }

    /// Process one unit and forward any output to the sink.
    ///
    /// Failures are logged and counted by the engine; a failed flush still
    /// forwards whatever it produced before failing.
    pub async fn submit(&self, body: Vec<u8>) {
        let engine = Arc::clone(&self.engine);
        let records = match task::spawn_blocking(move || engine.process(&body)).await {
            Ok(Ok(records)) => records,
            Ok(Err(err)) => {
                debug!("unit failed: {err}");
                err.into_partial()
            }
            Err(err) => {
                error!("Could not join the processing task: {err}");
                return;
            }
        };
        self.forward(records).await;
    }

    /// Forward `records` to the sink, in order.
    pub async fn forward(&self, records: Vec<OutputRecord>) {
        for record in records {
            if self.output.send(record).await.is_err() {
                warn!("sink closed, dropping output");
                return;
            }
        }
    }

    /// The engine behind this handle.
    #[must_use]
    pub fn engine(&self) -> &Arc<MergeEngine> {
        &self.engine
    }
}

/// Inject a flush trigger every `period` until shutdown.
///
/// Triggers travel the same path as units read from sources.
pub async fn flush_trigger(handle: Handle, period: Duration, shutdown: CancellationToken) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("injecting flush trigger");
                handle.submit(FLUSH_TRIGGER.to_vec()).await;
            }
            () = shutdown.cancelled() => {
                debug!("flush trigger stopped");
                return;
            }
        }
    }
}

/// Read the published cache every `period` and forward one record per
/// device until shutdown.
pub async fn publish_loop(
    publisher: Arc<Publisher>,
    handle: Handle,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let records_published = counter!("records_published");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let publisher = Arc::clone(&publisher);
                match task::spawn_blocking(move || publisher.publish()).await {
                    Ok(Ok(records)) => {
                        records_published.increment(records.len() as u64);
                        handle.forward(records).await;
                    }
                    Ok(Err(publisher::Error::MissingIndex { key })) => {
                        debug!(%key, "nothing published yet");
                    }
                    Ok(Err(err)) => warn!("publish failed: {err}"),
                    Err(err) => error!("Could not join the publish task: {err}"),
                }
            }
            () = shutdown.cancelled() => {
                debug!("publisher stopped");
                return;
            }
        }
    }
}

/// Run the daemon until `shutdown` is cancelled or every source finishes.
///
/// Returns the number of records written by the sink.
///
/// # Errors
///
/// Function will return an error if the engine cannot be built or the sink
/// fails. A sink failure ends the run early.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<u64, Error> {
    let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
    let engine = Arc::new(MergeEngine::new(&config.engine, Some(Arc::clone(&cache)))?);
    info!(strategy = engine.strategy_name(), "engine ready");

    let (output, records) = mpsc::channel(OUTPUT_BUFFER);
    let mut sink = tokio::spawn(Sink::new(&config.sink).run(records));
    let handle = Handle::new(Arc::clone(&engine), output);

    let mut sources = JoinSet::new();
    for cfg in config.sources.iter().cloned() {
        let source = Source::new(cfg, handle.clone(), shutdown.clone());
        sources.spawn(source.run());
    }

    let mut background = JoinSet::new();
    if let Some(period) = config.flush_interval() {
        background.spawn(flush_trigger(handle.clone(), period, shutdown.clone()));
    }
    if let (Some(period), Some(conf)) = (config.publish_interval(), config.cache_publish()) {
        let publisher = Arc::new(Publisher::new(Arc::clone(&cache), conf));
        background.spawn(publish_loop(publisher, handle.clone(), period, shutdown.clone()));
    }

    // Without sources only cancellation or a failed sink ends the run.
    let wait_for_sources = !sources.is_empty();
    let mut sink_stopped = None;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("shutdown signal received");
                break;
            }
            res = &mut sink => {
                error!("Sink stopped before shutdown, shutting down");
                sink_stopped = Some(res);
                break;
            }
            Some(res) = sources.join_next(), if wait_for_sources => {
                match res {
                    Ok(Ok(())) => debug!("source finished"),
                    Ok(Err(err)) => error!("Source shut down unexpectedly: {err}"),
                    Err(err) => error!("Could not join the spawned source task: {err}"),
                }
                if sources.is_empty() {
                    info!("all sources finished");
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    while let Some(res) = sources.join_next().await {
        if let Ok(Err(err)) = res {
            error!("Source shut down unexpectedly: {err}");
        }
    }
    while background.join_next().await.is_some() {}

    if let Err(err) = task::spawn_blocking(move || engine.shutdown()).await? {
        warn!("final flush failed: {err}");
    }

    drop(handle);
    let written = match sink_stopped {
        Some(res) => res??,
        None => sink.await??,
    };
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf};

    use telemerge_engine::strategy::{self, cache_publish};

    use super::*;
    use crate::{sink, source};

    fn data(id: &str, value: &str, received_at: i64) -> String {
        format!(
            r#"{{"num_of_data":1,"data":{{"id":"{id}","s1":{{"value":"{value}","received_at":{received_at}}}}},"produced_at":0}}"#
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_to_file_end_to_end() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input = dir.path().join("in.jsonl");
        let output = dir.path().join("out.jsonl");
        {
            let mut file = std::fs::File::create(&input).expect("create input");
            writeln!(file, "{}", data("V1", "1", 100)).expect("write");
            writeln!(file, "{}", data("V1", "2", 50)).expect("write");
            writeln!(file, "{}", data("V2", "x", 10)).expect("write");
            writeln!(file, r#"{{"num_of_data":1,"data":{{"s1":{{"value":"y","received_at":1}}}}}}"#)
                .expect("write");
            writeln!(file, "not json").expect("write");
            writeln!(file, r#"{{ "_flush" : true }}"#).expect("write");
        }

        let config = Config {
            sources: vec![source::Config::File { path: input }],
            flush_interval_seconds: 0,
            sink: sink::Config::File {
                path: output.clone(),
            },
            ..Config::default()
        };
        let written = run(config, CancellationToken::new()).await.expect("run");
        assert_eq!(written, 2);

        let contents = std::fs::read_to_string(&output).expect("read output");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["metadata"]["routing_key"], "V1");
        assert_eq!(lines[0]["payload"]["data"]["s1"]["value"], "1");
        assert_eq!(lines[1]["metadata"]["routing_key"], "V2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_without_sources_stops() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = Config {
            sink: sink::Config::File {
                path: dir.path().join("out.jsonl"),
            },
            ..Config::default()
        };
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let written = run(config, shutdown).await.expect("run");
        assert_eq!(written, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_sink_stops_the_run() {
        let config = Config {
            sink: sink::Config::File {
                path: PathBuf::from("/nonexistent/dir/out.jsonl"),
            },
            ..Config::default()
        };
        let shutdown = CancellationToken::new();
        let res = time::timeout(Duration::from_secs(5), run(config, shutdown.clone()))
            .await
            .expect("run must stop once the sink fails");
        assert!(matches!(res, Err(Error::Sink(sink::Error::Create { .. }))));
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_source_file_does_not_stop_shutdown() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = Config {
            sources: vec![source::Config::File {
                path: PathBuf::from("/nonexistent/in.jsonl"),
            }],
            sink: sink::Config::File {
                path: dir.path().join("out.jsonl"),
            },
            ..Config::default()
        };
        let written = run(config, CancellationToken::new()).await.expect("run");
        assert_eq!(written, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_trigger_fires_periodically() {
        let (tx, mut rx) = mpsc::channel(8);
        let engine = MergeEngine::new(&engine::Config::default(), None).expect("engine");
        let handle = Handle::new(Arc::new(engine), tx);
        handle.submit(data("V1", "1", 1).into_bytes()).await;

        let shutdown = CancellationToken::new();
        let ticker = tokio::spawn(flush_trigger(
            handle.clone(),
            Duration::from_millis(50),
            shutdown.clone(),
        ));
        let record = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("trigger must fire")
            .expect("record");
        assert_eq!(record.routing_key(), Some("V1"));
        shutdown.cancel();
        ticker.await.expect("join");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_loop_reads_back_the_cache() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let conf = cache_publish::Config::default();
        let engine_config = engine::Config {
            strategy: strategy::Config::CachePublish(conf.clone()),
            ..engine::Config::default()
        };
        let engine =
            MergeEngine::new(&engine_config, Some(Arc::clone(&cache))).expect("engine");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Handle::new(Arc::new(engine), tx);
        handle.submit(data("V7", "on", 3).into_bytes()).await;
        handle.submit(FLUSH_TRIGGER.to_vec()).await;
        assert!(rx.try_recv().is_err(), "cache_publish emits nothing");

        let shutdown = CancellationToken::new();
        let publisher = Arc::new(Publisher::new(cache, &conf));
        let task = tokio::spawn(publish_loop(
            publisher,
            handle.clone(),
            Duration::from_millis(50),
            shutdown.clone(),
        ));
        let record = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("publisher must fire")
            .expect("record");
        assert_eq!(record.routing_key(), Some("V7"));
        shutdown.cancel();
        task.await.expect("join");
    }
}
