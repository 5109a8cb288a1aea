//! Outbound record sink.
//!
//! Each output record is written as one JSON line of the form
//! `{"metadata": {...}, "payload": {...}}`. The sink runs until every sender
//! of its channel is gone, then flushes and returns.
//!
//! ## Metrics
//!
//! `records_written`: Output records written
//! `bytes_written`: Bytes written, newlines included
//!

use std::{io, path::PathBuf};

use metrics::counter;
use serde::Deserialize;
use telemerge_engine::record::OutputRecord;
use tokio::{
    fs,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::mpsc,
};
use tracing::info;

/// Errors produced by [`Sink`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The output file could not be created.
    #[error("Failed to create sink file {path:?}: {source}")]
    Create {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Wrapper for [`serde_json::Error`].
    #[error("Failed to serialize output record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Sink`]
pub enum Config {
    /// Write to the process's standard output.
    #[default]
    Stdout,
    /// Write to a file, truncating it first.
    File {
        /// Location on disk of the output file
        path: PathBuf,
    },
}

#[derive(Debug)]
/// Writes output records as JSON lines.
pub struct Sink {
    config: Config,
}

impl Sink {
    /// Create a new [`Sink`]
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Run [`Sink`] until `records` closes.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Function will return an error if the output cannot be opened or
    /// written.
    pub async fn run(self, mut records: mpsc::Receiver<OutputRecord>) -> Result<u64, Error> {
        let writer: Box<dyn AsyncWrite + Unpin + Send> = match &self.config {
            Config::Stdout => Box::new(tokio::io::stdout()),
            Config::File { path } => {
                let file = fs::File::create(path)
                    .await
                    .map_err(|source| Error::Create {
                        path: path.clone(),
                        source,
                    })?;
                Box::new(file)
            }
        };
        let mut writer = BufWriter::new(writer);
        let records_written = counter!("records_written");
        let bytes_written = counter!("bytes_written");

        let mut written = 0;
        let mut line = Vec::with_capacity(1024);
        while let Some(record) = records.recv().await {
            line.clear();
            serde_json::to_writer(&mut line, &record)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
            records_written.increment(1);
            bytes_written.increment(line.len() as u64);
            written += 1;
            // Nothing else queued, push what we have out.
            if records.is_empty() {
                writer.flush().await?;
            }
        }
        writer.flush().await?;
        info!(written, "sink drained");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use telemerge_engine::slot::{MetricSlot, SensorMap};

    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_record() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("out.jsonl");
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(Sink::new(&Config::File { path: path.clone() }).run(rx));

        let mut sensors = SensorMap::default();
        sensors.insert("s1".to_string(), MetricSlot::new("1", 100));
        tx.send(OutputRecord::device("V1", sensors, 7))
            .await
            .expect("send");
        tx.send(OutputRecord::device("V2", SensorMap::default(), 7))
            .await
            .expect("send");
        drop(tx);

        let written = task.await.expect("join").expect("sink");
        assert_eq!(written, 2);

        let contents = std::fs::read_to_string(&path).expect("read output");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["metadata"]["routing_key"], "V1");
        assert_eq!(lines[0]["payload"]["data"]["s1"]["value"], "1");
        assert_eq!(lines[1]["payload"]["data"]["id"], "V2");
    }

    #[tokio::test]
    async fn unwritable_path_is_an_error() {
        let (_tx, rx) = mpsc::channel(1);
        let sink = Sink::new(&Config::File {
            path: PathBuf::from("/nonexistent/dir/out.jsonl"),
        });
        assert!(matches!(sink.run(rx).await, Err(Error::Create { .. })));
    }
}
