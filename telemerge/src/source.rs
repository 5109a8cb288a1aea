//! Inbound record sources.
//!
//! Every source speaks newline-delimited records: each non-blank line is one
//! unit, either a data record or a flush trigger, and is handed to the
//! engine through a [`Handle`] in arrival order. Lines longer than
//! [`MAX_LINE_BYTES`] are dropped unread.
//!
//! ## Metrics
//!
//! `units_received`: Non-blank lines read, labeled by `source`
//! `units_oversize`: Lines dropped for exceeding the length limit, labeled by `source`
//! `connection_accepted`: Incoming TCP connections
//!

use std::{io, net::SocketAddr, path::PathBuf};

use metrics::counter;
use serde::Deserialize;
use tokio::{
    fs,
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runtime::Handle;

/// Longest accepted line in bytes, newline excluded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Errors produced by [`Source`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The source file could not be opened.
    #[error("Failed to open source file {path:?}: {source}")]
    Open {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Source`]
pub enum Config {
    /// Accept TCP connections, one task per connection.
    Tcp {
        /// IP and port to bind to
        binding_addr: SocketAddr,
    },
    /// Read the process's standard input.
    Stdin,
    /// Read a file once, to its end.
    File {
        /// Location on disk of the record file
        path: PathBuf,
    },
}

#[derive(Debug)]
/// A running inbound source.
pub struct Source {
    config: Config,
    handle: Handle,
    shutdown: CancellationToken,
}

impl Source {
    /// Create a new [`Source`]
    #[must_use]
    pub fn new(config: Config, handle: Handle, shutdown: CancellationToken) -> Self {
        Self {
            config,
            handle,
            shutdown,
        }
    }

    /// Short name used to label logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self.config {
            Config::Tcp { .. } => "tcp",
            Config::Stdin => "stdin",
            Config::File { .. } => "file",
        }
    }

    /// Run [`Source`] to completion
    ///
    /// The TCP source runs until shutdown. The stdin and file sources run
    /// until their input ends or shutdown, whichever comes first.
    ///
    /// # Errors
    ///
    /// Function will return an error if binding, opening or reading fails.
    pub async fn run(self) -> Result<(), Error> {
        let name = self.name();
        match self.config {
            Config::Tcp { binding_addr } => {
                run_tcp(binding_addr, self.handle, self.shutdown).await
            }
            Config::Stdin => {
                let reader = BufReader::new(tokio::io::stdin());
                let units = read_lines(reader, name, &self.handle, &self.shutdown).await?;
                info!(units, "stdin closed");
                Ok(())
            }
            Config::File { path } => {
                let file = fs::File::open(&path)
                    .await
                    .map_err(|source| Error::Open {
                        path: path.clone(),
                        source,
                    })?;
                let units =
                    read_lines(BufReader::new(file), name, &self.handle, &self.shutdown).await?;
                info!(units, path = %path.display(), "source file read");
                Ok(())
            }
        }
    }
}

async fn run_tcp(
    binding_addr: SocketAddr,
    handle: Handle,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind(binding_addr).await?;
    info!(%binding_addr, "tcp source listening");
    let connection_accepted = counter!("connection_accepted", "source" => "tcp");

    loop {
        tokio::select! {
            conn = listener.accept() => {
                let (socket, peer) = conn?;
                connection_accepted.increment(1);
                let handle = handle.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match read_lines(BufReader::new(socket), "tcp", &handle, &shutdown).await {
                        Ok(units) => debug!(%peer, units, "connection closed"),
                        Err(err) => warn!(%peer, "connection failed: {err}"),
                    }
                });
            }
            () = shutdown.cancelled() => {
                info!("shutdown signal received");
                return Ok(())
            }
        }
    }
}

/// Submit every non-blank line of `reader` to `handle`, in order.
///
/// Returns the number of lines submitted once `reader` ends or `shutdown`
/// is cancelled. A trailing line without a newline still counts. Lines over
/// [`MAX_LINE_BYTES`] are skipped up to their newline and not submitted.
///
/// # Errors
///
/// Function will return an error if reading fails.
pub async fn read_lines<R>(
    mut reader: R,
    source: &'static str,
    handle: &Handle,
    shutdown: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let units_received = counter!("units_received", "source" => source);
    let units_oversize = counter!("units_oversize", "source" => source);
    let mut units = 0;
    let mut line = Vec::new();
    loop {
        tokio::select! {
            next = next_line(&mut reader, &mut line) => match next? {
                Line::Eof => return Ok(units),
                Line::Oversize => {
                    units_oversize.increment(1);
                    warn!(source, limit = MAX_LINE_BYTES, "dropping oversize line");
                }
                Line::Unit => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    units_received.increment(1);
                    units += 1;
                    handle.submit(line.clone()).await;
                }
            },
            () = shutdown.cancelled() => return Ok(units),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line {
    Unit,
    Oversize,
    Eof,
}

/// Read the next line into `line`, never buffering more than one byte past
/// [`MAX_LINE_BYTES`].
async fn next_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_BYTES as u64 + 1;
    line.clear();
    if (&mut *reader).take(limit).read_until(b'\n', line).await? == 0 {
        return Ok(Line::Eof);
    }
    if line.last() == Some(&b'\n') || line.len() <= MAX_LINE_BYTES {
        return Ok(Line::Unit);
    }

    // Over the limit: discard through the next newline.
    line.clear();
    let mut scratch = Vec::new();
    loop {
        scratch.clear();
        let read = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut scratch)
            .await?;
        if read == 0 || scratch.last() == Some(&b'\n') {
            return Ok(Line::Oversize);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use telemerge_engine::{MergeEngine, engine, record::OutputRecord};
    use tokio::sync::mpsc;

    use super::*;

    fn handle() -> (Handle, mpsc::Receiver<OutputRecord>) {
        let (tx, rx) = mpsc::channel(16);
        let engine = MergeEngine::new(&engine::Config::default(), None).expect("engine");
        (Handle::new(Arc::new(engine), tx), rx)
    }

    #[tokio::test]
    async fn lines_are_submitted_in_order() {
        let (handle, mut rx) = handle();
        let input: &[u8] = b"{\"data\":{\"id\":\"V1\",\"s1\":{\"value\":1,\"received_at\":5}}}\n\n   \n{\"_flush\": true}";
        let units = read_lines(input, "test", &handle, &CancellationToken::new())
            .await
            .expect("read");
        assert_eq!(units, 2);
        drop(handle);

        let record = rx.recv().await.expect("flush output");
        assert_eq!(record.routing_key(), Some("V1"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_lines_do_not_stop_reading() {
        let (handle, mut rx) = handle();
        let input: &[u8] = b"not json\n{\"data\":{\"id\":\"V2\"}}\n{\"_flush\":true}\n";
        let units = read_lines(input, "test", &handle, &CancellationToken::new())
            .await
            .expect("read");
        assert_eq!(units, 3);
        drop(handle);

        let record = rx.recv().await.expect("flush output");
        assert_eq!(record.routing_key(), Some("V2"));
    }

    #[tokio::test]
    async fn oversize_lines_are_dropped() {
        let (handle, mut rx) = handle();
        let mut input = vec![b'x'; MAX_LINE_BYTES + 10];
        input.extend_from_slice(b"\n{\"data\":{\"id\":\"V3\"}}\n");
        input.extend(std::iter::repeat_n(b'y', MAX_LINE_BYTES * 2));
        input.extend_from_slice(b"\n{\"_flush\":true}\n");
        input.extend(std::iter::repeat_n(b'z', MAX_LINE_BYTES + 1));
        let units = read_lines(input.as_slice(), "test", &handle, &CancellationToken::new())
            .await
            .expect("read");
        assert_eq!(units, 2);
        drop(handle);

        let record = rx.recv().await.expect("flush output");
        assert_eq!(record.routing_key(), Some("V3"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn line_at_the_limit_is_kept() {
        let mut input = vec![b'a'; MAX_LINE_BYTES];
        input.push(b'\n');
        input.extend(std::iter::repeat_n(b'b', MAX_LINE_BYTES));
        let mut reader = input.as_slice();
        let mut line = Vec::new();

        assert_eq!(next_line(&mut reader, &mut line).await.expect("read"), Line::Unit);
        assert_eq!(line.len(), MAX_LINE_BYTES + 1);
        assert_eq!(next_line(&mut reader, &mut line).await.expect("read"), Line::Unit);
        assert_eq!(line.len(), MAX_LINE_BYTES);
        assert_eq!(next_line(&mut reader, &mut line).await.expect("read"), Line::Eof);
    }

    #[tokio::test]
    async fn cancelled_reader_stops() {
        let (handle, _rx) = handle();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (_writer, reader) = tokio::io::duplex(64);
        let units = read_lines(BufReader::new(reader), "test", &handle, &shutdown)
            .await
            .expect("read");
        assert_eq!(units, 0);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let (handle, _rx) = handle();
        let source = Source::new(
            Config::File {
                path: PathBuf::from("/nonexistent/records.jsonl"),
            },
            handle,
            CancellationToken::new(),
        );
        assert_eq!(source.name(), "file");
        assert!(matches!(source.run().await, Err(Error::Open { .. })));
    }
}
