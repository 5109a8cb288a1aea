//! This module controls configuration parsing from the end user. A
//! configuration is a single YAML document, read from a file or handed over
//! whole through the environment.
use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::Deserialize;
use telemerge_engine::{engine, strategy};
use tracing::debug;

use crate::{sink, source};

/// Environment variable whose contents, when set, replace the config file.
pub const CONFIG_ENV: &str = "TELEMERGE_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// The companion reader was enabled for a strategy that writes no cache.
    #[error("publish_interval_seconds requires the cache_publish strategy")]
    PublishWithoutCache,
}

fn default_flush_interval_seconds() -> u64 {
    120
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The merge engine and its flush strategy
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub engine: engine::Config,
    /// Where inbound records come from
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub sources: Vec<source::Config>,
    /// Period of the internal flush trigger. Zero disables it, flushes then
    /// only happen on triggers arriving through a source.
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
    /// Period of the cache reader. Only valid with the `cache_publish`
    /// strategy; absent disables the reader.
    #[serde(default)]
    pub publish_interval_seconds: Option<u64>,
    /// Where output records go
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub sink: sink::Config,
    /// The method by which to express telemetry
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub telemetry: Option<Telemetry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: engine::Config::default(),
            sources: Vec::new(),
            flush_interval_seconds: default_flush_interval_seconds(),
            publish_interval_seconds: None,
            sink: sink::Config::default(),
            telemetry: None,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Defines the manner of telemerge's telemetry.
pub enum Telemetry {
    /// In prometheus mode telemerge will emit its internal telemetry for
    /// scraping at a prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Parse a [`Config`] from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or the sections are
    /// inconsistent with one another.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.publish_interval_seconds.is_some() && self.cache_publish().is_none() {
            return Err(Error::PublishWithoutCache);
        }
        Ok(())
    }

    /// The cache publication settings, when that strategy is configured.
    #[must_use]
    pub fn cache_publish(&self) -> Option<&strategy::cache_publish::Config> {
        match &self.engine.strategy {
            strategy::Config::CachePublish(conf) => Some(conf),
            _ => None,
        }
    }

    /// Period of the internal flush trigger, `None` when disabled.
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        (self.flush_interval_seconds > 0).then(|| Duration::from_secs(self.flush_interval_seconds))
    }

    /// Period of the cache reader, `None` when disabled.
    #[must_use]
    pub fn publish_interval(&self) -> Option<Duration> {
        self.publish_interval_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Load the configuration from [`CONFIG_ENV`] if set, otherwise from `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse.
pub fn load(path: &Path) -> Result<Config, Error> {
    let contents = if let Ok(contents) = env::var(CONFIG_ENV) {
        debug!("Using config from env var '{CONFIG_ENV}'");
        contents
    } else {
        debug!("Attempting to open configuration file at: {}", path.display());
        fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?
    };
    Config::from_yaml(&contents)
}
