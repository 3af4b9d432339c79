//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program.
//!
//! Configuration arrives in layers: [`Config::default`], then an optional YAML
//! document, then command-line overrides applied by the binary. The result is
//! checked once with [`Config::validate`] before anything is started.

use std::{
    fs, io,
    net::SocketAddr,
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

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
        source: Box<io::Error>,
    },
    /// The run duration is zero.
    #[error("Duration must be greater than zero")]
    ZeroDuration,
    /// The endpoint address is empty.
    #[error("Endpoint address must not be empty")]
    EmptyAddr,
}

fn default_batch_size() -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(99)
}

fn default_concurrency() -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(9)
}

fn default_addr() -> String {
    "127.0.0.1:8125".to_string()
}

fn default_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_path() -> PathBuf {
    PathBuf::from("sample_metrics.txt")
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Metric lines buffered per worker before one transmission
    #[serde(default = "default_batch_size")]
    pub batch_size: NonZeroU32,
    /// Number of concurrent sender workers
    #[serde(default = "default_concurrency")]
    pub concurrency: NonZeroU32,
    /// `host:port` of the UDP endpoint
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Wall-clock run length, in human-readable form such as `30s`
    #[serde(default = "default_duration", with = "human_duration")]
    pub duration: Duration,
    /// Newline-delimited file of sample metric lines
    #[serde(default = "default_metrics_path")]
    pub metrics_path: PathBuf,
    /// Seed for metric selection. Drawn from the OS when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    /// The method by which to express telemetry about the run
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            addr: default_addr(),
            duration: default_duration(),
            metrics_path: default_metrics_path(),
            seed: None,
            telemetry: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
/// Defines how the run's own counters are exported.
pub enum Telemetry {
    /// In prometheus mode the worker counters are exposed for scraping at a
    /// prometheus poll endpoint.
    Prometheus {
        /// Address and port for prometheus exporter
        addr: SocketAddr,
        /// Additional labels to include in every metric
        #[serde(default)]
        global_labels: FxHashMap<String, String>,
    },
}

impl Config {
    /// Parse a configuration from YAML. Absent keys take their defaults.
    ///
    /// # Errors
    ///
    /// Function will error if the document is not valid YAML, holds an unknown
    /// key or a value of the wrong type, including a zero batch size or
    /// concurrency.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Function will error if the file cannot be read or does not parse. See
    /// [`Config::from_yaml`].
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// Check invariants the types do not already enforce.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroDuration`] or [`Error::EmptyAddr`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.duration.is_zero() {
            return Err(Error::ZeroDuration);
        }
        if self.addr.trim().is_empty() {
            return Err(Error::EmptyAddr);
        }
        Ok(())
    }
}

mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub(super) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = Config::from_yaml("{}").expect("empty mapping should parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.batch_size.get(), 100);
        assert_eq!(config.concurrency.get(), 10);
        assert_eq!(config.addr, "127.0.0.1:8125");
        assert_eq!(config.duration, Duration::from_secs(30));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn config_deserializes_every_key() {
        let contents = r#"
batch_size: 25
concurrency: 4
addr: "metrics.internal:8125"
duration: "1m 30s"
metrics_path: "/var/lib/capella/sample_metrics.txt"
seed: 42
telemetry:
  addr: "0.0.0.0:9000"
  global_labels:
    env: staging
"#;
        let config = Config::from_yaml(contents).expect("failed to parse");
        assert_eq!(
            config,
            Config {
                batch_size: NonZeroU32::new(25).expect("non-zero"),
                concurrency: NonZeroU32::new(4).expect("non-zero"),
                addr: "metrics.internal:8125".to_string(),
                duration: Duration::from_secs(90),
                metrics_path: PathBuf::from("/var/lib/capella/sample_metrics.txt"),
                seed: Some(42),
                telemetry: Some(Telemetry::Prometheus {
                    addr: "0.0.0.0:9000".parse().expect("valid socket address"),
                    global_labels: [("env".to_string(), "staging".to_string())]
                        .into_iter()
                        .collect(),
                }),
            },
        );
    }

    #[test]
    fn millisecond_durations_parse() {
        let config = Config::from_yaml("duration: 100ms").expect("failed to parse");
        assert_eq!(config.duration, Duration::from_millis(100));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_yaml("batch_sz: 10").expect_err("typo must not parse");
        assert!(matches!(err, Error::SerdeYaml(_)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(Config::from_yaml("batch_size: 0").is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(Config::from_yaml("concurrency: 0").is_err());
    }

    #[test]
    fn malformed_duration_is_rejected() {
        assert!(Config::from_yaml("duration: soon").is_err());
    }

    #[test]
    fn validate_rejects_zero_duration() {
        let config = Config::from_yaml("duration: 0s").expect("zero parses");
        assert!(matches!(config.validate(), Err(Error::ZeroDuration)));
    }

    #[test]
    fn validate_rejects_empty_addr() {
        let config = Config {
            addr: "  ".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::EmptyAddr)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("could not create temp file");
        writeln!(file, "concurrency: 2\nduration: 5s").expect("write failed");

        let config = Config::load(file.path()).expect("failed to load");
        assert_eq!(config.concurrency.get(), 2);
        assert_eq!(config.duration, Duration::from_secs(5));
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        let err = Config::load(&dir.path().join("absent.yaml")).expect_err("must fail");
        assert!(matches!(err, Error::ReadFile { .. }));
    }

    #[test]
    fn duration_round_trips_through_yaml() {
        let config = Config {
            duration: Duration::from_millis(1_500),
            ..Config::default()
        };
        let yaml = serde_yaml::to_string(&config).expect("failed to serialize");
        assert_eq!(Config::from_yaml(&yaml).expect("failed to parse"), config);
    }
}
