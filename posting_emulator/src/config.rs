//! This module controls configuration parsing from the end user. Every field is
//! checked once at startup so the emulator loop never meets a half-configured
//! sink or an empty pause range.
//!
//! Configuration is YAML. YAML being a superset of JSON, a `config.json` in the
//! shape below is also accepted as is:
//!
//! ```yaml
//! db:
//!   host: "localhost"
//!   user: "emulator"
//!   password: "secret"
//!   name: "pinterest_data"
//!   port: 3306
//! endpoints:
//!   rest:
//!     pin: "http://proxy/topics/0a1b.pin"
//!     geo: "http://proxy/topics/0a1b.geo"
//!     user: "http://proxy/topics/0a1b.user"
//! user_id: "0a1b"
//! ```

use std::{
    fmt, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use http::Uri;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer};

use crate::{
    record::Topic,
    sink::{self, Registry, SinkKind},
};

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
    /// The pause bounds describe an empty range.
    #[error("Pause maximum_seconds ({maximum}) must exceed minimum_seconds ({minimum})")]
    PauseBounds {
        /// Configured lower bound
        minimum: u64,
        /// Configured upper bound
        maximum: u64,
    },
    /// The sink or its endpoints are not usable.
    #[error("Invalid configuration: {0}")]
    Sink(#[from] sink::Error),
}

fn default_offset_upper_bound() -> u64 {
    11_000
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Connection details of the source database
    pub db: Database,
    /// Destination URIs, per sink
    #[serde(default)]
    pub endpoints: Endpoints,
    /// User identifier embedded in stream names
    pub user_id: String,
    /// The sink to send to. When unset the binary asks at startup.
    #[serde(default)]
    pub sink: Option<SinkKind>,
    /// Inclusive upper bound of the sampled row offset, roughly the table size
    #[serde(default = "default_offset_upper_bound")]
    pub offset_upper_bound: u64,
    /// The pause taken before every cycle
    #[serde(default)]
    pub pause: Pause,
    /// Per-request timeout. Unset means requests may wait indefinitely.
    #[serde(default)]
    pub request_timeout_millis: Option<u64>,
    /// The seed for random operations. Unset means seeded from the OS, so each
    /// run draws a different sequence of offsets and pauses. Set it to make
    /// runs repeatable.
    #[serde(default)]
    pub seed: Option<[u8; 32]>,
    /// Prometheus export of internal telemetry
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

#[derive(Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Connection details of the source database
pub struct Database {
    /// Host name or IP address
    pub host: String,
    /// User to authenticate as
    pub user: String,
    /// Password for `user`
    pub password: String,
    /// Database (schema) name
    pub name: String,
    /// TCP port, given either as a number or a string
    #[serde(deserialize_with = "port")]
    pub port: u16,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish()
    }
}

fn port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// Destination URIs of every sink
pub struct Endpoints {
    /// Kafka REST proxy endpoints
    #[serde(default)]
    pub rest: Option<TopicEndpoints>,
    /// Stream API endpoints
    #[serde(default)]
    pub streams: Option<TopicEndpoints>,
}

impl Endpoints {
    /// The section holding `sink`'s endpoints, if configured.
    #[must_use]
    pub fn section(&self, sink: SinkKind) -> Option<&TopicEndpoints> {
        match sink {
            SinkKind::Kafka => self.rest.as_ref(),
            SinkKind::Kinesis => self.streams.as_ref(),
        }
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
/// One URI per topic
pub struct TopicEndpoints {
    /// Destination of `pin` records
    #[serde(default, with = "http_serde::option::uri")]
    pub pin: Option<Uri>,
    /// Destination of `geo` records
    #[serde(default, with = "http_serde::option::uri")]
    pub geo: Option<Uri>,
    /// Destination of `user` records
    #[serde(default, with = "http_serde::option::uri")]
    pub user: Option<Uri>,
}

impl TopicEndpoints {
    /// The URI for `topic`, if configured.
    #[must_use]
    pub fn get(&self, topic: Topic) -> Option<&Uri> {
        match topic {
            Topic::Pin => self.pin.as_ref(),
            Topic::Geo => self.geo.as_ref(),
            Topic::User => self.user.as_ref(),
        }
    }
}

fn default_minimum_seconds() -> u64 {
    0
}

fn default_maximum_seconds() -> u64 {
    2
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
/// Bounds of the pause taken before every cycle, in whole seconds
pub struct Pause {
    /// Inclusive lower bound
    #[serde(default = "default_minimum_seconds")]
    pub minimum_seconds: u64,
    /// Exclusive upper bound
    #[serde(default = "default_maximum_seconds")]
    pub maximum_seconds: u64,
}

impl Default for Pause {
    fn default() -> Self {
        Self {
            minimum_seconds: default_minimum_seconds(),
            maximum_seconds: default_maximum_seconds(),
        }
    }
}

impl Pause {
    /// Check the bounds describe a non-empty range.
    ///
    /// # Errors
    ///
    /// Returns an error if `maximum_seconds` does not exceed
    /// `minimum_seconds`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.maximum_seconds <= self.minimum_seconds {
            return Err(Error::PauseBounds {
                minimum: self.minimum_seconds,
                maximum: self.maximum_seconds,
            });
        }
        Ok(())
    }

    /// Draw a pause. Bounds must have passed [`Pause::validate`].
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_secs(rng.random_range(self.minimum_seconds..self.maximum_seconds))
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// Prometheus export of the emulator's own counters
pub struct Telemetry {
    /// Address and port for prometheus exporter
    pub prometheus_addr: SocketAddr,
    /// Additional labels to include in every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
}

impl Config {
    /// Validate this configuration for `sink`, resolving its endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the pause bounds are empty or `sink` is not fully
    /// configured.
    pub fn validate(&self, sink: SinkKind) -> Result<Registry, Error> {
        self.pause.validate()?;
        Ok(Registry::new(sink, &self.endpoints)?)
    }

    /// The per-request timeout, if configured.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_millis.map(Duration::from_millis)
    }
}

/// Parse configuration contents.
///
/// # Errors
///
/// Returns an error if the contents are not a valid configuration.
pub fn parse(contents: &str) -> Result<Config, Error> {
    serde_yaml::from_str(contents).map_err(Error::from)
}

/// Load configuration from a single file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid
/// configuration.
pub fn load_config_from_path(path: &Path) -> Result<Config, Error> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source: Box::new(source),
    })?;
    parse(&contents)
}
