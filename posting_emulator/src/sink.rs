//! Ingestion sinks and the endpoint registry.
//!
//! Two sink kinds are supported: a REST proxy in front of a Kafka-compatible
//! broker and a Kinesis-style stream API. The kind is chosen once at startup
//! and fixes the HTTP method, content type and envelope for every request the
//! process makes.

use std::{fmt, str::FromStr};

use http::{Method, Uri};
use serde::{Deserialize, Serialize};

use crate::{config::Endpoints, record::Topic};

/// Content type expected by the Kafka REST proxy for JSON records.
pub const KAFKA_CONTENT_TYPE: &str = "application/vnd.kafka.json.v2+json";
/// Content type for the stream API.
pub const KINESIS_CONTENT_TYPE: &str = "application/json";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors produced while selecting a sink or resolving its endpoints.
pub enum Error {
    /// The requested sink kind is not known.
    #[error("Unknown sink '{0}', expected 'kafka' or 'kinesis'")]
    UnknownSink(String),
    /// The configuration has no endpoint section for the sink.
    #[error("No endpoints configured for the {sink} sink, expected an `endpoints.{section}` section")]
    MissingSection {
        /// Selected sink
        sink: SinkKind,
        /// The configuration section that was expected
        section: &'static str,
    },
    /// The sink's endpoint section does not name a URI for a topic.
    #[error("No {sink} endpoint configured for topic {topic}")]
    MissingEndpoint {
        /// Selected sink
        sink: SinkKind,
        /// Topic lacking an endpoint
        topic: Topic,
    },
}

/// The kind of ingestion endpoint records are sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum SinkKind {
    /// REST proxy for a Kafka-compatible broker.
    Kafka,
    /// Kinesis-style stream API.
    Kinesis,
}

impl SinkKind {
    /// The lowercase name of this sink.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SinkKind::Kafka => "kafka",
            SinkKind::Kinesis => "kinesis",
        }
    }

    /// HTTP method used for every request to this sink.
    #[must_use]
    pub fn method(self) -> Method {
        match self {
            SinkKind::Kafka => Method::POST,
            SinkKind::Kinesis => Method::PUT,
        }
    }

    /// `Content-Type` header value for this sink.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            SinkKind::Kafka => KAFKA_CONTENT_TYPE,
            SinkKind::Kinesis => KINESIS_CONTENT_TYPE,
        }
    }

    /// Name of the `endpoints` configuration section holding this sink's
    /// URIs.
    #[must_use]
    pub fn section(self) -> &'static str {
        match self {
            SinkKind::Kafka => "rest",
            SinkKind::Kinesis => "streams",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SinkKind {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "kafka" => Ok(SinkKind::Kafka),
            "kinesis" => Ok(SinkKind::Kinesis),
            _ => Err(Error::UnknownSink(input.trim().to_string())),
        }
    }
}

impl TryFrom<String> for SinkKind {
    type Error = Error;

    fn try_from(input: String) -> Result<Self, Self::Error> {
        input.parse()
    }
}

/// Stream metadata carried in every stream API envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    /// `streaming_{user_id}_{topic}`
    pub name: String,
    /// `{topic}_partition`
    pub partition_key: String,
}

impl StreamParams {
    /// Derive the stream name and partition key for `topic`.
    #[must_use]
    pub fn new(user_id: &str, topic: Topic) -> Self {
        Self {
            name: format!("streaming_{user_id}_{topic}"),
            partition_key: format!("{topic}_partition"),
        }
    }
}

/// Destination URI per topic for the selected sink. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Registry {
    sink: SinkKind,
    pin: Uri,
    geo: Uri,
    user: Uri,
}

impl Registry {
    /// Resolve the endpoints of `sink` from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink's section is absent or any topic lacks a
    /// URI. A half-configured sink is never returned.
    pub fn new(sink: SinkKind, endpoints: &Endpoints) -> Result<Self, Error> {
        let section = endpoints.section(sink).ok_or(Error::MissingSection {
            sink,
            section: sink.section(),
        })?;
        let lookup = |topic: Topic| {
            section
                .get(topic)
                .cloned()
                .ok_or(Error::MissingEndpoint { sink, topic })
        };

        Ok(Self {
            sink,
            pin: lookup(Topic::Pin)?,
            geo: lookup(Topic::Geo)?,
            user: lookup(Topic::User)?,
        })
    }

    /// The sink these endpoints belong to.
    #[must_use]
    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    /// The destination for `topic`.
    #[must_use]
    pub fn uri(&self, topic: Topic) -> &Uri {
        match topic {
            Topic::Pin => &self.pin,
            Topic::Geo => &self.geo,
            Topic::User => &self.user,
        }
    }
}
