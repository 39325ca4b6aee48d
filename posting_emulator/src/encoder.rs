//! Wire envelopes for sampled records.
//!
//! Encoding is pure: the same topic, record, sink and stream parameters always
//! produce byte-identical output, and nothing here touches the network or the
//! database. Columns keep their projection order and JSON is written compactly.
//!
//! Kafka REST proxy:
//!
//! ```json
//! {"records":[{"value":{...}}]}
//! ```
//!
//! Stream API:
//!
//! ```json
//! {"StreamName":"streaming_<user_id>_<topic>","Data":{...},"PartitionKey":"<topic>_partition"}
//! ```

use bytes::Bytes;
use serde::Serialize;

use crate::{
    record::{Record, Topic},
    sink::{SinkKind, StreamParams},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced while encoding a record.
pub enum Error {
    /// A column holds a value with no JSON representation.
    #[error("Topic {topic} column '{column}' holds a value of type {kind}, which is not serializable")]
    UnsupportedValue {
        /// Topic of the record
        topic: Topic,
        /// Offending column
        column: String,
        /// Source type of the value
        kind: &'static str,
    },
    /// The stream API envelope needs stream parameters and none were given.
    #[error("Topic {topic} has no stream parameters, required by the kinesis sink")]
    MissingStreamParams {
        /// Topic of the record
        topic: Topic,
    },
    /// Wrapper around [`serde_json::Error`].
    #[error("Failed to serialize topic {topic}: {source}")]
    Json {
        /// Topic of the record
        topic: Topic,
        /// Underlying serializer error
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct RestProxyEnvelope<'a> {
    records: [RestProxyRecord<'a>; 1],
}

#[derive(Serialize)]
struct RestProxyRecord<'a> {
    value: &'a Record,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StreamEnvelope<'a> {
    stream_name: &'a str,
    data: &'a Record,
    partition_key: &'a str,
}

/// Encode `record` into the envelope required by `sink`.
///
/// `stream` is required for [`SinkKind::Kinesis`] and ignored otherwise.
///
/// # Errors
///
/// Returns an error if a column holds an unsupported value, if stream
/// parameters are missing for the stream API, or if serialization fails.
pub fn encode(
    topic: Topic,
    record: &Record,
    sink: SinkKind,
    stream: Option<&StreamParams>,
) -> Result<Bytes, Error> {
    // Name the offending column; the serializer error would not.
    if let Some((column, kind)) = record
        .columns()
        .find_map(|(column, value)| value.unsupported_kind().map(|kind| (column, kind)))
    {
        return Err(Error::UnsupportedValue {
            topic,
            column: column.to_string(),
            kind,
        });
    }

    let json = match sink {
        SinkKind::Kafka => serde_json::to_vec(&RestProxyEnvelope {
            records: [RestProxyRecord { value: record }],
        }),
        SinkKind::Kinesis => {
            let stream = stream.ok_or(Error::MissingStreamParams { topic })?;
            serde_json::to_vec(&StreamEnvelope {
                stream_name: &stream.name,
                data: record,
                partition_key: &stream.partition_key,
            })
        }
    }
    .map_err(|source| Error::Json { topic, source })?;

    Ok(Bytes::from(json))
}

/// Encodes records for one sink, deriving stream parameters from the
/// configured user id.
#[derive(Debug, Clone)]
pub struct Encoder {
    sink: SinkKind,
    user_id: String,
}

impl Encoder {
    /// Create a new [`Encoder`]
    #[must_use]
    pub fn new(sink: SinkKind, user_id: impl Into<String>) -> Self {
        Self {
            sink,
            user_id: user_id.into(),
        }
    }

    /// The sink this encoder produces envelopes for.
    #[must_use]
    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    /// Stream parameters for `topic`, present only for the stream API sink.
    #[must_use]
    pub fn stream_params(&self, topic: Topic) -> Option<StreamParams> {
        match self.sink {
            SinkKind::Kafka => None,
            SinkKind::Kinesis => Some(StreamParams::new(&self.user_id, topic)),
        }
    }

    /// Encode `record` for `topic`.
    ///
    /// # Errors
    ///
    /// See [`encode`].
    pub fn encode(&self, topic: Topic, record: &Record) -> Result<Bytes, Error> {
        encode(
            topic,
            record,
            self.sink,
            self.stream_params(topic).as_ref(),
        )
    }
}
