//! The HTTP dispatcher.
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of requests sent
//! `request_ok`: Requests answered with a 2xx status
//! `request_failure`: Requests that failed or were answered with another status
//! `bytes_written`: Total payload bytes sent
//!

use std::{fmt, time::Duration};

use bytes::Bytes;
use http::{StatusCode, Uri, header::CONTENT_TYPE};
use metrics::counter;
use tracing::{error, info};

use crate::{
    record::Topic,
    sink::{Registry, SinkKind},
};

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Dispatcher`]. None of these affect sibling requests.
pub enum Error {
    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    /// The request could not be sent or its response not read.
    #[error("Failed to send {topic} record to {uri}: {source}")]
    Request {
        /// Topic of the payload
        topic: Topic,
        /// Destination
        uri: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },
    /// The endpoint answered with a non-success status.
    #[error("Endpoint for {topic} answered {status}: {body}")]
    Status {
        /// Topic of the payload
        topic: Topic,
        /// Response status
        status: StatusCode,
        /// Response body
        body: String,
    },
    /// The request task panicked or was cancelled.
    #[error("Request task for {topic} did not complete: {source}")]
    Task {
        /// Topic of the payload
        topic: Topic,
        /// Underlying join error
        #[source]
        source: tokio::task::JoinError,
    },
}

/// A successfully answered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Topic of the payload
    pub topic: Topic,
    /// Response status, always a success status
    pub status: StatusCode,
    /// Response body
    pub body: String,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{topic} {status}, {body}",
            topic = self.topic,
            status = self.status.as_u16(),
            body = self.body
        )
    }
}

/// Sends encoded payloads to their topic's endpoint.
///
/// The client is built once and shared by every request; each request of a
/// cycle runs in its own task.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    registry: Registry,
}

impl Dispatcher {
    /// Create a new [`Dispatcher`]
    ///
    /// `timeout` bounds every request. Without one a hung endpoint holds its
    /// cycle indefinitely.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(registry: Registry, timeout: Option<Duration>) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(Error::Client)?;
        Ok(Self { client, registry })
    }

    /// The sink requests are sent to.
    #[must_use]
    pub fn sink(&self) -> SinkKind {
        self.registry.sink()
    }

    /// Send one payload to `topic`'s endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the endpoint does not answer
    /// with a success status.
    pub async fn dispatch(&self, topic: Topic, payload: Bytes) -> Result<Outcome, Error> {
        send(
            &self.client,
            self.sink(),
            topic,
            self.registry.uri(topic),
            payload,
        )
        .await
    }

    /// Send every payload concurrently and wait for all of them.
    ///
    /// Each payload runs in its own task. A slow or failing request delays the
    /// return of this function but never cancels its siblings. Results are
    /// returned in input order, one per payload, after every task finished.
    pub async fn dispatch_all(
        &self,
        payloads: Vec<(Topic, Bytes)>,
    ) -> Vec<(Topic, Result<Outcome, Error>)> {
        let sink = self.sink();
        let handles: Vec<_> = payloads
            .into_iter()
            .map(|(topic, payload)| {
                let client = self.client.clone();
                let uri = self.registry.uri(topic).clone();
                let handle =
                    tokio::spawn(async move { send(&client, sink, topic, &uri, payload).await });
                (topic, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (topic, handle) in handles {
            let result = handle
                .await
                .unwrap_or_else(|source| Err(Error::Task { topic, source }));
            results.push((topic, result));
        }
        results
    }
}

/// Send `payload` to `uri` with `sink`'s method and content type, logging the
/// outcome.
///
/// # Errors
///
/// Returns an error if the request fails or the endpoint does not answer with
/// a success status.
pub async fn send(
    client: &reqwest::Client,
    sink: SinkKind,
    topic: Topic,
    uri: &Uri,
    payload: Bytes,
) -> Result<Outcome, Error> {
    let result = request(client, sink, topic, uri, payload).await;
    match &result {
        Ok(outcome) => info!("Sent to {sink}: {outcome}"),
        Err(err) => error!("Failed to send {topic} to {sink}: {err}"),
    }
    result
}

async fn request(
    client: &reqwest::Client,
    sink: SinkKind,
    topic: Topic,
    uri: &Uri,
    payload: Bytes,
) -> Result<Outcome, Error> {
    let labels = vec![
        ("sink".to_string(), sink.name().to_string()),
        ("topic".to_string(), topic.name().to_string()),
    ];
    let uri = uri.to_string();
    let payload_length = payload.len();

    let request_failure = |source: reqwest::Error| {
        let mut error_labels = labels.clone();
        error_labels.push(("error".to_string(), "request".to_string()));
        counter!("request_failure", &error_labels).increment(1);
        Error::Request {
            topic,
            uri: uri.clone(),
            source,
        }
    };

    counter!("requests_sent", &labels).increment(1);
    let response = client
        .request(sink.method(), uri.as_str())
        .header(CONTENT_TYPE, sink.content_type())
        .body(payload)
        .send()
        .await
        .map_err(&request_failure)?;
    counter!("bytes_written", &labels).increment(payload_length as u64);

    let status = response.status();
    let body = response.text().await.map_err(&request_failure)?;

    if status.is_success() {
        let mut status_labels = labels.clone();
        status_labels.push(("status_code".to_string(), status.as_u16().to_string()));
        counter!("request_ok", &status_labels).increment(1);
        Ok(Outcome {
            topic,
            status,
            body,
        })
    } else {
        let mut error_labels = labels.clone();
        error_labels.push(("status_code".to_string(), status.as_u16().to_string()));
        counter!("request_failure", &error_labels).increment(1);
        Err(Error::Status {
            topic,
            status,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::{stub, *};
    use crate::config::{Endpoints, TopicEndpoints};

    fn registry(sink: SinkKind, pin: String, geo: String, user: String) -> Registry {
        let section = TopicEndpoints {
            pin: Some(pin.parse().expect("invalid uri")),
            geo: Some(geo.parse().expect("invalid uri")),
            user: Some(user.parse().expect("invalid uri")),
        };
        let endpoints = match sink {
            SinkKind::Kafka => Endpoints {
                rest: Some(section),
                streams: None,
            },
            SinkKind::Kinesis => Endpoints {
                rest: None,
                streams: Some(section),
            },
        };
        Registry::new(sink, &endpoints).expect("registry failed")
    }

    fn payloads() -> Vec<(Topic, Bytes)> {
        Topic::ALL
            .iter()
            .map(|topic| (*topic, Bytes::from(format!("{{\"topic\":\"{topic}\"}}"))))
            .collect()
    }

    #[tokio::test]
    async fn kafka_dispatch_posts_with_rest_proxy_content_type() {
        let endpoint = stub::spawn(200, Duration::ZERO);
        let dispatcher = Dispatcher::new(
            registry(
                SinkKind::Kafka,
                endpoint.uri("pin"),
                endpoint.uri("geo"),
                endpoint.uri("user"),
            ),
            None,
        )
        .expect("dispatcher failed");

        let outcome = dispatcher
            .dispatch(Topic::Pin, Bytes::from_static(b"{\"records\":[]}"))
            .await
            .expect("dispatch failed");

        assert_eq!(outcome.topic, Topic::Pin);
        assert_eq!(outcome.status, StatusCode::OK);
        assert_eq!(outcome.body, "{\"status\":200}");
        // The logged outcome names the topic so concurrent lines stay apart.
        assert_eq!(outcome.to_string(), "pin 200, {\"status\":200}");
        let received = endpoint.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].method, "POST");
        assert_eq!(
            received[0].content_type.as_deref(),
            Some("application/vnd.kafka.json.v2+json")
        );
        assert_eq!(received[0].body, b"{\"records\":[]}");
    }

    #[tokio::test]
    async fn kinesis_dispatch_puts_json() {
        let endpoint = stub::spawn(200, Duration::ZERO);
        let dispatcher = Dispatcher::new(
            registry(
                SinkKind::Kinesis,
                endpoint.uri("pin"),
                endpoint.uri("geo"),
                endpoint.uri("user"),
            ),
            None,
        )
        .expect("dispatcher failed");

        dispatcher
            .dispatch(Topic::User, Bytes::from_static(b"{}"))
            .await
            .expect("dispatch failed");

        let received = endpoint.received();
        assert_eq!(received[0].method, "PUT");
        assert_eq!(received[0].content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let endpoint = stub::spawn(500, Duration::ZERO);
        let dispatcher = Dispatcher::new(
            registry(
                SinkKind::Kafka,
                endpoint.uri("pin"),
                endpoint.uri("geo"),
                endpoint.uri("user"),
            ),
            None,
        )
        .expect("dispatcher failed");

        let err = dispatcher
            .dispatch(Topic::Geo, Bytes::from_static(b"{}"))
            .await
            .expect_err("dispatch should fail");
        match err {
            Error::Status {
                topic,
                status,
                body,
            } => {
                assert_eq!(topic, Topic::Geo);
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "{\"status\":500}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatch_all_waits_for_slowest_not_sum() {
        let fast = stub::spawn(200, Duration::from_millis(100));
        let medium = stub::spawn(200, Duration::from_millis(200));
        let slow = stub::spawn(200, Duration::from_millis(400));
        let dispatcher = Dispatcher::new(
            registry(
                SinkKind::Kafka,
                fast.uri("pin"),
                medium.uri("geo"),
                slow.uri("user"),
            ),
            None,
        )
        .expect("dispatcher failed");

        let start = Instant::now();
        let results = dispatcher.dispatch_all(payloads()).await;
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        // Every endpoint has answered by the time dispatch_all returns.
        for endpoint in [&fast, &medium, &slow] {
            assert_eq!(endpoint.received().len(), 1);
        }
        assert!(elapsed >= Duration::from_millis(400), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(650), "ran sequentially: {elapsed:?}");
    }

    #[tokio::test]
    async fn failing_endpoint_does_not_stop_siblings() {
        let healthy = stub::spawn(200, Duration::ZERO);
        let broken = stub::spawn(500, Duration::ZERO);
        let dispatcher = Dispatcher::new(
            registry(
                SinkKind::Kinesis,
                healthy.uri("pin"),
                broken.uri("geo"),
                healthy.uri("user"),
            ),
            None,
        )
        .expect("dispatcher failed");

        let results = dispatcher.dispatch_all(payloads()).await;

        let topics: Vec<_> = results.iter().map(|(topic, _)| *topic).collect();
        assert_eq!(topics, Topic::ALL);
        assert!(results[0].1.is_ok());
        assert!(matches!(
            results[1].1,
            Err(Error::Status {
                topic: Topic::Geo,
                ..
            })
        ));
        assert!(results[2].1.is_ok());
        assert_eq!(healthy.received().len(), 2);
        assert_eq!(broken.received().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_error() {
        // Bind and drop a listener to find a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("bind failed")
            .local_addr()
            .expect("no local addr")
            .port();
        let dead = format!("http://127.0.0.1:{port}/pin");
        let dispatcher = Dispatcher::new(
            registry(SinkKind::Kafka, dead.clone(), dead.clone(), dead),
            Some(Duration::from_secs(2)),
        )
        .expect("dispatcher failed");

        let err = dispatcher
            .dispatch(Topic::Pin, Bytes::from_static(b"{}"))
            .await
            .expect_err("dispatch should fail");
        assert!(matches!(err, Error::Request { topic: Topic::Pin, .. }));
    }

    #[tokio::test]
    async fn request_timeout_is_enforced() {
        let endpoint = stub::spawn(200, Duration::from_secs(5));
        let dispatcher = Dispatcher::new(
            registry(
                SinkKind::Kafka,
                endpoint.uri("pin"),
                endpoint.uri("geo"),
                endpoint.uri("user"),
            ),
            Some(Duration::from_millis(100)),
        )
        .expect("dispatcher failed");

        let start = Instant::now();
        let err = dispatcher
            .dispatch(Topic::Pin, Bytes::from_static(b"{}"))
            .await
            .expect_err("dispatch should time out");
        assert!(start.elapsed() < Duration::from_secs(2));
        match err {
            Error::Request { source, .. } => assert!(source.is_timeout()),
            other => panic!("unexpected error: {other}"),
        }
    }
}
