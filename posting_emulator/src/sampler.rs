//! Row sampling.
//!
//! Every cycle draws one random offset and reads exactly one row at that offset
//! from each topic's table over a connection opened for that cycle alone. The
//! three rows are independent: nothing joins them and they need not describe
//! the same user or post.
//!
//! The database is reached through the [`Database`] and [`Connection`] traits so
//! the sampler can be exercised without a server. [`mysql::MySql`] is the
//! production implementation.

use std::future::Future;

use rand::Rng;
use tracing::{debug, warn};

use crate::record::{Record, Topic};

pub mod mysql;

/// Boxed error from a database driver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Sampler`]. Any of these aborts the cycle.
pub enum Error {
    /// The database could not be reached.
    #[error("Failed to connect to database: {0}")]
    Connect(#[source] BoxError),
    /// A read query failed.
    #[error("Query against {table} failed: {source}")]
    Query {
        /// Table queried
        table: &'static str,
        /// Underlying driver error
        #[source]
        source: BoxError,
    },
    /// The table has no row at the sampled offset.
    #[error("Table for topic {topic} has no row at offset {offset}")]
    EmptyResult {
        /// Topic sampled
        topic: Topic,
        /// Offset sampled
        offset: u64,
    },
}

/// A source of fresh connections.
pub trait Database {
    /// Connection type produced by [`Database::connect`].
    type Connection: Connection;

    /// Open a new connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Error>> + Send;
}

/// A single open database connection.
pub trait Connection {
    /// Read the row at `offset` from `table`, or `None` if the table is
    /// shorter than that.
    fn fetch_row(
        &mut self,
        table: &'static str,
        offset: u64,
    ) -> impl Future<Output = Result<Option<Record>, Error>> + Send;

    /// Release the connection.
    fn close(self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// One row per topic, all read at the same offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// The offset every row was read at
    pub offset: u64,
    /// Row from `pinterest_data`
    pub pin: Record,
    /// Row from `geolocation_data`
    pub geo: Record,
    /// Row from `user_data`
    pub user: Record,
}

impl Sample {
    /// The record sampled for `topic`.
    #[must_use]
    pub fn get(&self, topic: Topic) -> &Record {
        match topic {
            Topic::Pin => &self.pin,
            Topic::Geo => &self.geo,
            Topic::User => &self.user,
        }
    }
}

/// Draws offsets and reads one row per topic.
#[derive(Debug)]
pub struct Sampler<D> {
    database: D,
    offset_upper_bound: u64,
}

impl<D> Sampler<D>
where
    D: Database,
{
    /// Create a new [`Sampler`]. Offsets are drawn from
    /// `0..=offset_upper_bound`.
    #[must_use]
    pub fn new(database: D, offset_upper_bound: u64) -> Self {
        Self {
            database,
            offset_upper_bound,
        }
    }

    /// Draw a random offset and sample every topic at it.
    ///
    /// # Errors
    ///
    /// See [`Sampler::sample_at`].
    pub async fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Sample, Error> {
        let offset = rng.random_range(0..=self.offset_upper_bound);
        self.sample_at(offset).await
    }

    /// Sample every topic at `offset` over a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be opened, a query fails, or
    /// any table has no row at `offset`. No partial sample is returned.
    pub async fn sample_at(&self, offset: u64) -> Result<Sample, Error> {
        let mut connection = self.database.connect().await?;
        let result = read_all(&mut connection, offset).await;
        if let Err(err) = connection.close().await {
            warn!("Failed to close database connection: {err}");
        }
        result
    }
}

async fn read_all<C: Connection>(connection: &mut C, offset: u64) -> Result<Sample, Error> {
    let pin = read_one(connection, Topic::Pin, offset).await?;
    let geo = read_one(connection, Topic::Geo, offset).await?;
    let user = read_one(connection, Topic::User, offset).await?;
    Ok(Sample {
        offset,
        pin,
        geo,
        user,
    })
}

async fn read_one<C: Connection>(
    connection: &mut C,
    topic: Topic,
    offset: u64,
) -> Result<Record, Error> {
    let record = connection
        .fetch_row(topic.table(), offset)
        .await?
        .ok_or(Error::EmptyResult { topic, offset })?;
    debug!(
        "Sampled {columns} columns for {topic} at offset {offset}",
        columns = record.len()
    );
    Ok(record)
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::StdRng};

    use super::{memory::MemoryDatabase, *};
    use crate::record::Value;

    #[tokio::test]
    async fn sample_at_reads_one_row_per_topic() {
        let database = MemoryDatabase::with_rows(10);
        let sampler = Sampler::new(database.clone(), 9);

        let sample = sampler.sample_at(4).await.expect("sample failed");

        assert_eq!(sample.offset, 4);
        for topic in Topic::ALL {
            let record = sample.get(topic);
            assert_eq!(record.get("ind"), Some(&Value::UInt(4)));
            assert_eq!(
                record.get("topic"),
                Some(&Value::Text(topic.name().to_string()))
            );
        }
        assert_eq!(database.connects.load(Ordering::SeqCst), 1);
        assert_eq!(database.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offset_past_end_is_empty_result() {
        let database = MemoryDatabase::with_rows(10).with_table("user_data", vec![]);
        let sampler = Sampler::new(database.clone(), 9);

        let err = sampler.sample_at(3).await.expect_err("sample should fail");

        assert!(matches!(
            err,
            Error::EmptyResult {
                topic: Topic::User,
                offset: 3
            }
        ));
        // The connection is released even when sampling fails.
        assert_eq!(database.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_database_is_connect_error() {
        let sampler = Sampler::new(MemoryDatabase::unreachable(), 9);
        let err = sampler.sample_at(0).await.expect_err("sample should fail");
        assert!(matches!(err, Error::Connect(_)));
    }

    #[tokio::test]
    async fn query_failure_names_table() {
        let database = MemoryDatabase::default().with_table("pinterest_data", vec![Record::new()]);
        let sampler = Sampler::new(database, 0);
        let err = sampler.sample_at(0).await.expect_err("sample should fail");
        match err {
            Error::Query { table, .. } => assert_eq!(table, "geolocation_data"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn each_sample_opens_a_fresh_connection() {
        let database = MemoryDatabase::with_rows(5);
        let sampler = Sampler::new(database.clone(), 4);
        let mut rng = StdRng::from_seed([7; 32]);

        for _ in 0..3 {
            sampler.sample(&mut rng).await.expect("sample failed");
        }

        assert_eq!(database.connects.load(Ordering::SeqCst), 3);
        assert_eq!(database.closes.load(Ordering::SeqCst), 3);
    }

    proptest! {
        #[test]
        fn sample_within_bound_yields_every_topic(seed: [u8; 32], rows in 1u64..64) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime failed");
            let sampler = Sampler::new(MemoryDatabase::with_rows(rows), rows - 1);
            let mut rng = StdRng::from_seed(seed);

            let sample = runtime.block_on(sampler.sample(&mut rng)).expect("sample failed");

            prop_assert!(sample.offset < rows);
            for topic in Topic::ALL {
                prop_assert!(!sample.get(topic).is_empty());
            }
        }
    }
}
