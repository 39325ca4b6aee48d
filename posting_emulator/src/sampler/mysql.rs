//! MySQL row source.
//!
//! Rows are read with a prepared statement over the binary protocol so column
//! values arrive typed. Table names are fixed identifiers owned by [`Topic`];
//! only the offset is bound as a parameter.
//!
//! [`Topic`]: crate::record::Topic

use mysql_async::{
    Conn, Opts, OptsBuilder, Row,
    consts::ColumnType,
    prelude::Queryable,
};
use time::{Date, Month, PrimitiveDateTime, Time};
use tracing::debug;

use super::{Connection, Database, Error};
use crate::{
    config,
    record::{Record, Value},
};

/// Character set number MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

/// Opens a fresh MySQL connection per cycle.
#[derive(Debug, Clone)]
pub struct MySql {
    opts: Opts,
}

impl MySql {
    /// Create a new [`MySql`] from database configuration.
    #[must_use]
    pub fn new(config: &config::Database) -> Self {
        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.name.clone()));
        Self { opts: opts.into() }
    }
}

impl Database for MySql {
    type Connection = MySqlConnection;

    async fn connect(&self) -> Result<Self::Connection, Error> {
        let conn = Conn::new(self.opts.clone())
            .await
            .map_err(|err| Error::Connect(Box::new(err)))?;
        debug!(
            "Connected to MySQL at {host}:{port}",
            host = self.opts.ip_or_hostname(),
            port = self.opts.tcp_port()
        );
        Ok(MySqlConnection { conn })
    }
}

/// A MySQL connection held for one cycle.
#[derive(Debug)]
pub struct MySqlConnection {
    conn: Conn,
}

impl Connection for MySqlConnection {
    async fn fetch_row(
        &mut self,
        table: &'static str,
        offset: u64,
    ) -> Result<Option<Record>, Error> {
        let statement = format!("SELECT * FROM {table} LIMIT ?, 1");
        let row: Option<Row> = self
            .conn
            .exec_first(statement.as_str(), (offset,))
            .await
            .map_err(|err| Error::Query {
                table,
                source: Box::new(err),
            })?;
        Ok(row.map(convert_row))
    }

    async fn close(self) -> Result<(), Error> {
        self.conn
            .disconnect()
            .await
            .map_err(|err| Error::Connect(Box::new(err)))
    }
}

fn convert_row(row: Row) -> Record {
    let columns = row.columns();
    columns
        .iter()
        .zip(row.unwrap())
        .map(|(column, value)| {
            (
                column.name_str().into_owned(),
                convert_value(column.column_type(), column.character_set(), value),
            )
        })
        .collect()
}

/// Map a MySQL value to a record value using its column metadata.
pub(crate) fn convert_value(
    column_type: ColumnType,
    charset: u16,
    value: mysql_async::Value,
) -> Value {
    use mysql_async::Value as Sql;

    match value {
        Sql::NULL => Value::Null,
        Sql::Int(v) => Value::Int(v),
        Sql::UInt(v) => Value::UInt(v),
        Sql::Float(v) => Value::Float32(v),
        Sql::Double(v) => Value::Float(v),
        Sql::Date(year, month, day, hour, minute, second, micros) => match column_type {
            ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
                Value::Unsupported { kind: "date" }
            }
            _ => calendar_date(year, month, day)
                .and_then(|date| {
                    Time::from_hms_micro(hour, minute, second, micros)
                        .ok()
                        .map(|time| PrimitiveDateTime::new(date, time))
                })
                .map_or(Value::Unsupported { kind: "zero datetime" }, Value::Timestamp),
        },
        Sql::Time(..) => Value::Unsupported { kind: "time" },
        Sql::Bytes(bytes) => match column_type {
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                Value::Unsupported { kind: "decimal" }
            }
            _ if charset == BINARY_CHARSET => Value::Unsupported { kind: "binary" },
            _ => String::from_utf8(bytes).map_or(Value::Unsupported { kind: "binary" }, Value::Text),
        },
    }
}

fn calendar_date(year: u16, month: u8, day: u8) -> Option<Date> {
    let month = Month::try_from(month).ok()?;
    Date::from_calendar_date(i32::from(year), month, day).ok()
}
