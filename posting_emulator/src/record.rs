//! Sampled rows and the topics they belong to.
//!
//! A [`Record`] is one database row, kept in the column order the database
//! projected it in. Records are created once per cycle and never mutated after
//! sampling; the encoder only borrows them.

use std::fmt;

use serde::{
    Deserialize, Serialize, Serializer,
    ser::{Error as _, SerializeMap},
};
use time::{PrimitiveDateTime, macros::format_description};

/// One of the three fixed data categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Posts, read from `pinterest_data`.
    Pin,
    /// Post locations, read from `geolocation_data`.
    Geo,
    /// Posting users, read from `user_data`.
    User,
}

impl Topic {
    /// All topics in sampling order.
    pub const ALL: [Topic; 3] = [Topic::Pin, Topic::Geo, Topic::User];

    /// The topic name as it appears on the wire and in configuration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Topic::Pin => "pin",
            Topic::Geo => "geo",
            Topic::User => "user",
        }
    }

    /// The source table this topic samples from.
    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Topic::Pin => "pinterest_data",
            Topic::Geo => "geolocation_data",
            Topic::User => "user_data",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Double precision floating point
    Float(f64),
    /// Single precision floating point, written with the shortest text that
    /// round-trips as `f32`
    Float32(f32),
    /// UTF-8 text
    Text(String),
    /// Date and time of day without zone
    Timestamp(PrimitiveDateTime),
    /// A value with no JSON representation. `kind` names the source type.
    Unsupported {
        /// Short name of the source type, `decimal` or `binary` for instance.
        kind: &'static str,
    },
}

impl Value {
    /// Returns the unsupported source type name, if this value has one.
    #[must_use]
    pub fn unsupported_kind(&self) -> Option<&'static str> {
        match self {
            Value::Unsupported { kind } => Some(*kind),
            _ => None,
        }
    }
}

/// Formats a timestamp as `YYYY-MM-DDTHH:MM:SS`, appending microseconds only
/// when they are non-zero.
///
/// # Errors
///
/// Returns an error if the year cannot be represented by the format.
pub fn format_timestamp(timestamp: &PrimitiveDateTime) -> Result<String, time::error::Format> {
    if timestamp.microsecond() == 0 {
        timestamp.format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]"
        ))
    } else {
        timestamp.format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"
        ))
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::UInt(v) => serializer.serialize_u64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Float32(v) => serializer.serialize_f32(*v),
            Value::Text(v) => serializer.serialize_str(v),
            Value::Timestamp(v) => {
                let text = format_timestamp(v).map_err(S::Error::custom)?;
                serializer.serialize_str(&text)
            }
            Value::Unsupported { kind } => Err(S::Error::custom(format!(
                "value of type {kind} is not serializable"
            ))),
        }
    }
}

/// One sampled row: an ordered mapping from column name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, Value)>,
}

impl Record {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column, builder style.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.push(column, value);
        self
    }

    /// Append a column.
    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.columns.push((column.into(), value));
    }

    /// Look up the first column with the given name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the record has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate columns in projection order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
