pub mod influx;
pub mod line;

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::api::Point;
use crate::tags::TagSet;

pub use influx::InfluxSink;
pub use line::Precision;

/// A single field value of a discrete record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Float(f64),
    Integer(i64),
    Bool(bool),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => n.as_f64().map_or(FieldValue::Null, FieldValue::Float),
            },
            Value::String(s) => FieldValue::String(s),
            // Nested structures are kept as their JSON text.
            other @ (Value::Array(_) | Value::Object(_)) => FieldValue::String(other.to_string()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// A discrete row: one timestamp, its tags and a set of typed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: DateTime<Utc>,
    pub tags: TagSet,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Builds a record, dropping null fields.
    pub fn new<I, K>(time: DateTime<Utc>, tags: TagSet, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<String>,
    {
        let fields = fields
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.into(), v))
            .collect();

        Self { time, tags, fields }
    }
}

/// Time-series store used as both the destination and the checkpoint source.
pub trait TimeSeriesSink: Send + Sync {
    /// Verify the store is reachable.
    fn ping(&self) -> impl Future<Output = Result<()>> + Send;

    /// Time of the newest row of `series` carrying exactly `tags`, if any.
    fn last_recorded_time(
        &self,
        series: &str,
        tags: &TagSet,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Write one row per point under `series` and `tags` with a `value` field.
    /// Returns the number of rows sent.
    fn write_points(
        &self,
        series: &str,
        tags: &TagSet,
        points: &[Point],
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Write discrete records under `series`. Returns the number of rows sent.
    fn write_records(
        &self,
        series: &str,
        records: &[Record],
    ) -> impl Future<Output = Result<usize>> + Send;
}
