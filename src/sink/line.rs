//! InfluxDB line protocol encoding.
//!
//! `measurement,tag=v,tag=v field=v,field=v timestamp`

use std::fmt::Write;

use chrono::{DateTime, Utc};

use super::{FieldValue, Record};
use crate::api::Point;
use crate::tags::TagSet;

/// Timestamp precision of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Milliseconds,
    Nanoseconds,
}

impl Precision {
    /// Query parameter value for the write endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Milliseconds => "ms",
            Precision::Nanoseconds => "ns",
        }
    }

    /// Timestamp in this precision. `None` when it does not fit an i64.
    pub fn timestamp(self, t: DateTime<Utc>) -> Option<i64> {
        match self {
            Precision::Milliseconds => Some(t.timestamp_millis()),
            Precision::Nanoseconds => t.timestamp_nanos_opt(),
        }
    }
}

/// Appends one line per finite point. Returns the number of lines written.
pub fn encode_points(
    out: &mut String,
    series: &str,
    tags: &TagSet,
    points: &[Point],
    precision: Precision,
) -> usize {
    let mut prefix = String::with_capacity(series.len() + tags.len() * 24);
    write_series_key(&mut prefix, series, tags);

    let mut written = 0;
    for point in points {
        if !point.value.is_finite() {
            continue;
        }
        let Some(ts) = precision.timestamp(point.time) else {
            continue;
        };

        out.push_str(&prefix);
        out.push_str(" value=");
        write_float(out, point.value);
        let _ = writeln!(out, " {ts}");
        written += 1;
    }

    written
}

/// Appends one line per record that has at least one field.
/// Returns the number of lines written.
pub fn encode_records(
    out: &mut String,
    series: &str,
    records: &[Record],
    precision: Precision,
) -> usize {
    let mut written = 0;

    for record in records {
        let Some(ts) = precision.timestamp(record.time) else {
            continue;
        };

        let mut fields = record
            .fields
            .iter()
            .filter(|(_, v)| is_encodable(v))
            .peekable();
        if fields.peek().is_none() {
            continue;
        }

        write_series_key(out, series, &record.tags);
        out.push(' ');
        for (idx, (name, value)) in fields.enumerate() {
            if idx > 0 {
                out.push(',');
            }
            escape_key(out, name);
            out.push('=');
            write_field(out, value);
        }
        let _ = writeln!(out, " {ts}");
        written += 1;
    }

    written
}

fn is_encodable(value: &FieldValue) -> bool {
    match value {
        FieldValue::Null => false,
        FieldValue::Float(f) => f.is_finite(),
        _ => true,
    }
}

fn write_series_key(out: &mut String, series: &str, tags: &TagSet) {
    escape_measurement(out, series);
    for (k, v) in tags.iter() {
        if v.is_empty() {
            continue;
        }
        out.push(',');
        escape_key(out, k);
        out.push('=');
        escape_key(out, v);
    }
}

fn write_field(out: &mut String, value: &FieldValue) {
    match value {
        FieldValue::String(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' | '\\' => {
                        out.push('\\');
                        out.push(c);
                    }
                    '\n' => out.push_str("\\n"),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
        FieldValue::Float(f) => write_float(out, *f),
        FieldValue::Integer(i) => {
            let _ = write!(out, "{i}i");
        }
        FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        FieldValue::Null => {}
    }
}

fn write_float(out: &mut String, value: f64) {
    let _ = write!(out, "{value}");
}

fn escape_measurement(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            ',' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
}

/// Escapes tag keys, tag values and field keys.
fn escape_key(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            ',' | '=' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
}
