//! Row sets fetched from the remote query service.
//!
//! A [`RowSet`] is an ordered list of records over a fixed, ordered column
//! list. Each cell is a dynamically-typed [`Scalar`]. Records decoded from
//! JSON keep strings as [`Scalar::Text`]; conversion to the destination
//! column type happens at bind time (see the [`ToSql`] impl), driven by the
//! parameter type PostgreSQL infers for the target column.

use std::error::Error;
use std::fmt;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

use crate::error::SyncError;

/// A single nullable cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Text(String),
}

type BindError = Box<dyn Error + Sync + Send>;

impl Scalar {
    /// Decode a JSON value. Arrays and objects are kept as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => n.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null),
            },
            Value::String(s) => Scalar::Text(s.clone()),
            other => Scalar::Text(other.to_string()),
        }
    }

    /// Decode a value read back from the store as text (e.g. `MAX(col)::text`).
    pub fn from_store_text(text: &str) -> Self {
        if let Ok(i) = text.parse::<i64>() {
            return Scalar::Int(i);
        }
        if let Some(ts) = parse_timestamp(text) {
            return Scalar::Timestamp(ts);
        }
        if let Ok(f) = text.parse::<f64>() {
            return Scalar::Float(f);
        }
        Scalar::Text(text.to_string())
    }

    /// Decode a value read back from a column whose type is `pg_type` (as
    /// printed by `pg_typeof`). Values of character columns are kept exactly
    /// as stored.
    pub fn from_store(text: &str, pg_type: &str) -> Self {
        match pg_type {
            "text" | "character varying" | "character" | "name" | "\"char\"" => {
                Scalar::Text(text.to_string())
            }
            _ => Self::from_store_text(text),
        }
    }

    /// JSON form sent as a remote query parameter.
    pub fn to_parameter(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Int(i) => Value::from(*i),
            other => Value::String(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Whether the value is a number with no fractional part that fits `i64`.
    pub fn is_integral(&self) -> bool {
        match self {
            Scalar::Int(_) => true,
            Scalar::Float(f) => float_as_i64(*f).is_some(),
            _ => false,
        }
    }

    fn as_i64(&self) -> Result<i64, BindError> {
        match self {
            Scalar::Int(i) => Ok(*i),
            Scalar::Float(f) => {
                float_as_i64(*f).ok_or_else(|| format!("{f} is not an integer").into())
            }
            Scalar::Bool(b) => Ok(i64::from(*b)),
            Scalar::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| format!("cannot read {s:?} as integer: {e}").into()),
            other => Err(format!("cannot bind {other} as integer").into()),
        }
    }

    fn as_f64(&self) -> Result<f64, BindError> {
        match self {
            Scalar::Int(i) => Ok(*i as f64),
            Scalar::Float(f) => Ok(*f),
            Scalar::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("cannot read {s:?} as float: {e}").into()),
            other => Err(format!("cannot bind {other} as float").into()),
        }
    }

    fn as_bool(&self) -> Result<bool, BindError> {
        match self {
            Scalar::Bool(b) => Ok(*b),
            Scalar::Int(0) => Ok(false),
            Scalar::Int(1) => Ok(true),
            Scalar::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" => Ok(true),
                "false" | "f" => Ok(false),
                _ => Err(format!("cannot read {s:?} as boolean").into()),
            },
            other => Err(format!("cannot bind {other} as boolean").into()),
        }
    }

    fn as_timestamp(&self) -> Result<DateTime<Utc>, BindError> {
        match self {
            Scalar::Timestamp(ts) => Ok(*ts),
            Scalar::Text(s) => {
                parse_timestamp(s).ok_or_else(|| format!("cannot read {s:?} as timestamp").into())
            }
            other => Err(format!("cannot bind {other} as timestamp").into()),
        }
    }

    fn as_json(&self) -> Value {
        match self {
            Scalar::Null => Value::Null,
            Scalar::Int(i) => Value::from(*i),
            Scalar::Float(f) => Value::from(*f),
            Scalar::Bool(b) => Value::Bool(*b),
            Scalar::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            Scalar::Text(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "NULL"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Scalar::Text(s) => write!(f, "{s}"),
        }
    }
}

fn float_as_i64(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_807.0;
    if f.is_finite() && f.fract() == 0.0 && f.abs() < LIMIT {
        Some(f as i64)
    } else {
        None
    }
}

/// Parse the datetime spellings seen in query results and warehouse text output.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff] UTC`, PostgreSQL's
/// `timestamptz::text` form (`+00` offsets), naive datetimes with a space or
/// `T` separator, and bare dates (midnight UTC).
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    // Cheap reject before trying every format: must start with YYYY-MM-DD.
    let bytes = s.as_bytes();
    if bytes.len() < 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(naive) = s.strip_suffix(" UTC")
        && let Ok(dt) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
    {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc());
        }
    }
    if s.len() == 10 {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc());
    }
    None
}

impl ToSql for Scalar {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BindError> {
        if self.is_null() {
            return Ok(IsNull::Yes);
        }
        match *ty {
            Type::INT8 => self.as_i64()?.to_sql(ty, out),
            Type::INT4 => i32::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::INT2 => i16::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::FLOAT8 => self.as_f64()?.to_sql(ty, out),
            Type::FLOAT4 => (self.as_f64()? as f32).to_sql(ty, out),
            Type::BOOL => self.as_bool()?.to_sql(ty, out),
            Type::TIMESTAMPTZ => self.as_timestamp()?.to_sql(ty, out),
            Type::TIMESTAMP => self.as_timestamp()?.naive_utc().to_sql(ty, out),
            Type::DATE => self.as_timestamp()?.date_naive().to_sql(ty, out),
            Type::JSON | Type::JSONB => self.as_json().to_sql(ty, out),
            _ => self.to_string().to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT8
                | Type::INT4
                | Type::INT2
                | Type::FLOAT8
                | Type::FLOAT4
                | Type::BOOL
                | Type::TIMESTAMPTZ
                | Type::TIMESTAMP
                | Type::DATE
                | Type::JSON
                | Type::JSONB
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::UNKNOWN
        )
    }

    to_sql_checked!();
}

/// An ordered sequence of records over an ordered column list.
///
/// Invariant: every row has exactly `columns().len()` cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Scalar>>,
}

impl RowSet {
    /// Build a row set from aligned rows. Fails if any row is the wrong width.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Scalar>>) -> Result<Self, SyncError> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != columns.len())
        {
            return Err(SyncError::Configuration(format!(
                "row {idx} has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    /// A row set with columns but no records.
    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Decode JSON records (objects) into a row set.
    ///
    /// Column order follows `column_hint` (result metadata) first, then the
    /// order of first appearance across records. Keys missing from a record
    /// become [`Scalar::Null`].
    pub fn from_json_records(
        records: &[serde_json::Map<String, Value>],
        column_hint: &[String],
    ) -> Self {
        let mut columns: Vec<String> = Vec::with_capacity(column_hint.len());
        for name in column_hint {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
        for record in records {
            for key in record.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).map(Scalar::from_json).unwrap_or(Scalar::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Scalar>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Scalar> {
        self.rows.iter().map(move |row| &row[idx])
    }
}
