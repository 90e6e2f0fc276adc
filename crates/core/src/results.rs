use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Blob(Vec<u8>),
    Json(Value),
}

impl CellValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::UInt(value) => i64::try_from(*value).ok(),
            Self::Text(text) => text.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Text(text) if text.eq_ignore_ascii_case("yes") => Some(true),
            Self::Text(text) if text.eq_ignore_ascii_case("no") => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => json!(value),
            Self::Int(value) => json!(value),
            Self::UInt(value) => json!(value),
            Self::Float(value) => json!(value),
            Self::Text(value) => json!(value),
            Self::Date(value) => json!(value.to_string()),
            Self::Time(value) => json!(value.to_string()),
            Self::Timestamp(value) => json!(value.to_string()),
            Self::Blob(bytes) => json!(bytes),
            Self::Json(value) => value.clone(),
        }
    }

    fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    Self::Int(value)
                } else if let Some(value) = number.as_u64() {
                    Self::UInt(value)
                } else {
                    number.as_f64().map_or(Self::Null, Self::Float)
                }
            }
            Value::String(text) => Self::Text(text),
            other @ (Value::Array(_) | Value::Object(_)) => Self::Json(other),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::UInt(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Date(value) => write!(f, "{value}"),
            Self::Time(value) => write!(f, "{value}"),
            Self::Timestamp(value) => write!(f, "{value}"),
            Self::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Json(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeColumn {
    pub name: String,
    pub data_type: String,
}

impl NativeColumn {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NativeResult {
    pub columns: Vec<NativeColumn>,
    pub rows: Vec<Vec<CellValue>>,
}

impl NativeResult {
    pub fn first_column(&self) -> impl Iterator<Item = &CellValue> {
        self.rows.iter().filter_map(|row| row.first())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Native(NativeResult),
    Envelope(Value),
}

impl RawResult {
    pub fn normalize(self) -> Result<QueryResult, MalformedResultError> {
        match self {
            Self::Native(native) => from_native(native),
            Self::Envelope(envelope) => from_envelope(envelope),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed result: {0}")]
pub struct MalformedResultError(pub String);

pub type Row = BTreeMap<String, CellValue>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub error: Option<String>,
}

impl QueryResult {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn row_values(&self, index: usize) -> Option<Vec<&CellValue>> {
        let row = self.rows.get(index)?;
        self.columns.iter().map(|column| row.get(column)).collect()
    }
}

pub fn from_native(native: NativeResult) -> Result<QueryResult, MalformedResultError> {
    let (names, column_types): (Vec<_>, Vec<_>) = native
        .columns
        .into_iter()
        .map(|column| (column.name, column.data_type))
        .unzip();
    build_result(names, column_types, native.rows)
}

#[derive(Debug, Deserialize)]
struct Envelope {
    meta: Vec<EnvelopeColumn>,
    data: Vec<Vec<Value>>,
    #[serde(default)]
    rows: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeColumn {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
}

pub fn from_envelope(envelope: Value) -> Result<QueryResult, MalformedResultError> {
    let envelope: Envelope =
        serde_json::from_value(envelope).map_err(|error| MalformedResultError(error.to_string()))?;
    if let Some(declared) = envelope.rows {
        if usize::try_from(declared).ok() != Some(envelope.data.len()) {
            tracing::debug!(
                declared,
                received = envelope.data.len(),
                "remote row count differs from received rows"
            );
        }
    }

    let (names, column_types): (Vec<_>, Vec<_>) = envelope
        .meta
        .into_iter()
        .map(|column| (column.name, column.data_type))
        .unzip();
    let rows = envelope
        .data
        .into_iter()
        .map(|row| row.into_iter().map(CellValue::from_json).collect())
        .collect();
    build_result(names, column_types, rows)
}

fn build_result(
    names: Vec<String>,
    column_types: Vec<String>,
    rows: Vec<Vec<CellValue>>,
) -> Result<QueryResult, MalformedResultError> {
    let columns = unique_column_names(names);
    let mut keyed_rows = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        if row.len() != columns.len() {
            return Err(MalformedResultError(format!(
                "row {index} has {} values but {} columns were declared",
                row.len(),
                columns.len()
            )));
        }
        keyed_rows.push(columns.iter().cloned().zip(row).collect::<Row>());
    }

    Ok(QueryResult {
        row_count: keyed_rows.len(),
        columns,
        column_types,
        rows: keyed_rows,
        error: None,
    })
}

fn unique_column_names(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(names.len());
    let mut unique = Vec::with_capacity(names.len());
    for name in names {
        if seen.insert(name.clone()) {
            unique.push(name);
            continue;
        }
        let mut suffix = 1_usize;
        loop {
            let candidate = format!("{name}_{suffix}");
            if seen.insert(candidate.clone()) {
                unique.push(candidate);
                break;
            }
            suffix += 1;
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::{CellValue, NativeColumn, NativeResult, RawResult};

    #[test]
    fn native_rows_are_keyed_by_column() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).expect("valid date");
        let native = NativeResult {
            columns: vec![
                NativeColumn::new("id", "INTEGER"),
                NativeColumn::new("sold_on", "DATE"),
            ],
            rows: vec![
                vec![CellValue::Int(1), CellValue::Date(date)],
                vec![CellValue::Int(2), CellValue::Null],
            ],
        };

        let result = RawResult::Native(native).normalize().expect("normalize");
        assert_eq!(result.columns, vec!["id", "sold_on"]);
        assert_eq!(result.column_types, vec!["INTEGER", "DATE"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["sold_on"], CellValue::Date(date));
        for row in &result.rows {
            assert_eq!(row.keys().count(), result.columns.len());
        }
    }

    #[test]
    fn envelope_is_reconstructed_into_rows() {
        let envelope = json!({
            "meta": [{"name": "region", "type": "String"}, {"name": "total", "type": "UInt64"}],
            "data": [["emea", 10], ["apac", 4.5]],
            "rows": 2
        });

        let result = RawResult::Envelope(envelope).normalize().expect("normalize");
        assert_eq!(result.columns, vec!["region", "total"]);
        assert_eq!(result.column_types, vec!["String", "UInt64"]);
        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["total"], CellValue::Int(10));
        assert_eq!(result.rows[1]["total"], CellValue::Float(4.5));
        assert_eq!(
            result.row_values(1),
            Some(vec![&CellValue::Text("apac".to_string()), &CellValue::Float(4.5)])
        );
    }

    #[test]
    fn envelope_without_meta_or_with_ragged_rows_is_malformed() {
        let missing_meta = json!({"data": [[1]], "rows": 1});
        assert!(RawResult::Envelope(missing_meta).normalize().is_err());

        let ragged = json!({
            "meta": [{"name": "a", "type": "Int32"}],
            "data": [[1, 2]],
            "rows": 1
        });
        let error = RawResult::Envelope(ragged)
            .normalize()
            .expect_err("ragged rows must be rejected");
        assert!(error.to_string().contains("row 0"));

        let bad_rows = json!({"meta": [], "data": [], "rows": "many"});
        assert!(RawResult::Envelope(bad_rows).normalize().is_err());
    }

    #[test]
    fn duplicate_column_names_keep_every_value() {
        let native = NativeResult {
            columns: vec![
                NativeColumn::new("x", "INTEGER"),
                NativeColumn::new("x", "INTEGER"),
                NativeColumn::new("x_1", "INTEGER"),
            ],
            rows: vec![vec![CellValue::Int(1), CellValue::Int(2), CellValue::Int(3)]],
        };

        let result = RawResult::Native(native).normalize().expect("normalize");
        assert_eq!(result.columns, vec!["x", "x_1", "x_1_1"]);
        assert_eq!(result.rows[0].len(), 3);
        assert_eq!(result.rows[0]["x_1"], CellValue::Int(2));
    }
}
