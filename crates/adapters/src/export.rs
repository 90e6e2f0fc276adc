use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use tabula_core::results::{CellValue, QueryResult};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot export a failed result: {0}")]
    FailedResult(String),
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes `result` as CSV with a header row. NULL cells are left empty.
pub fn export_result_to_csv(path: &Path, result: &QueryResult) -> Result<usize, ExportError> {
    ensure_exportable(result)?;

    let mut content = String::new();
    content.push_str(
        &result
            .columns
            .iter()
            .map(|column| csv_escape(column))
            .collect::<Vec<_>>()
            .join(","),
    );
    content.push('\n');

    for row in &result.rows {
        let values = result
            .columns
            .iter()
            .map(|column| match row.get(column) {
                None | Some(CellValue::Null) => String::new(),
                Some(value) => csv_escape(&value.to_string()),
            })
            .collect::<Vec<_>>();
        content.push_str(&values.join(","));
        content.push('\n');
    }

    write(path, content)?;
    Ok(result.rows.len())
}

/// Writes `result` as a JSON array of objects keyed by column name.
pub fn export_result_to_json(path: &Path, result: &QueryResult) -> Result<usize, ExportError> {
    ensure_exportable(result)?;

    let records = result
        .rows
        .iter()
        .map(|row| {
            let object = result
                .columns
                .iter()
                .map(|column| {
                    let value = row.get(column).map_or(Value::Null, CellValue::to_json);
                    (column.clone(), value)
                })
                .collect::<Map<_, _>>();
            Value::Object(object)
        })
        .collect::<Vec<_>>();

    let payload = serde_json::to_string_pretty(&records)?;
    write(path, payload)?;
    Ok(result.rows.len())
}

fn ensure_exportable(result: &QueryResult) -> Result<(), ExportError> {
    match &result.error {
        Some(error) => Err(ExportError::FailedResult(error.clone())),
        None => Ok(()),
    }
}

fn write(path: &Path, content: String) -> Result<(), ExportError> {
    fs::write(path, content).map_err(|source| ExportError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
