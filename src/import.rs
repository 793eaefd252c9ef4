use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::document::Document;
use crate::error::{Error, Result};

/// Field prepended to every imported row, holding its zero-based position.
pub const ROW_INDEX_FIELD: &str = "index";

/// Value type shared by every non-empty cell of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
}

/// Collection a data file loads into: its file name up to the first dot.
pub fn collection_name(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    name.split('.').next().filter(|stem| !stem.is_empty())
}

/// Read a CSV file with a header row into documents.
///
/// Each document starts with [`ROW_INDEX_FIELD`] followed by the columns in
/// header order. A column whose non-empty cells all parse as integers
/// becomes numbers, likewise floats, then `true`/`false`; anything else
/// stays text. Empty or missing cells become `null`.
pub fn read_csv(path: &Path) -> Result<Vec<Document>> {
    let import_error = |source: csv::Error| Error::Import {
        path: path.display().to_string(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(import_error)?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(import_error)?
        .iter()
        .map(str::to_string)
        .collect();
    let rows = reader
        .records()
        .collect::<std::result::Result<Vec<StringRecord>, _>>()
        .map_err(import_error)?;

    let types: Vec<ColumnType> = (0..headers.len()).map(|c| infer(&rows, c)).collect();
    debug!(path = %path.display(), rows = rows.len(), columns = headers.len(), "read csv");

    let docs = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut doc = Map::with_capacity(headers.len() + 1);
            doc.insert(ROW_INDEX_FIELD.to_string(), Value::from(i as u64));
            for (c, header) in headers.iter().enumerate() {
                let cell = row.get(c).unwrap_or("");
                doc.insert(header.clone(), convert(cell, types[c]));
            }
            doc
        })
        .collect();
    Ok(docs)
}

fn non_empty(rows: &[StringRecord], column: usize) -> impl Iterator<Item = &str> + '_ {
    rows.iter()
        .filter_map(move |row| row.get(column))
        .map(str::trim)
        .filter(|cell| !cell.is_empty())
}

fn infer(rows: &[StringRecord], column: usize) -> ColumnType {
    if non_empty(rows, column).all(|c| c.parse::<i64>().is_ok()) {
        ColumnType::Integer
    } else if non_empty(rows, column).all(|c| c.parse::<f64>().is_ok()) {
        ColumnType::Float
    } else if non_empty(rows, column).all(|c| parse_bool(c).is_some()) {
        ColumnType::Boolean
    } else {
        ColumnType::Text
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    match cell {
        "true" | "True" | "TRUE" => Some(true),
        "false" | "False" | "FALSE" => Some(false),
        _ => None,
    }
}

fn convert(cell: &str, ty: ColumnType) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match ty {
        ColumnType::Integer => trimmed.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        ColumnType::Float => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number),
        ColumnType::Boolean => parse_bool(trimmed).map_or(Value::Null, Value::Bool),
        ColumnType::Text => Value::String(cell.to_string()),
    }
}
