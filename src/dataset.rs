//! JSONL record files.
//!
//! One JSON value per line in, the same records with one derived column per model out.

use crate::engine::AlignedResults;
use crate::models::{EngineError, Record, Result};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Load records from a JSONL file, skipping blank lines.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).map_err(|e| EngineError::io("opening input file", e))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| EngineError::io("reading input file", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .map_err(|e| EngineError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
        records.push(record);
    }

    info!(count = records.len(), path = %path.display(), "Loaded records");
    Ok(records)
}

/// Copy of `record` with `column` set to `value`.
///
/// Non-object records are wrapped as `{"input": record}` first.
pub fn with_column(record: &Record, column: &str, value: Option<&Value>) -> Record {
    let mut object = match record {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            map
        }
    };
    object.insert(column.to_string(), value.cloned().unwrap_or(Value::Null));
    Value::Object(object)
}

/// Write records with one derived column per `(column, results)` pair, in order;
/// `null` where no prediction exists.
pub fn write_output(
    path: &Path,
    records: &[Record],
    columns: &[(String, AlignedResults)],
) -> Result<()> {
    for (column, results) in columns {
        if records.len() != results.values.len() {
            return Err(EngineError::Internal(format!(
                "{} records but {} results for column {column}",
                records.len(),
                results.values.len()
            )));
        }
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::io("creating output directory", e))?;
    }

    let file = File::create(path).map_err(|e| EngineError::io("creating output file", e))?;
    let mut writer = BufWriter::new(file);
    for (i, record) in records.iter().enumerate() {
        let row = columns.iter().fold(record.clone(), |row, (column, results)| {
            with_column(&row, column, results.values[i].as_ref())
        });
        serde_json::to_writer(&mut writer, &row)
            .map_err(|e| EngineError::Internal(format!("serializing output row: {e}")))?;
        writeln!(writer).map_err(|e| EngineError::io("writing output file", e))?;
    }
    writer
        .flush()
        .map_err(|e| EngineError::io("flushing output file", e))?;

    info!(
        rows = records.len(),
        columns = columns.len(),
        path = %path.display(),
        "Output written"
    );
    Ok(())
}
