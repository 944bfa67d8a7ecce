//! JSON record to FASTA conversion.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde_json::{Map, Value};

use crate::domain::{ColumnRole, FormatParams};
use crate::error::ExportError;

/// Renders one record as FASTA lines.
///
/// A single-field record becomes its bare value. Anything wider needs a column
/// map: `comment` fields form the `> ` header joined by ` | `, `data` fields are
/// concatenated in record order into the sequence line.
pub fn record_to_fasta(
    record: &Map<String, Value>,
    column_map: Option<&BTreeMap<String, ColumnRole>>,
) -> Result<String, ExportError> {
    if record.len() == 1 {
        let value = record.values().next().map(render).unwrap_or_default();
        return Ok(format!("{value}\n"));
    }
    let column_map = match column_map {
        Some(map) if !map.is_empty() => map,
        _ => {
            return Err(ExportError::Configuration(
                "FASTA input record has more than one field and no column map was specified"
                    .to_string(),
            ));
        }
    };

    let mut comment = String::new();
    let mut data = String::new();
    for (key, value) in record {
        match column_map.get(key) {
            Some(ColumnRole::Comment) => {
                if comment.is_empty() {
                    comment.push_str("> ");
                } else {
                    comment.push_str(" | ");
                }
                comment.push_str(&render(value));
            }
            Some(ColumnRole::Data) => data.push_str(&render(value)),
            None => {}
        }
    }
    Ok(format!("{comment}\n{data}\n"))
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_record(value: Value) -> Result<Map<String, Value>, ExportError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ExportError::Configuration(format!(
            "FASTA input entries must be JSON objects, got {other}"
        ))),
    }
}

/// Converts `input` (a JSON array or a newline-delimited stream of objects)
/// into FASTA text written to `output`, preserving record order.
pub fn convert_file(input: &Path, output: &Path, params: &FormatParams) -> Result<(), ExportError> {
    let mut reader = BufReader::new(
        File::open(input).map_err(|err| ExportError::Storage(format!("open {}: {err}", input.display())))?,
    );
    let mut writer = BufWriter::new(
        File::create(output)
            .map_err(|err| ExportError::Storage(format!("create {}: {err}", output.display())))?,
    );
    let column_map = params.column_map.as_ref();

    if is_json_stream(&mut reader)? {
        for line in reader.lines() {
            let line = line.map_err(|err| ExportError::Storage(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line).map_err(|err| {
                ExportError::UpstreamHttp(format!("malformed JSON stream line: {err}"))
            })?;
            let lines = record_to_fasta(&as_record(value)?, column_map)?;
            writer
                .write_all(lines.as_bytes())
                .map_err(|err| ExportError::Storage(err.to_string()))?;
        }
    } else {
        let value: Value = serde_json::from_reader(reader)
            .map_err(|err| ExportError::UpstreamHttp(format!("malformed JSON document: {err}")))?;
        let entries = match value {
            Value::Array(entries) => entries,
            other => vec![other],
        };
        for entry in entries {
            let lines = record_to_fasta(&as_record(entry)?, column_map)?;
            writer
                .write_all(lines.as_bytes())
                .map_err(|err| ExportError::Storage(err.to_string()))?;
        }
    }

    writer
        .flush()
        .map_err(|err| ExportError::Storage(err.to_string()))
}

/// Peeks at the first non-whitespace byte and rewinds.
fn is_json_stream<R: Read + Seek>(reader: &mut R) -> Result<bool, ExportError> {
    let mut byte = [0u8; 1];
    let mut is_stream = false;
    loop {
        let read = reader
            .read(&mut byte)
            .map_err(|err| ExportError::Storage(err.to_string()))?;
        if read == 0 {
            break;
        }
        if !byte[0].is_ascii_whitespace() {
            is_stream = byte[0] == b'{';
            break;
        }
    }
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|err| ExportError::Storage(err.to_string()))?;
    Ok(is_stream)
}
