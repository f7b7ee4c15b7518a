use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

use serde_json::Value;

use crate::data::RawMessage;
use crate::errors::IngestError;

/// Best-effort file modified time.
pub fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    Some(system_time_to_utc(modified))
}

fn system_time_to_utc(time: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Read a message dump file.
///
/// Accepts either a JSON array of messages or JSON-lines (one message per
/// non-empty line). Any other shape is a [`IngestError::MalformedDump`].
pub fn read_message_dump(path: &Path) -> Result<Vec<RawMessage>, IngestError> {
    let text = fs::read_to_string(path).map_err(|err| IngestError::SourceUnavailable {
        source_id: path.display().to_string(),
        reason: err.to_string(),
    })?;
    parse_message_dump(path, &text)
}

fn parse_message_dump(path: &Path, text: &str) -> Result<Vec<RawMessage>, IngestError> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(messages)) => Ok(messages),
            Ok(_) => Err(malformed(path, "expected a JSON array of messages")),
            Err(err) => Err(malformed(path, &err.to_string())),
        };
    }
    let mut messages = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message = serde_json::from_str::<Value>(line)
            .map_err(|err| malformed(path, &format!("line {}: {err}", line_no + 1)))?;
        messages.push(message);
    }
    Ok(messages)
}

fn malformed(path: &Path, details: &str) -> IngestError {
    IngestError::MalformedDump {
        path: path.to_path_buf(),
        details: details.to_string(),
    }
}

/// Write `value` as pretty JSON, replacing `path` atomically via a sibling temp file.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), IngestError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, payload)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
