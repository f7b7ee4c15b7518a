use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{SourceId, TaskLabel};

/// Error type for configuration, source, transport, and persistence failures.
///
/// Exhaustion and "nothing new to process" are not errors; they are reported
/// through `CycleOutcome` and `ProcessOutcome` instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("message source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable { source_id: SourceId, reason: String },
    #[error("message dump '{}' is malformed: {details}", path.display())]
    MalformedDump { path: PathBuf, details: String },
    #[error("queue transport failure: {0}")]
    Transport(String),
    #[error("aggregation engine for task '{task}' failed: {details}")]
    Engine { task: TaskLabel, details: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
