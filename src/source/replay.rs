use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::ReplayConfig;
use crate::constants::parser::ANONYMOUS_WORKER_ID;
use crate::constants::replay::REPLAY_SOURCE_ID;
use crate::data::{RawMessage, UniqueMessage, float_like, integer_like};
use crate::errors::IngestError;
use crate::source::{FetchBatch, MessageSource};
use crate::transport::fs::{file_mtime, read_message_dump};
use crate::types::{ClassificationId, SubjectId};

/// Load-time counters for a replay source.
#[derive(Clone, Debug, Default)]
pub struct ReplayStats {
    /// Records kept for replay.
    pub loaded: usize,
    /// Records dropped for lacking a classification id.
    pub missing_id: usize,
    /// Records dropped because their id was already loaded.
    pub repeated_id: usize,
    /// Records dropped by the anonymous-worker filter.
    pub filtered_anonymous: usize,
    /// Records dropped by the training-subject filter.
    pub filtered_non_training: usize,
    /// Records whose subject metadata received a looked-up size.
    pub enriched: usize,
}

struct DumpFile {
    path: PathBuf,
    mtime: Option<DateTime<Utc>>,
}

struct SizeLookup {
    field: String,
    values: HashMap<SubjectId, f64>,
}

/// Offline source that replays message dumps in randomly sized slices.
///
/// Records are held in load order; a cursor advances through them and never
/// revisits a record, so repeated fetches enumerate every record once.
pub struct ReplaySource {
    config: ReplayConfig,
    files: Vec<DumpFile>,
    records: Vec<UniqueMessage>,
    known: HashSet<ClassificationId>,
    cursor: usize,
    rng: StdRng,
    size_lookup: Option<SizeLookup>,
    stats: ReplayStats,
}

impl ReplaySource {
    /// Load every dump file named in `config`.
    ///
    /// Unreadable or malformed files are fatal.
    pub fn new(config: ReplayConfig) -> Result<Self, IngestError> {
        if config.paths.is_empty() {
            return Err(IngestError::Configuration(
                "replay source needs at least one dump file".to_string(),
            ));
        }
        let mut source = Self::empty(config)?;
        let paths = source.config.paths.clone();
        for path in paths {
            let messages = read_message_dump(&path)?;
            source.files.push(DumpFile {
                mtime: file_mtime(&path),
                path,
            });
            source.ingest(messages);
        }
        info!(
            source_id = REPLAY_SOURCE_ID,
            files = source.files.len(),
            records = source.records.len(),
            "replay source loaded"
        );
        Ok(source)
    }

    /// Build a replay source over in-memory messages (no backing files).
    pub fn from_messages<I>(messages: I, config: ReplayConfig) -> Result<Self, IngestError>
    where
        I: IntoIterator<Item = RawMessage>,
    {
        let mut source = Self::empty(config)?;
        source.ingest(messages);
        Ok(source)
    }

    fn empty(config: ReplayConfig) -> Result<Self, IngestError> {
        config.validate()?;
        let size_lookup = match &config.size_lookup {
            Some(lookup) => Some(SizeLookup {
                field: lookup.field.clone(),
                values: load_size_lookup(&lookup.path)?,
            }),
            None => None,
        };
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            files: Vec::new(),
            records: Vec::new(),
            known: HashSet::new(),
            cursor: 0,
            size_lookup,
            stats: ReplayStats::default(),
        })
    }

    /// Load-time counters.
    pub fn stats(&self) -> &ReplayStats {
        &self.stats
    }

    /// Total records held (consumed or not).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` when no record was loaded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records not yet returned by `fetch`.
    pub fn remaining(&self) -> usize {
        self.records.len() - self.cursor
    }

    fn ingest<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = RawMessage>,
    {
        let mut appended = 0usize;
        for raw in messages {
            let Some(mut message) = UniqueMessage::new(raw) else {
                self.stats.missing_id += 1;
                continue;
            };
            if self.known.contains(&message.classification_id()) {
                self.stats.repeated_id += 1;
                continue;
            }
            if self.config.skip_anonymous && is_anonymous(message.message()) {
                self.stats.filtered_anonymous += 1;
                continue;
            }
            if self.config.training_only
                && !is_training(message.message(), &self.config.training_key)
            {
                self.stats.filtered_non_training += 1;
                continue;
            }
            if let Some(lookup) = &self.size_lookup
                && enrich(message.message_mut(), lookup)
            {
                self.stats.enriched += 1;
            }
            self.known.insert(message.classification_id());
            self.records.push(message);
            appended += 1;
        }
        self.stats.loaded += appended;
        appended
    }

    fn refresh_file(&mut self, idx: usize) -> Result<usize, IngestError> {
        let path = self.files[idx].path.clone();
        let current = file_mtime(&path);
        let stale = match (self.files[idx].mtime, current) {
            (Some(previous), Some(current)) => current > previous,
            (None, Some(_)) => true,
            _ => false,
        };
        if !stale {
            return Ok(0);
        }
        let messages = read_message_dump(&path)?;
        self.files[idx].mtime = current;
        let appended = self.ingest(messages);
        debug!(
            source_id = REPLAY_SOURCE_ID,
            path = %path.display(),
            appended,
            "re-read modified dump file"
        );
        Ok(appended)
    }
}

impl MessageSource for ReplaySource {
    fn id(&self) -> &str {
        REPLAY_SOURCE_ID
    }

    fn fetch(&mut self, _delete_on_ack: bool) -> Result<FetchBatch, IngestError> {
        if self.cursor >= self.records.len() {
            return Ok(FetchBatch::default());
        }
        let size = self
            .rng
            .random_range(self.config.min_fetch..=self.config.max_fetch);
        let end = (self.cursor + size).min(self.records.len());
        let slice = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(FetchBatch::from_arrivals(slice))
    }

    fn is_prededuplicated(&self) -> bool {
        true
    }

    /// Re-read dump files whose modification time advanced.
    fn update(&mut self) -> Result<usize, IngestError> {
        let mut appended = 0usize;
        for idx in 0..self.files.len() {
            appended += self.refresh_file(idx)?;
        }
        if appended > 0 {
            info!(
                source_id = REPLAY_SOURCE_ID,
                appended,
                remaining = self.remaining(),
                "replay source picked up new records"
            );
        }
        Ok(appended)
    }
}

fn classification(message: &RawMessage) -> Option<&Map<String, Value>> {
    message
        .pointer("/data/classification")
        .and_then(Value::as_object)
}

fn is_anonymous(message: &RawMessage) -> bool {
    let worker = classification(message)
        .and_then(|payload| payload.get("user_id"))
        .or_else(|| message.get("user_id"))
        .and_then(integer_like);
    worker.is_none_or(|id| id == ANONYMOUS_WORKER_ID)
}

fn is_training(message: &RawMessage, key: &str) -> bool {
    let flag = classification(message)
        .and_then(|payload| payload.get("subject"))
        .and_then(|subject| subject.get("metadata"))
        .and_then(|metadata| metadata.get(key));
    match flag {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => {
            matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1")
        }
        Some(Value::Number(number)) => number.as_f64() == Some(1.0),
        _ => false,
    }
}

fn subject_id(message: &RawMessage) -> Option<SubjectId> {
    classification(message)
        .and_then(|payload| payload.get("subject"))
        .and_then(|subject| subject.get("id"))
        .or_else(|| message.get("subject_id"))
        .and_then(|id| match id {
            Value::String(text) => Some(text.trim().to_string()),
            other => integer_like(other).map(|id| id.to_string()),
        })
}

fn enrich(message: &mut RawMessage, lookup: &SizeLookup) -> bool {
    let Some(value) = subject_id(message).and_then(|id| lookup.values.get(&id).copied()) else {
        return false;
    };
    let Some(subject) = message
        .pointer_mut("/data/classification/subject")
        .and_then(Value::as_object_mut)
    else {
        return false;
    };
    let metadata = subject
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    let Some(metadata) = metadata.as_object_mut() else {
        return false;
    };
    if metadata.contains_key(&lookup.field) {
        return false;
    }
    metadata.insert(lookup.field.clone(), Value::from(value));
    true
}

fn load_size_lookup(path: &Path) -> Result<HashMap<SubjectId, f64>, IngestError> {
    let text = std::fs::read_to_string(path).map_err(|err| IngestError::SourceUnavailable {
        source_id: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let table = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(table)) => table,
        Ok(_) => {
            return Err(IngestError::MalformedDump {
                path: path.to_path_buf(),
                details: "size lookup must be a JSON object keyed by subject id".to_string(),
            });
        }
        Err(err) => {
            return Err(IngestError::MalformedDump {
                path: path.to_path_buf(),
                details: err.to_string(),
            });
        }
    };
    let mut values = HashMap::with_capacity(table.len());
    let mut skipped = 0usize;
    for (subject, value) in table {
        match float_like(&value) {
            Some(value) => {
                values.insert(subject.trim().to_string(), value);
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(
            path = %path.display(),
            skipped,
            "size lookup entries without numeric values were ignored"
        );
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn message(id: i64, user: Value, training: bool) -> RawMessage {
        json!({
            "classification_id": id,
            "user_id": user,
            "subject_id": 100 + id,
            "data": {"classification": {
                "user_id": user,
                "subject": {"id": 100 + id, "metadata": {"#training": training}},
                "annotations": {}
            }}
        })
    }

    fn drain(source: &mut ReplaySource) -> Vec<ClassificationId> {
        let mut ids = Vec::new();
        loop {
            let batch = source.fetch(false).unwrap();
            if batch.is_empty() {
                break;
            }
            ids.extend(batch.ids);
        }
        ids
    }

    #[test]
    fn fixed_fetch_enumerates_every_record_once() {
        let messages = (0..23).map(|id| message(id, json!(1), false));
        let mut source =
            ReplaySource::from_messages(messages, ReplayConfig::new(Vec::<PathBuf>::new()).with_fixed_fetch(5))
                .unwrap();
        let first = source.fetch(false).unwrap();
        assert_eq!(first.ids, vec![0, 1, 2, 3, 4]);
        let mut ids = first.ids;
        ids.extend(drain(&mut source));
        assert_eq!(ids, (0..23).collect::<Vec<_>>());
        assert_eq!(source.remaining(), 0);
        assert!(source.fetch(false).unwrap().is_empty());
    }

    #[test]
    fn random_slices_stay_within_range() {
        let messages = (0..500).map(|id| message(id, json!(1), false));
        let mut source = ReplaySource::from_messages(
            messages,
            ReplayConfig::new(Vec::<PathBuf>::new()).with_fetch_range(40, 60),
        )
        .unwrap();
        let mut total = 0usize;
        while source.remaining() >= 60 {
            let batch = source.fetch(false).unwrap();
            assert!((40..=60).contains(&batch.unique.len()));
            total += batch.unique.len();
        }
        total += drain(&mut source).len();
        assert_eq!(total, 500);
    }

    #[test]
    fn filters_anonymous_and_non_training_messages() {
        let messages = vec![
            message(1, json!(5), true),
            message(2, json!(null), true),
            message(3, json!(6), false),
            message(4, json!("-99"), true),
            message(1, json!(5), true),
            json!({"no_id": true}),
        ];
        let source = ReplaySource::from_messages(
            messages,
            ReplayConfig::new(Vec::<PathBuf>::new())
                .with_skip_anonymous(true)
                .with_training_only(true),
        )
        .unwrap();
        assert_eq!(source.len(), 1);
        let stats = source.stats();
        assert_eq!(stats.filtered_anonymous, 2);
        assert_eq!(stats.filtered_non_training, 1);
        assert_eq!(stats.repeated_id, 1);
        assert_eq!(stats.missing_id, 1);
    }

    #[test]
    fn enriches_messages_missing_the_size_field() {
        let temp = tempdir().unwrap();
        let lookup = temp.path().join("sizes.json");
        fs::write(&lookup, r#"{"101": 12.5, "102": "8", "103": "n/a"}"#).unwrap();
        let mut with_size = message(2, json!(1), false);
        with_size["data"]["classification"]["subject"]["metadata"]["size"] = json!(3.0);
        let source = ReplaySource::from_messages(
            vec![message(1, json!(1), false), with_size],
            ReplayConfig::new(Vec::<PathBuf>::new()).with_size_lookup(&lookup, "size"),
        )
        .unwrap();
        assert_eq!(source.stats().enriched, 1);
        let first = source.records[0].message();
        assert_eq!(
            first["data"]["classification"]["subject"]["metadata"]["size"],
            json!(12.5)
        );
        let second = source.records[1].message();
        assert_eq!(
            second["data"]["classification"]["subject"]["metadata"]["size"],
            json!(3.0)
        );
    }

    #[test]
    fn update_appends_only_new_records_from_modified_files() {
        let temp = tempdir().unwrap();
        let dump = temp.path().join("dump.jsonl");
        let line = |id: i64| format!("{}\n", message(id, json!(1), false));
        fs::write(&dump, format!("{}{}", line(1), line(2))).unwrap();
        let mut source =
            ReplaySource::new(ReplayConfig::new([&dump]).with_fixed_fetch(10)).unwrap();
        assert_eq!(drain(&mut source), vec![1, 2]);
        assert_eq!(source.update().unwrap(), 0);

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&dump, format!("{}{}{}", line(1), line(2), line(3))).unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&dump)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert_eq!(source.update().unwrap(), 1);
        assert_eq!(drain(&mut source), vec![3]);
    }

    #[test]
    fn construction_fails_on_missing_or_malformed_storage() {
        let temp = tempdir().unwrap();
        assert!(matches!(
            ReplaySource::new(ReplayConfig::new([temp.path().join("missing.json")])),
            Err(IngestError::SourceUnavailable { .. })
        ));
        let bad = temp.path().join("bad.json");
        fs::write(&bad, "[1, 2").unwrap();
        assert!(matches!(
            ReplaySource::new(ReplayConfig::new([&bad])),
            Err(IngestError::MalformedDump { .. })
        ));
        assert!(matches!(
            ReplaySource::new(ReplayConfig::new(Vec::<PathBuf>::new())),
            Err(IngestError::Configuration(_))
        ));
    }
}
