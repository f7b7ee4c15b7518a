//! Aggregation engine seam.
//!
//! The orchestrator drives one engine per task label through
//! [`AggregationEngine`]. Estimation itself lives outside this crate; the
//! bundled [`ArchiveEngine`] only accumulates batches and persists them so a
//! pipeline can run end to end.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::EstimationConfig;
use crate::constants::engine::{DEFAULT_FINISHED_ANNOTATIONS, WORKING_FILE_SUFFIX};
use crate::data::{AnnotationEntry, BoundingBox, ImageInfo, NormalizedBatch};
use crate::errors::IngestError;
use crate::transport::fs::write_json_atomic;
use crate::types::{SubjectId, TaskLabel};

/// Sections written by [`AggregationEngine::save`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveOptions {
    /// Dataset-level parameters.
    pub dataset: bool,
    /// Per-image state.
    pub images: bool,
    /// Per-worker state.
    pub workers: bool,
    /// Raw annotations.
    pub annos: bool,
    /// Consensus boxes per image.
    pub combined_labels: bool,
}

impl SaveOptions {
    /// Every section.
    pub fn full() -> Self {
        Self {
            dataset: true,
            images: true,
            workers: true,
            annos: true,
            combined_labels: true,
        }
    }
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self::full()
    }
}

/// Finished-image tally returned after each cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FinishedReport {
    /// Images the engine considers finished.
    pub finished: usize,
    /// Images the engine knows about.
    pub total: usize,
}

impl FinishedReport {
    /// Tally a `check_finished_annotations` result.
    pub fn from_status(status: &IndexMap<SubjectId, bool>) -> Self {
        Self {
            finished: status.values().filter(|done| **done).count(),
            total: status.len(),
        }
    }

    /// Finished share in percent; zero when no image is known.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.finished as f64 / self.total as f64
        }
    }
}

/// Statistical aggregation engine driven by the orchestrator.
pub trait AggregationEngine {
    /// Merge a normalized batch into engine state.
    fn load(&mut self, batch: &NormalizedBatch, overwrite_workers: bool) -> Result<(), IngestError>;

    /// Run parameter estimation over the loaded state.
    fn estimate_parameters(&mut self, params: &EstimationConfig) -> Result<(), IngestError>;

    /// Completion status per image; `set_finished` latches finished images.
    fn check_finished_annotations(&mut self, set_finished: bool) -> IndexMap<SubjectId, bool>;

    /// Persist engine state to `path`.
    fn save(&self, path: &Path, options: &SaveOptions) -> Result<(), IngestError>;

    /// Remove intermediate working files. Missing files are not an error.
    fn purge_working_files(&mut self) -> Result<(), IngestError>;
}

impl<E: AggregationEngine + ?Sized> AggregationEngine for Box<E> {
    fn load(&mut self, batch: &NormalizedBatch, overwrite_workers: bool) -> Result<(), IngestError> {
        (**self).load(batch, overwrite_workers)
    }

    fn estimate_parameters(&mut self, params: &EstimationConfig) -> Result<(), IngestError> {
        (**self).estimate_parameters(params)
    }

    fn check_finished_annotations(&mut self, set_finished: bool) -> IndexMap<SubjectId, bool> {
        (**self).check_finished_annotations(set_finished)
    }

    fn save(&self, path: &Path, options: &SaveOptions) -> Result<(), IngestError> {
        (**self).save(path, options)
    }

    fn purge_working_files(&mut self) -> Result<(), IngestError> {
        (**self).purge_working_files()
    }
}

/// Per-worker tally kept by [`ArchiveEngine`].
#[derive(Clone, Debug, Default, Serialize)]
struct WorkerTally {
    annotations: usize,
    boxes: usize,
}

/// Engine that archives every batch it receives without estimating anything.
///
/// An image counts as finished once it holds `finished_threshold`
/// annotations. `estimate_parameters` writes the flattened box set to the
/// working file `<prefix>_working_set.json`.
pub struct ArchiveEngine {
    task: TaskLabel,
    working_path: PathBuf,
    finished_threshold: usize,
    images: IndexMap<SubjectId, ImageInfo>,
    annos: Vec<AnnotationEntry>,
    workers: IndexMap<String, WorkerTally>,
    finished: HashSet<SubjectId>,
    estimation_rounds: usize,
}

#[derive(Serialize)]
struct WorkingBox<'a> {
    image_id: &'a str,
    worker_id: &'a str,
    #[serde(flatten)]
    bbox: &'a BoundingBox,
}

impl ArchiveEngine {
    /// Create an engine for `task` whose working file lives next to `prefix`.
    pub fn new(task: impl Into<TaskLabel>, prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix.as_ref();
        let file_name = prefix
            .file_name()
            .map(|name| format!("{}_{WORKING_FILE_SUFFIX}", name.to_string_lossy()))
            .unwrap_or_else(|| WORKING_FILE_SUFFIX.to_string());
        Self {
            task: task.into(),
            working_path: prefix.with_file_name(file_name),
            finished_threshold: DEFAULT_FINISHED_ANNOTATIONS,
            images: IndexMap::new(),
            annos: Vec::new(),
            workers: IndexMap::new(),
            finished: HashSet::new(),
            estimation_rounds: 0,
        }
    }

    /// Annotations an image needs before it counts as finished.
    pub fn with_finished_threshold(mut self, threshold: usize) -> Self {
        self.finished_threshold = threshold.max(1);
        self
    }

    /// Path of the intermediate working file.
    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    /// Annotations held so far.
    pub fn annotation_count(&self) -> usize {
        self.annos.len()
    }

    /// Images known so far.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Completed `estimate_parameters` calls.
    pub fn estimation_rounds(&self) -> usize {
        self.estimation_rounds
    }

    fn annotation_counts(&self) -> IndexMap<&str, usize> {
        let mut counts: IndexMap<&str, usize> =
            self.images.keys().map(|id| (id.as_str(), 0)).collect();
        for entry in &self.annos {
            *counts.entry(entry.image_id.as_str()).or_default() += 1;
        }
        counts
    }

    fn combined_labels(&self) -> Map<String, Value> {
        let mut combined: IndexMap<&str, Vec<&BoundingBox>> = IndexMap::new();
        for entry in &self.annos {
            combined
                .entry(entry.image_id.as_str())
                .or_default()
                .extend(entry.anno.bboxes.iter());
        }
        combined
            .into_iter()
            .map(|(id, boxes)| (id.to_string(), serde_json::json!(boxes)))
            .collect()
    }
}

impl AggregationEngine for ArchiveEngine {
    fn load(&mut self, batch: &NormalizedBatch, overwrite_workers: bool) -> Result<(), IngestError> {
        if overwrite_workers {
            self.workers.clear();
        }
        for (id, info) in &batch.images {
            self.images.insert(id.clone(), info.clone());
        }
        for entry in &batch.annos {
            let tally = self.workers.entry(entry.worker_id.clone()).or_default();
            tally.annotations += 1;
            tally.boxes += entry.anno.bboxes.len();
        }
        self.annos.extend(batch.annos.iter().cloned());
        debug!(
            task = %self.task,
            images = batch.images.len(),
            annos = batch.annos.len(),
            "archive engine loaded batch"
        );
        Ok(())
    }

    fn estimate_parameters(&mut self, params: &EstimationConfig) -> Result<(), IngestError> {
        let working: Vec<WorkingBox<'_>> = self
            .annos
            .iter()
            .filter(|entry| !(params.avoid_if_finished && self.finished.contains(&entry.image_id)))
            .flat_map(|entry| {
                entry.anno.bboxes.iter().map(move |bbox| WorkingBox {
                    image_id: &entry.image_id,
                    worker_id: &entry.worker_id,
                    bbox,
                })
            })
            .collect();
        write_json_atomic(&self.working_path, &working).map_err(|err| IngestError::Engine {
            task: self.task.clone(),
            details: format!("failed to write working set: {err}"),
        })?;
        self.estimation_rounds += 1;
        debug!(
            task = %self.task,
            boxes = working.len(),
            max_iters = params.max_iters,
            refine = params.refine,
            "archive engine refreshed working set"
        );
        Ok(())
    }

    fn check_finished_annotations(&mut self, set_finished: bool) -> IndexMap<SubjectId, bool> {
        let status: IndexMap<SubjectId, bool> = self
            .annotation_counts()
            .into_iter()
            .map(|(id, count)| {
                let done = self.finished.contains(id) || count >= self.finished_threshold;
                (id.to_string(), done)
            })
            .collect();
        if set_finished {
            self.finished.extend(
                status
                    .iter()
                    .filter(|(_, done)| **done)
                    .map(|(id, _)| id.clone()),
            );
        }
        status
    }

    fn save(&self, path: &Path, options: &SaveOptions) -> Result<(), IngestError> {
        let mut document = Map::new();
        if options.dataset {
            document.insert(
                "dataset".to_string(),
                serde_json::json!({
                    "task": self.task,
                    "estimation_rounds": self.estimation_rounds,
                    "finished_threshold": self.finished_threshold,
                }),
            );
        }
        if options.images {
            document.insert("images".to_string(), serde_json::to_value(&self.images)?);
        }
        if options.workers {
            document.insert("workers".to_string(), serde_json::to_value(&self.workers)?);
        }
        if options.annos {
            document.insert("annos".to_string(), serde_json::to_value(&self.annos)?);
        }
        if options.combined_labels {
            document.insert(
                "combined_labels".to_string(),
                Value::Object(self.combined_labels()),
            );
        }
        write_json_atomic(path, &Value::Object(document))?;
        info!(
            task = %self.task,
            path = %path.display(),
            images = self.images.len(),
            annos = self.annos.len(),
            "archive engine saved"
        );
        Ok(())
    }

    fn purge_working_files(&mut self) -> Result<(), IngestError> {
        match fs::remove_file(&self.working_path) {
            Ok(()) => {
                debug!(
                    task = %self.task,
                    path = %self.working_path.display(),
                    "removed working file"
                );
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AnnotationBoxes, ImageDimensions, Mark};
    use tempfile::tempdir;

    fn batch(entries: &[(&str, &str)]) -> NormalizedBatch {
        let image = ImageDimensions {
            width: 100.0,
            height: 80.0,
        };
        let mut batch = NormalizedBatch::default();
        for (subject, worker) in entries {
            batch.images.insert(
                subject.to_string(),
                ImageInfo {
                    height: image.height,
                    width: image.width,
                    url: String::new(),
                },
            );
            batch.annos.push(AnnotationEntry {
                image_id: subject.to_string(),
                worker_id: worker.to_string(),
                anno: AnnotationBoxes {
                    bboxes: vec![BoundingBox::around(&Mark::new(10.0, 10.0, "0"), 4.0, 4.0, image)],
                },
            });
        }
        batch
    }

    #[test]
    fn finished_status_latches_when_requested() {
        let temp = tempdir().unwrap();
        let mut engine = ArchiveEngine::new("T1", temp.path().join("run_T1")).with_finished_threshold(2);
        engine.load(&batch(&[("a", "1"), ("a", "2"), ("b", "1")]), false).unwrap();

        let status = engine.check_finished_annotations(false);
        assert_eq!(status["a"], true);
        assert_eq!(status["b"], false);
        let report = FinishedReport::from_status(&status);
        assert_eq!((report.finished, report.total), (1, 2));
        assert_eq!(report.percent(), 50.0);

        engine.check_finished_annotations(true);
        engine.finished_threshold = 10;
        assert_eq!(engine.check_finished_annotations(false)["a"], true);
    }

    #[test]
    fn estimation_writes_and_purge_removes_the_working_file() {
        let temp = tempdir().unwrap();
        let mut engine = ArchiveEngine::new("T1", temp.path().join("run_T1"));
        assert_eq!(engine.working_path(), temp.path().join("run_T1_working_set.json"));
        engine.purge_working_files().unwrap();

        engine.load(&batch(&[("a", "1")]), false).unwrap();
        engine.estimate_parameters(&EstimationConfig::default()).unwrap();
        assert!(engine.working_path().exists());
        assert_eq!(engine.estimation_rounds(), 1);

        engine.purge_working_files().unwrap();
        assert!(!engine.working_path().exists());
    }

    #[test]
    fn save_writes_requested_sections() {
        let temp = tempdir().unwrap();
        let mut engine = ArchiveEngine::new("T1", temp.path().join("run_T1"));
        engine.load(&batch(&[("a", "1"), ("b", "2")]), false).unwrap();
        let path = temp.path().join("run_T1_aggregated.json");
        engine.save(&path, &SaveOptions::full()).unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["dataset"]["task"], "T1");
        assert_eq!(saved["images"]["a"]["width"], 100.0);
        assert_eq!(saved["workers"]["2"]["boxes"], 1);
        assert_eq!(saved["annos"].as_array().unwrap().len(), 2);
        assert_eq!(saved["combined_labels"]["b"][0]["x2"], 12.0);

        let partial = SaveOptions {
            annos: false,
            ..SaveOptions::full()
        };
        engine.save(&path, &partial).unwrap();
        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved.get("annos").is_none());
    }

    #[test]
    fn overwrite_workers_resets_tallies() {
        let mut engine = ArchiveEngine::new("T1", "run_T1");
        engine.load(&batch(&[("a", "1")]), false).unwrap();
        engine.load(&batch(&[("b", "2")]), true).unwrap();
        assert_eq!(engine.workers.len(), 1);
        assert_eq!(engine.annotation_count(), 2);
        assert_eq!(engine.image_count(), 2);
    }
}
