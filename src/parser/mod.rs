//! Per-task annotation parsing.
//!
//! An [`AnnotationParser`] turns deduplicated raw messages into bounding-box
//! observations for one task label and keeps them in a running table until
//! the orchestrator has handed them to an engine.
//!
//! Pipeline per `process` call:
//! - admission: ids seen in an earlier call and subjects rejected by the
//!   metadata predicate are dropped (and logged),
//! - decoding: payloads that do not decode are excluded silently,
//! - marking extraction, box sizing, subject dimensions, duplicate-tap filter,
//! - accumulation keyed by classification id (latest wins),
//! - spam report (one task only) and batch assembly.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::ParserConfig;
use crate::constants::parser::{
    DEFAULT_MARK_HEIGHT, DEFAULT_MARK_WIDTH, NATURAL_HEIGHT_KEY, NATURAL_WIDTH_KEY,
    PLACEHOLDER_IMAGE_HEIGHT, PLACEHOLDER_IMAGE_WIDTH, SUBJECT_DIMENSIONS_KEY,
};
use crate::data::{
    AnnotationBoxes, AnnotationEntry, Classification, ImageDimensions, ImageInfo, Mark,
    NormalizedBatch, TaskAnnotation, UniqueMessage, float_like, integer_like,
};
use crate::dedup::Deduplicator;
use crate::errors::IngestError;
use crate::types::{ClassificationId, SubjectId, TaskLabel, ToolLabel, WorkerId};

/// Duplicate-tap filtering and box geometry.
pub mod taps;
/// Per-worker spam heuristic.
pub mod spam;

pub use spam::{SpamReport, TapCounts, WorkerActivity};

/// Summary of one [`AnnotationParser::process`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Classifications that passed admission and decoded.
    pub eligible: usize,
    /// Eligible classifications carrying this task's annotations.
    pub marked: usize,
    /// Ids rejected because an earlier call already processed them.
    pub repeated: Vec<ClassificationId>,
    /// Ids rejected by the subject metadata predicate.
    pub filtered: Vec<ClassificationId>,
    /// Admitted messages whose payload did not decode.
    pub malformed: usize,
}

impl ProcessOutcome {
    /// Returns `true` when at least one classification was eligible.
    pub fn is_progress(&self) -> bool {
        self.eligible > 0
    }
}

/// One classification after geometry extraction.
#[derive(Clone, Debug)]
struct ParsedClassification {
    subject_id: SubjectId,
    worker_id: WorkerId,
    raw_taps: usize,
    marks: Vec<Mark>,
    box_width: f64,
    box_height: f64,
    image: ImageDimensions,
}

/// Which box dimension is being resolved (for logs).
#[derive(Clone, Copy, Debug)]
enum Axis {
    Width,
    Height,
}

impl Axis {
    fn name(self) -> &'static str {
        match self {
            Self::Width => "width",
            Self::Height => "height",
        }
    }

    fn default_size(self) -> f64 {
        match self {
            Self::Width => DEFAULT_MARK_WIDTH,
            Self::Height => DEFAULT_MARK_HEIGHT,
        }
    }
}

/// Parser for one task label.
pub struct AnnotationParser {
    config: ParserConfig,
    seen: Deduplicator,
    subject_dimensions: IndexMap<SubjectId, ImageDimensions>,
    last_dimensions: Option<ImageDimensions>,
    table: IndexMap<ClassificationId, ParsedClassification>,
    batch: NormalizedBatch,
    spam_report: Option<SpamReport>,
}

impl AnnotationParser {
    /// Create a parser after validating `config`.
    pub fn new(config: ParserConfig) -> Result<Self, IngestError> {
        config.validate()?;
        if config.mark_width.is_none() && config.width_field.is_none() {
            info!(
                task = %config.task_label,
                width = DEFAULT_MARK_WIDTH * config.mark_scale_factor,
                "no width source configured; using default mark width"
            );
        }
        if config.mark_height.is_none() && config.height_field.is_none() {
            info!(
                task = %config.task_label,
                height = DEFAULT_MARK_HEIGHT * config.mark_scale_factor,
                "no height source configured; using default mark height"
            );
        }
        Ok(Self {
            config,
            seen: Deduplicator::new(),
            subject_dimensions: IndexMap::new(),
            last_dimensions: None,
            table: IndexMap::new(),
            batch: NormalizedBatch::default(),
            spam_report: None,
        })
    }

    /// Task label handled by this parser.
    pub fn task_label(&self) -> &TaskLabel {
        &self.config.task_label
    }

    /// Batch assembled by the latest successful `process` call.
    pub fn aggregator_input(&self) -> &NormalizedBatch {
        &self.batch
    }

    /// Classifications currently held in the running table.
    pub fn processed_classification_count(&self) -> usize {
        self.table.len()
    }

    /// Drop the running table and the assembled batch.
    ///
    /// Ids stay recorded as seen.
    pub fn clear_processed_classifications(&mut self) {
        self.table.clear();
        self.batch = NormalizedBatch::default();
    }

    /// Latest spam report, when this parser's task is the reporting task.
    pub fn spam_report(&self) -> Option<&SpamReport> {
        self.spam_report.as_ref()
    }

    /// Parse `messages` into the running table and rebuild the batch.
    ///
    /// No eligible classification is reported as no progress, not an error.
    pub fn process<I>(&mut self, messages: I) -> ProcessOutcome
    where
        I: IntoIterator<Item = UniqueMessage>,
    {
        let task = self.config.task_label.clone();
        let admission = self.seen.admit(messages);
        let mut outcome = ProcessOutcome {
            repeated: admission.repeated,
            ..ProcessOutcome::default()
        };
        if !outcome.repeated.is_empty() {
            info!(
                task = %task,
                classification_ids = ?outcome.repeated,
                "skipping classifications processed in an earlier cycle"
            );
        }

        let mut classifications = Vec::with_capacity(admission.accepted.len());
        for message in &admission.accepted {
            if !(self.config.subject_filter)(&subject_metadata(message)) {
                outcome.filtered.push(message.classification_id());
                continue;
            }
            match Classification::from_message(message) {
                Some(classification) => classifications.push(classification),
                None => outcome.malformed += 1,
            }
        }
        if !outcome.filtered.is_empty() {
            debug!(
                task = %task,
                classification_ids = ?outcome.filtered,
                "subject filter rejected classifications"
            );
        }

        outcome.eligible = classifications.len();
        if !outcome.is_progress() {
            info!(task = %task, "no new classifications to process");
            return outcome;
        }

        for classification in &classifications {
            if let Some(parsed) = self.parse_classification(classification) {
                outcome.marked += 1;
                self.table.insert(classification.classification_id, parsed);
            }
        }
        info!(
            task = %task,
            eligible = outcome.eligible,
            marked = outcome.marked,
            malformed = outcome.malformed,
            held = self.table.len(),
            "processed classifications"
        );

        if task == self.config.spam_report_task {
            self.report_spam();
        }
        self.batch = self.assemble_batch();
        outcome
    }

    fn parse_classification(&mut self, classification: &Classification) -> Option<ParsedClassification> {
        if !classification.has_markings() {
            return None;
        }
        let entry = classification.annotations.get(&self.config.task_label)?;
        let Some(taps) = task_taps(entry) else {
            debug!(
                task = %self.config.task_label,
                classification_id = classification.classification_id,
                "task annotation has no readable tap list"
            );
            return None;
        };

        let image = self.image_dimensions(classification);
        let box_width = self.box_dimension(Axis::Width, classification);
        let box_height = self.box_dimension(Axis::Height, classification);
        let marks = taps::filter_duplicate_taps(&taps, box_width, box_height);
        Some(ParsedClassification {
            subject_id: classification.subject_id.clone(),
            worker_id: classification.worker_id,
            raw_taps: taps.len(),
            marks,
            box_width,
            box_height,
            image,
        })
    }

    fn box_dimension(&self, axis: Axis, classification: &Classification) -> f64 {
        let (fixed, field) = match axis {
            Axis::Width => (self.config.mark_width, self.config.width_field.as_deref()),
            Axis::Height => (self.config.mark_height, self.config.height_field.as_deref()),
        };
        let scale = self.config.mark_scale_factor;
        if let Some(fixed) = fixed {
            return fixed * scale;
        }
        if let Some(field) = field {
            match classification.subject_metadata.get(field).and_then(float_like) {
                Some(value) => return value * scale,
                None => warn!(
                    task = %self.config.task_label,
                    classification_id = classification.classification_id,
                    field,
                    axis = axis.name(),
                    "mark size field missing or not numeric; using default"
                ),
            }
        }
        axis.default_size() * scale
    }

    /// Declared dimensions, else this subject's last known ones, else the
    /// most recent ones seen for any subject, else the placeholder size.
    fn image_dimensions(&mut self, classification: &Classification) -> ImageDimensions {
        let declared = declared_dimensions(&classification.classification_metadata)
            .or_else(|| declared_dimensions(&classification.subject_metadata));
        if let Some(dimensions) = declared {
            self.subject_dimensions
                .insert(classification.subject_id.clone(), dimensions);
            self.last_dimensions = Some(dimensions);
            return dimensions;
        }
        self.subject_dimensions
            .get(&classification.subject_id)
            .copied()
            .or(self.last_dimensions)
            .unwrap_or(ImageDimensions {
                width: PLACEHOLDER_IMAGE_WIDTH,
                height: PLACEHOLDER_IMAGE_HEIGHT,
            })
    }

    fn report_spam(&mut self) {
        let report = SpamReport::from_counts(self.table.values().map(|parsed| TapCounts {
            worker_id: parsed.worker_id,
            raw: parsed.raw_taps,
            filtered: parsed.marks.len(),
        }));
        for worker in report.suspects() {
            warn!(
                task = %self.config.task_label,
                worker_id = worker.worker_id,
                classifications = worker.classifications,
                total = report.total_classifications,
                mean_raw_taps = worker.mean_raw_taps,
                mean_filtered_taps = worker.mean_filtered_taps,
                median_raw_taps = worker.median_raw_taps,
                "worker flagged as possible spammer"
            );
        }
        debug!(
            task = %self.config.task_label,
            workers = report.workers.len(),
            "spam report updated"
        );
        self.spam_report = Some(report);
    }

    fn assemble_batch(&self) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for parsed in self.table.values() {
            if self.config.excluded_subjects.contains(&parsed.subject_id) {
                continue;
            }
            batch
                .images
                .entry(parsed.subject_id.clone())
                .or_insert_with(|| ImageInfo {
                    height: parsed.image.height,
                    width: parsed.image.width,
                    url: String::new(),
                });
            batch.annos.push(AnnotationEntry {
                image_id: parsed.subject_id.clone(),
                worker_id: parsed.worker_id.to_string(),
                anno: AnnotationBoxes {
                    bboxes: taps::boxes_for(
                        &parsed.marks,
                        parsed.box_width,
                        parsed.box_height,
                        parsed.image,
                    ),
                },
            });
        }
        batch
    }
}

fn subject_metadata(message: &UniqueMessage) -> Map<String, Value> {
    message
        .message()
        .pointer("/data/classification/subject/metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Taps of the first entry recorded for a task, with tool labels.
fn task_taps(entry: &Value) -> Option<Vec<Mark>> {
    let first = entry.as_array()?.first()?;
    let annotation = TaskAnnotation::deserialize(first).ok()?;
    Some(
        annotation
            .value
            .into_iter()
            .map(|tap| Mark::new(tap.x, tap.y, tool_label(tap.tool.as_ref())))
            .collect(),
    )
}

fn tool_label(tool: Option<&Value>) -> ToolLabel {
    match tool {
        Some(Value::String(text)) => text.clone(),
        Some(other) => integer_like(other).map_or_else(|| other.to_string(), |id| id.to_string()),
        // Unlabelled taps belong to the first tool.
        None => "0".to_string(),
    }
}

fn declared_dimensions(metadata: &Map<String, Value>) -> Option<ImageDimensions> {
    let block = metadata.get(SUBJECT_DIMENSIONS_KEY)?.as_array()?.first()?;
    let width = block.get(NATURAL_WIDTH_KEY).and_then(float_like)?;
    let height = block.get(NATURAL_HEIGHT_KEY).and_then(float_like)?;
    Some(ImageDimensions { width, height })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    struct Tap(f64, f64);

    fn message(id: i64, subject: i64, worker: Value, taps: &[Tap], dims: Option<(f64, f64)>) -> UniqueMessage {
        let value: Vec<Value> = taps
            .iter()
            .enumerate()
            .map(|(idx, tap)| json!({"x": tap.0, "y": tap.1, "tool": idx % 2}))
            .collect();
        let metadata = match dims {
            Some((w, h)) => json!({"subject_dimensions": [{"naturalWidth": w, "naturalHeight": h}]}),
            None => json!({"subject_dimensions": []}),
        };
        UniqueMessage::new(json!({
            "classification_id": id,
            "user_id": worker,
            "subject_id": subject,
            "data": {"classification": {
                "subject": {"id": subject, "metadata": {"size": 10.0, "#training": subject % 2 == 0}},
                "user_id": worker,
                "metadata": metadata,
                "annotations": {"T1": [{"value": value}]}
            }}
        }))
        .unwrap()
    }

    fn parser(config: ParserConfig) -> AnnotationParser {
        AnnotationParser::new(config).unwrap()
    }

    #[test]
    fn builds_boxes_for_filtered_taps() {
        let mut parser = parser(ParserConfig::new("T1"));
        let outcome = parser.process(vec![message(
            1,
            10,
            json!(42),
            &[Tap(0.0, 0.0), Tap(1.0, 1.0), Tap(100.0, 100.0)],
            Some((640.0, 480.0)),
        )]);
        assert!(outcome.is_progress());
        assert_eq!(outcome.marked, 1);

        let batch = parser.aggregator_input();
        assert!(batch.dataset.is_empty() && batch.workers.is_empty());
        assert_eq!(batch.images["10"].width, 640.0);
        assert_eq!(batch.images["10"].height, 480.0);
        assert_eq!(batch.annos.len(), 1);
        let entry = &batch.annos[0];
        assert_eq!(entry.image_id, "10");
        assert_eq!(entry.worker_id, "42");
        let boxes = &entry.anno.bboxes;
        assert_eq!(boxes.len(), 2);
        assert_eq!((boxes[0].x, boxes[0].x2), (-17.5, 17.5));
        assert_eq!((boxes[1].y, boxes[1].y2), (82.5, 117.5));
        assert_eq!(boxes[1].tool, "0");
    }

    #[test]
    fn repeated_ids_are_rejected_across_calls() {
        let mut parser = parser(ParserConfig::new("T1"));
        assert!(parser.process(vec![message(1, 10, json!(1), &[Tap(5.0, 5.0)], None)]).is_progress());
        let outcome = parser.process(vec![message(1, 10, json!(1), &[Tap(5.0, 5.0)], None)]);
        assert!(!outcome.is_progress());
        assert_eq!(outcome.repeated, vec![1]);
        assert_eq!(parser.processed_classification_count(), 1);
    }

    #[test]
    fn anonymous_workers_and_missing_dimensions_use_fallbacks() {
        let mut parser = parser(ParserConfig::new("T1"));
        parser.process(vec![
            message(1, 10, Value::Null, &[Tap(5.0, 5.0)], None),
            message(2, 11, json!(3), &[Tap(5.0, 5.0)], Some((800.0, 600.0))),
            message(3, 12, json!("nobody"), &[Tap(5.0, 5.0)], None),
        ]);
        let batch = parser.aggregator_input();
        assert_eq!(batch.annos[0].worker_id, "-99");
        assert_eq!(batch.annos[2].worker_id, "-99");
        assert_eq!(batch.images["10"].width, PLACEHOLDER_IMAGE_WIDTH);
        assert_eq!(batch.images["11"].width, 800.0);
        // Carried forward from the last subject that declared its size.
        assert_eq!(batch.images["12"].width, 800.0);
        assert_eq!(batch.images["12"].height, 600.0);
    }

    #[test]
    fn known_subject_keeps_its_own_dimensions() {
        let mut parser = parser(ParserConfig::new("T1"));
        parser.process(vec![message(1, 10, json!(1), &[Tap(5.0, 5.0)], Some((800.0, 600.0)))]);
        parser.clear_processed_classifications();

        parser.process(vec![
            message(2, 20, json!(2), &[Tap(5.0, 5.0)], Some((100.0, 100.0))),
            message(3, 10, json!(3), &[Tap(5.0, 5.0)], None),
        ]);
        let batch = parser.aggregator_input();
        assert_eq!(batch.images["20"].width, 100.0);
        assert_eq!(batch.images["10"].width, 800.0);
        assert_eq!(batch.images["10"].height, 600.0);
        let bbox = &batch.annos[1].anno.bboxes[0];
        assert_eq!(batch.annos[1].image_id, "10");
        assert_eq!((bbox.image_width, bbox.image_height), (800.0, 600.0));
    }

    #[test]
    fn box_size_resolution_prefers_fixed_then_field_then_default() {
        let fixed = ParserConfig::new("T1")
            .with_fixed_mark_size(20.0, 10.0)
            .with_size_field("size")
            .with_mark_scale_factor(2.0);
        let mut parser = parser(fixed);
        parser.process(vec![message(1, 10, json!(1), &[Tap(50.0, 50.0)], None)]);
        let bbox = &parser.aggregator_input().annos[0].anno.bboxes[0];
        assert_eq!((bbox.width(), bbox.height()), (40.0, 20.0));

        let mut parser = self::parser(ParserConfig::new("T1").with_size_field("size"));
        parser.process(vec![message(1, 10, json!(1), &[Tap(50.0, 50.0)], None)]);
        let bbox = &parser.aggregator_input().annos[0].anno.bboxes[0];
        assert_eq!((bbox.width(), bbox.height()), (10.0, 10.0));

        let mut parser = self::parser(
            ParserConfig::new("T1")
                .with_width_field("missing")
                .with_mark_scale_factor(0.5),
        );
        parser.process(vec![message(1, 10, json!(1), &[Tap(50.0, 50.0)], None)]);
        let bbox = &parser.aggregator_input().annos[0].anno.bboxes[0];
        assert_eq!((bbox.width(), bbox.height()), (17.5, 17.5));
    }

    #[test]
    fn messages_without_task_annotations_count_as_progress_but_add_nothing() {
        let mut parser = parser(ParserConfig::new("T0"));
        let outcome = parser.process(vec![message(1, 10, json!(1), &[Tap(1.0, 1.0)], None)]);
        assert!(outcome.is_progress());
        assert_eq!(outcome.marked, 0);
        assert!(parser.aggregator_input().is_empty());
    }

    #[test]
    fn malformed_payloads_are_excluded_silently() {
        let mut parser = parser(ParserConfig::new("T1"));
        let broken = UniqueMessage::new(json!({"classification_id": 8, "data": 3})).unwrap();
        let outcome = parser.process(vec![broken]);
        assert!(!outcome.is_progress());
        assert_eq!(outcome.malformed, 1);
    }

    #[test]
    fn subject_filter_and_exclusions_shape_the_batch() {
        let config = ParserConfig::new("T1")
            .with_subject_filter(Arc::new(|metadata: &Map<String, Value>| {
                metadata.get("#training") == Some(&json!(true))
            }))
            .with_excluded_subjects(["12"]);
        let mut parser = parser(config);
        let outcome = parser.process(vec![
            message(1, 10, json!(1), &[Tap(1.0, 1.0)], None),
            message(2, 11, json!(1), &[Tap(1.0, 1.0)], None),
            message(3, 12, json!(1), &[Tap(1.0, 1.0)], None),
        ]);
        assert_eq!(outcome.filtered, vec![2]);
        assert_eq!(parser.processed_classification_count(), 2);
        let batch = parser.aggregator_input();
        assert_eq!(batch.annos.len(), 1);
        assert_eq!(batch.images.len(), 1);
        assert!(batch.images.contains_key("10"));
    }

    #[test]
    fn images_are_deduplicated_and_clear_resets_the_table() {
        let mut parser = parser(ParserConfig::new("T1"));
        parser.process(vec![
            message(1, 10, json!(1), &[Tap(1.0, 1.0)], Some((100.0, 100.0))),
            message(2, 10, json!(2), &[Tap(2.0, 2.0)], Some((100.0, 100.0))),
        ]);
        assert_eq!(parser.aggregator_input().images.len(), 1);
        assert_eq!(parser.aggregator_input().annos.len(), 2);

        parser.clear_processed_classifications();
        assert_eq!(parser.processed_classification_count(), 0);
        assert!(parser.aggregator_input().is_empty());
        assert!(!parser.process(vec![message(2, 10, json!(2), &[], None)]).is_progress());
    }

    #[test]
    fn spam_report_is_kept_for_the_reporting_task_only() {
        let heavy = [Tap(0.0, 0.0), Tap(100.0, 0.0), Tap(200.0, 0.0), Tap(300.0, 0.0)];
        let messages = |parser: &mut AnnotationParser| {
            parser.process(vec![
                message(1, 10, json!(5), &heavy, None),
                message(2, 11, json!(5), &heavy, None),
                message(3, 12, json!(6), &[Tap(1.0, 1.0)], None),
            ]);
        };
        let mut reporting = parser(ParserConfig::new("T1"));
        messages(&mut reporting);
        let report = reporting.spam_report().unwrap();
        let suspects: Vec<WorkerId> = report.suspects().map(|w| w.worker_id).collect();
        assert_eq!(suspects, vec![5]);

        let mut quiet = parser(ParserConfig::new("T1").with_spam_report_task("T0"));
        messages(&mut quiet);
        assert!(quiet.spam_report().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(AnnotationParser::new(ParserConfig::new(" ")).is_err());
    }
}
