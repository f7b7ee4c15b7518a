use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::constants::orchestrator::{
    DEFAULT_BATCH_SIZE, DEFAULT_CHECKPOINT_EVERY, DEFAULT_EXHAUSTION_RETRIES, DEFAULT_MAX_ITERS,
    DEFAULT_MAX_RISK, DEFAULT_SAVE_DIR, DEFAULT_SAVE_PREFIX,
};
use crate::constants::parser::SPAM_REPORT_TASK;
use crate::constants::queue::{LONG_POLL_WAIT, MAX_MESSAGES_PER_RECEIVE, VISIBILITY_TIMEOUT};
use crate::constants::replay::{
    DEFAULT_MAX_FETCH, DEFAULT_MIN_FETCH, DEFAULT_SEED, DEFAULT_TRAINING_KEY,
};
use crate::errors::IngestError;
use crate::types::{SubjectId, TaskLabel};

/// Predicate over subject metadata; `false` excludes the message.
pub type SubjectFilter = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync + 'static>;

/// Per-task annotation parser configuration.
#[derive(Clone)]
pub struct ParserConfig {
    /// Task label whose annotations this parser extracts.
    pub task_label: TaskLabel,
    /// Fixed box width; wins over metadata lookup when set.
    pub mark_width: Option<f64>,
    /// Fixed box height; wins over metadata lookup when set.
    pub mark_height: Option<f64>,
    /// Factor applied to every resolved box dimension, including defaults.
    pub mark_scale_factor: f64,
    /// Subject metadata field holding the box width.
    pub width_field: Option<String>,
    /// Subject metadata field holding the box height.
    pub height_field: Option<String>,
    /// Subjects left out of assembled batches.
    pub excluded_subjects: HashSet<SubjectId>,
    /// Subject metadata predicate applied during extraction.
    pub subject_filter: SubjectFilter,
    /// Task label for which the spam heuristic is logged.
    pub spam_report_task: TaskLabel,
}

impl ParserConfig {
    /// Create a config for `task_label` with default box sizing.
    pub fn new(task_label: impl Into<TaskLabel>) -> Self {
        Self {
            task_label: task_label.into(),
            mark_width: None,
            mark_height: None,
            mark_scale_factor: 1.0,
            width_field: None,
            height_field: None,
            excluded_subjects: HashSet::new(),
            subject_filter: Arc::new(|_| true),
            spam_report_task: SPAM_REPORT_TASK.to_string(),
        }
    }

    /// Use fixed box dimensions for every tap.
    pub fn with_fixed_mark_size(mut self, width: f64, height: f64) -> Self {
        self.mark_width = Some(width);
        self.mark_height = Some(height);
        self
    }

    /// Read both box dimensions from one subject metadata field.
    ///
    /// Explicit width/height fields set later take precedence.
    pub fn with_size_field(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.width_field = Some(field.clone());
        self.height_field = Some(field);
        self
    }

    /// Read box width from a subject metadata field.
    pub fn with_width_field(mut self, field: impl Into<String>) -> Self {
        self.width_field = Some(field.into());
        self
    }

    /// Read box height from a subject metadata field.
    pub fn with_height_field(mut self, field: impl Into<String>) -> Self {
        self.height_field = Some(field.into());
        self
    }

    /// Scale every resolved box dimension.
    pub fn with_mark_scale_factor(mut self, factor: f64) -> Self {
        self.mark_scale_factor = factor;
        self
    }

    /// Exclude subjects from assembled batches.
    pub fn with_excluded_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubjectId>,
    {
        self.excluded_subjects
            .extend(subjects.into_iter().map(Into::into));
        self
    }

    /// Set the subject metadata predicate.
    pub fn with_subject_filter(mut self, filter: SubjectFilter) -> Self {
        self.subject_filter = filter;
        self
    }

    /// Set the task label for which the spam heuristic is logged.
    pub fn with_spam_report_task(mut self, task: impl Into<TaskLabel>) -> Self {
        self.spam_report_task = task.into();
        self
    }

    /// Reject empty labels and non-positive sizes.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.task_label.trim().is_empty() {
            return Err(IngestError::Configuration(
                "task label must not be empty".to_string(),
            ));
        }
        if !(self.mark_scale_factor.is_finite() && self.mark_scale_factor > 0.0) {
            return Err(IngestError::Configuration(format!(
                "task '{}': mark scale factor must be positive, got {}",
                self.task_label, self.mark_scale_factor
            )));
        }
        for (name, value) in [("width", self.mark_width), ("height", self.mark_height)] {
            if let Some(value) = value
                && !(value.is_finite() && value > 0.0)
            {
                return Err(IngestError::Configuration(format!(
                    "task '{}': fixed mark {name} must be positive, got {value}",
                    self.task_label
                )));
            }
        }
        Ok(())
    }
}

/// Live queue polling configuration.
#[derive(Clone, Debug)]
pub struct LiveQueueConfig {
    /// Queue address passed to the transport.
    pub queue_url: String,
    /// Messages requested per receive call.
    pub max_messages: usize,
    /// Long-poll wait per receive call.
    pub wait_time: Duration,
    /// Redelivery delay for unacknowledged messages.
    pub visibility_timeout: Duration,
}

impl LiveQueueConfig {
    /// Create a config for `queue_url` with the standard polling parameters.
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            max_messages: MAX_MESSAGES_PER_RECEIVE,
            wait_time: LONG_POLL_WAIT,
            visibility_timeout: VISIBILITY_TIMEOUT,
        }
    }

    /// Override the long-poll wait.
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Override the visibility timeout.
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Override the page size.
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.queue_url.trim().is_empty() {
            return Err(IngestError::Configuration(
                "queue url must not be empty".to_string(),
            ));
        }
        if self.max_messages == 0 || self.max_messages > MAX_MESSAGES_PER_RECEIVE {
            return Err(IngestError::Configuration(format!(
                "max messages per receive must be within 1..={MAX_MESSAGES_PER_RECEIVE}, got {}",
                self.max_messages
            )));
        }
        Ok(())
    }
}

/// Subject-keyed lookup table used to enrich replayed messages.
#[derive(Clone, Debug)]
pub struct SizeLookupConfig {
    /// JSON object file mapping subject id to a number.
    pub path: PathBuf,
    /// Subject metadata field filled from the table when absent.
    pub field: String,
}

/// Offline replay source configuration.
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// Dump files, one per named source.
    pub paths: Vec<PathBuf>,
    /// Smallest slice returned per fetch.
    pub min_fetch: usize,
    /// Largest slice returned per fetch (inclusive).
    pub max_fetch: usize,
    /// Seed for slice sizes.
    pub seed: u64,
    /// Drop messages whose worker is anonymous.
    pub skip_anonymous: bool,
    /// Keep only messages whose subject is flagged as training.
    pub training_only: bool,
    /// Subject metadata key of the training flag.
    pub training_key: String,
    /// Optional metadata enrichment table.
    pub size_lookup: Option<SizeLookupConfig>,
}

impl ReplayConfig {
    /// Create a replay config over `paths` with default slicing.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            min_fetch: DEFAULT_MIN_FETCH,
            max_fetch: DEFAULT_MAX_FETCH,
            seed: DEFAULT_SEED,
            skip_anonymous: false,
            training_only: false,
            training_key: DEFAULT_TRAINING_KEY.to_string(),
            size_lookup: None,
        }
    }

    /// Set the inclusive slice size range.
    pub fn with_fetch_range(mut self, min_fetch: usize, max_fetch: usize) -> Self {
        self.min_fetch = min_fetch;
        self.max_fetch = max_fetch;
        self
    }

    /// Use the same slice size on every fetch.
    pub fn with_fixed_fetch(self, size: usize) -> Self {
        self.with_fetch_range(size, size)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_skip_anonymous(mut self, skip_anonymous: bool) -> Self {
        self.skip_anonymous = skip_anonymous;
        self
    }

    pub fn with_training_only(mut self, training_only: bool) -> Self {
        self.training_only = training_only;
        self
    }

    pub fn with_training_key(mut self, key: impl Into<String>) -> Self {
        self.training_key = key.into();
        self
    }

    /// Enrich messages lacking `field` from the table at `path`.
    pub fn with_size_lookup(mut self, path: impl Into<PathBuf>, field: impl Into<String>) -> Self {
        self.size_lookup = Some(SizeLookupConfig {
            path: path.into(),
            field: field.into(),
        });
        self
    }

    /// Check the slice size range.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.min_fetch == 0 || self.min_fetch > self.max_fetch {
            return Err(IngestError::Configuration(format!(
                "replay fetch range must satisfy 0 < min <= max, got {}..={}",
                self.min_fetch, self.max_fetch
            )));
        }
        Ok(())
    }
}

/// Parameters forwarded to engine estimation.
#[derive(Clone, Copy, Debug)]
pub struct EstimationConfig {
    /// Upper bound on estimation iterations.
    pub max_iters: usize,
    /// Refine consensus boxes after estimation.
    pub refine: bool,
    /// Skip images already marked finished.
    pub avoid_if_finished: bool,
    /// Risk threshold under which engines may consider an image finished.
    pub max_risk: f64,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            max_iters: DEFAULT_MAX_ITERS,
            refine: true,
            avoid_if_finished: true,
            max_risk: DEFAULT_MAX_RISK,
        }
    }
}

/// What happens to engine state when a stop is requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Persist every task before returning.
    Save,
    /// Return without persisting.
    Discard,
}

/// Top-level orchestrator configuration.
#[derive(Clone)]
pub struct AggregatorConfig {
    /// One parser (and engine) per task.
    pub tasks: Vec<ParserConfig>,
    /// Unique messages accumulated before submission.
    pub batch_size: usize,
    /// Persist engines every N successful cycles (0 disables).
    pub checkpoint_every: u64,
    /// Stop after `exhaustion_retries` empty cycles instead of waiting forever.
    pub stop_on_exhaustion: bool,
    /// Empty cycles tolerated before stopping.
    pub exhaustion_retries: usize,
    /// Sleep between empty cycles.
    pub idle_delay: Duration,
    /// Directory for checkpoint artifacts.
    pub save_dir: PathBuf,
    /// Filename prefix for checkpoint artifacts.
    pub save_prefix: String,
    /// Retain submitted annotations and dump them at checkpoint time.
    pub save_input_annotations: bool,
    /// Remove stale engine working files at construction.
    pub purge_stale_working_files: bool,
    /// Engine estimation parameters.
    pub estimation: EstimationConfig,
    /// Persistence behavior on stop.
    pub shutdown_policy: ShutdownPolicy,
}

impl AggregatorConfig {
    /// Create a config for the given tasks with default cadence and paths.
    pub fn new<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = ParserConfig>,
    {
        Self {
            tasks: tasks.into_iter().collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            stop_on_exhaustion: false,
            exhaustion_retries: DEFAULT_EXHAUSTION_RETRIES,
            idle_delay: Duration::ZERO,
            save_dir: PathBuf::from(DEFAULT_SAVE_DIR),
            save_prefix: DEFAULT_SAVE_PREFIX.to_string(),
            save_input_annotations: false,
            purge_stale_working_files: false,
            estimation: EstimationConfig::default(),
            shutdown_policy: ShutdownPolicy::Save,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_checkpoint_every(mut self, checkpoint_every: u64) -> Self {
        self.checkpoint_every = checkpoint_every;
        self
    }

    /// Stop after `retries` consecutive empty cycles.
    pub fn with_stop_on_exhaustion(mut self, retries: usize) -> Self {
        self.stop_on_exhaustion = true;
        self.exhaustion_retries = retries;
        self
    }

    pub fn with_idle_delay(mut self, idle_delay: Duration) -> Self {
        self.idle_delay = idle_delay;
        self
    }

    pub fn with_save_location(mut self, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.save_dir = dir.into();
        self.save_prefix = prefix.into();
        self
    }

    pub fn with_save_input_annotations(mut self, enabled: bool) -> Self {
        self.save_input_annotations = enabled;
        self
    }

    pub fn with_purge_stale_working_files(mut self, enabled: bool) -> Self {
        self.purge_stale_working_files = enabled;
        self
    }

    pub fn with_estimation(mut self, estimation: EstimationConfig) -> Self {
        self.estimation = estimation;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = policy;
        self
    }

    /// Path of the aggregated-results artifact for `task`.
    pub fn aggregated_path(&self, task: &str) -> PathBuf {
        self.artifact_path(task, crate::constants::orchestrator::AGGREGATED_SUFFIX)
    }

    /// Path of the retained input-annotation artifact for `task`.
    pub fn input_annotations_path(&self, task: &str) -> PathBuf {
        self.artifact_path(task, crate::constants::orchestrator::INPUT_ANNOTATIONS_SUFFIX)
    }

    /// Engine working-file prefix for `task`.
    pub fn task_prefix(&self, task: &str) -> PathBuf {
        self.save_dir.join(format!("{}_{task}", self.save_prefix))
    }

    fn artifact_path(&self, task: &str, suffix: &str) -> PathBuf {
        self.save_dir
            .join(format!("{}_{task}_{suffix}", self.save_prefix))
    }

    /// Reject configurations the orchestrator cannot run.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.tasks.is_empty() {
            return Err(IngestError::Configuration(
                "at least one task label is required".to_string(),
            ));
        }
        let mut labels = HashSet::new();
        for task in &self.tasks {
            task.validate()?;
            if !labels.insert(task.task_label.as_str()) {
                return Err(IngestError::Configuration(format!(
                    "task label '{}' is configured more than once",
                    task.task_label
                )));
            }
        }
        if self.batch_size == 0 {
            return Err(IngestError::Configuration(
                "batch size must be positive".to_string(),
            ));
        }
        if self.estimation.max_iters == 0 {
            return Err(IngestError::Configuration(
                "estimation max_iters must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a JSON configuration document.
    ///
    /// Unrecognized keys are logged and ignored.
    pub fn from_json_str(text: &str) -> Result<Self, IngestError> {
        let file: AggregatorFileConfig = serde_json::from_str(text)?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }
}

/// File representation of [`AggregatorConfig`].
#[derive(Debug, Deserialize)]
struct AggregatorFileConfig {
    tasks: Vec<TaskFileConfig>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    checkpoint_every: Option<u64>,
    #[serde(default)]
    stop_on_exhaustion: Option<bool>,
    #[serde(default)]
    exhaustion_retries: Option<usize>,
    #[serde(default)]
    idle_delay_ms: Option<u64>,
    #[serde(default)]
    save_dir: Option<PathBuf>,
    #[serde(default)]
    save_prefix: Option<String>,
    #[serde(default)]
    save_input_annotations: Option<bool>,
    #[serde(default)]
    purge_stale_working_files: Option<bool>,
    #[serde(default)]
    max_iters: Option<usize>,
    #[serde(default)]
    refine: Option<bool>,
    #[serde(default)]
    avoid_if_finished: Option<bool>,
    #[serde(default)]
    max_risk: Option<f64>,
    #[serde(default)]
    save_on_shutdown: Option<bool>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct TaskFileConfig {
    task_label: TaskLabel,
    #[serde(default)]
    mark_width: Option<f64>,
    #[serde(default)]
    mark_height: Option<f64>,
    #[serde(default)]
    mark_scale_factor: Option<f64>,
    #[serde(default)]
    size_field: Option<String>,
    #[serde(default)]
    width_field: Option<String>,
    #[serde(default)]
    height_field: Option<String>,
    #[serde(default)]
    excluded_subjects: Vec<Value>,
    #[serde(default)]
    spam_report_task: Option<TaskLabel>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

impl AggregatorFileConfig {
    fn into_config(self) -> AggregatorConfig {
        warn_unknown_keys("aggregator", &self.unknown);
        let tasks = self
            .tasks
            .into_iter()
            .map(TaskFileConfig::into_config)
            .collect::<Vec<_>>();
        let mut config = AggregatorConfig::new(tasks);
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(checkpoint_every) = self.checkpoint_every {
            config.checkpoint_every = checkpoint_every;
        }
        if let Some(stop) = self.stop_on_exhaustion {
            config.stop_on_exhaustion = stop;
        }
        if let Some(retries) = self.exhaustion_retries {
            config.exhaustion_retries = retries;
        }
        if let Some(delay) = self.idle_delay_ms {
            config.idle_delay = Duration::from_millis(delay);
        }
        if let Some(dir) = self.save_dir {
            config.save_dir = dir;
        }
        if let Some(prefix) = self.save_prefix {
            config.save_prefix = prefix;
        }
        if let Some(enabled) = self.save_input_annotations {
            config.save_input_annotations = enabled;
        }
        if let Some(enabled) = self.purge_stale_working_files {
            config.purge_stale_working_files = enabled;
        }
        if let Some(max_iters) = self.max_iters {
            config.estimation.max_iters = max_iters;
        }
        if let Some(refine) = self.refine {
            config.estimation.refine = refine;
        }
        if let Some(avoid) = self.avoid_if_finished {
            config.estimation.avoid_if_finished = avoid;
        }
        if let Some(max_risk) = self.max_risk {
            config.estimation.max_risk = max_risk;
        }
        if let Some(save) = self.save_on_shutdown {
            config.shutdown_policy = if save {
                ShutdownPolicy::Save
            } else {
                ShutdownPolicy::Discard
            };
        }
        config
    }
}

impl TaskFileConfig {
    fn into_config(self) -> ParserConfig {
        warn_unknown_keys(&format!("task '{}'", self.task_label), &self.unknown);
        let mut config = ParserConfig::new(self.task_label);
        if let Some(field) = self.size_field {
            config = config.with_size_field(field);
        }
        if let Some(field) = self.width_field {
            config = config.with_width_field(field);
        }
        if let Some(field) = self.height_field {
            config = config.with_height_field(field);
        }
        config.mark_width = self.mark_width;
        config.mark_height = self.mark_height;
        if let Some(factor) = self.mark_scale_factor {
            config.mark_scale_factor = factor;
        }
        let excluded = self.excluded_subjects.iter().filter_map(|value| match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        });
        config = config.with_excluded_subjects(excluded);
        if let Some(task) = self.spam_report_task {
            config.spam_report_task = task;
        }
        config
    }
}

fn warn_unknown_keys(scope: &str, unknown: &BTreeMap<String, Value>) {
    if !unknown.is_empty() {
        let keys: Vec<&str> = unknown.keys().map(String::as_str).collect();
        warn!(scope, ?keys, "ignoring unrecognized configuration keys");
    }
}
