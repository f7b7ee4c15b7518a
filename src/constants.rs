/// Constants used by the live queue client.
pub mod queue {
    use std::time::Duration;

    /// Maximum number of messages requested per receive call.
    pub const MAX_MESSAGES_PER_RECEIVE: usize = 10;
    /// Long-poll wait applied to each receive call.
    pub const LONG_POLL_WAIT: Duration = Duration::from_secs(20);
    /// Time a received but unacknowledged message stays hidden from other receivers.
    pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(40);
    /// Source id prefix used for live queue sources.
    pub const LIVE_SOURCE_PREFIX: &str = "queue::";
}

/// Constants used by the annotation parser.
pub mod parser {
    /// Box width used when neither a fixed width nor a metadata field resolves.
    pub const DEFAULT_MARK_WIDTH: f64 = 35.0;
    /// Box height used when neither a fixed height nor a metadata field resolves.
    pub const DEFAULT_MARK_HEIGHT: f64 = 35.0;
    /// Subject pixel dimensions used before any subject has declared its size.
    pub const PLACEHOLDER_IMAGE_WIDTH: f64 = 400.0;
    /// Subject pixel dimensions used before any subject has declared its size.
    pub const PLACEHOLDER_IMAGE_HEIGHT: f64 = 400.0;
    /// Worker id assigned to anonymous or unparseable workers.
    pub const ANONYMOUS_WORKER_ID: i64 = -99;
    /// Taps closer than `factor * (width + height)` to the reference tap are duplicates.
    pub const DUPLICATE_TAP_FACTOR: f64 = 0.75;
    /// Task label for which the spam heuristic is reported by default.
    pub const SPAM_REPORT_TASK: &str = "T1";
    /// Share of held classifications above which a worker is considered dominant.
    pub const SPAM_CLASSIFICATION_SHARE: f64 = 0.15;
    /// Mean raw tap count above which a dominant worker is flagged.
    pub const SPAM_MEAN_TAPS: f64 = 3.0;
    /// Metadata key holding declared subject dimensions.
    pub const SUBJECT_DIMENSIONS_KEY: &str = "subject_dimensions";
    /// Dimension-block key for the natural image width.
    pub const NATURAL_WIDTH_KEY: &str = "naturalWidth";
    /// Dimension-block key for the natural image height.
    pub const NATURAL_HEIGHT_KEY: &str = "naturalHeight";
}

/// Constants used by the offline replay source.
pub mod replay {
    /// Smallest slice returned by one replay fetch.
    pub const DEFAULT_MIN_FETCH: usize = 40;
    /// Largest slice returned by one replay fetch.
    pub const DEFAULT_MAX_FETCH: usize = 60;
    /// Seed for the replay slice-size RNG.
    pub const DEFAULT_SEED: u64 = 0x5EED_B0C5;
    /// Subject metadata key flagging training (ground-truth) subjects.
    pub const DEFAULT_TRAINING_KEY: &str = "#training";
    /// Source id used by replay sources.
    pub const REPLAY_SOURCE_ID: &str = "replay";
}

/// Constants used by the batch orchestrator.
pub mod orchestrator {
    /// Number of unique messages accumulated before a submission.
    pub const DEFAULT_BATCH_SIZE: usize = 200;
    /// Persist engine state every N successful cycles.
    pub const DEFAULT_CHECKPOINT_EVERY: u64 = 10;
    /// Number of consecutive empty cycles tolerated before stopping.
    pub const DEFAULT_EXHAUSTION_RETRIES: usize = 3;
    /// Iteration cap passed to engine parameter estimation.
    pub const DEFAULT_MAX_ITERS: usize = 10;
    /// Minimum risk passed to engines that accept one.
    pub const DEFAULT_MAX_RISK: f64 = 0.5;
    /// Default directory for checkpoint artifacts.
    pub const DEFAULT_SAVE_DIR: &str = ".";
    /// Default filename prefix for checkpoint artifacts.
    pub const DEFAULT_SAVE_PREFIX: &str = "aggregator_output";
    /// Suffix of the per-task aggregated results file.
    pub const AGGREGATED_SUFFIX: &str = "aggregated.json";
    /// Suffix of the per-task retained input annotations file.
    pub const INPUT_ANNOTATIONS_SUFFIX: &str = "input_annotations.json";
    /// Appended to checkpoint artifacts until every task has been written.
    pub const PENDING_CHECKPOINT_SUFFIX: &str = ".pending";
}

/// Constants used by the archive engine.
pub mod engine {
    /// Suffix of the intermediate working file written between checkpoints.
    pub const WORKING_FILE_SUFFIX: &str = "working_set.json";
    /// Annotation count at which the archive engine reports an image as finished.
    pub const DEFAULT_FINISHED_ANNOTATIONS: usize = 5;
}
