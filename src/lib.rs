#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Reusable CLI runners shared by the demo binaries.
pub mod apps;
/// Parser, source, and orchestrator configuration types.
pub mod config;
/// Centralized constants used across sources, parsers, and the orchestrator.
pub mod constants;
/// Raw message, classification, and normalized batch types.
pub mod data;
/// Identity-based message deduplication.
pub mod dedup;
/// Aggregation engine trait and the archiving engine.
pub mod engine;
/// Fetch, parse, submit, and checkpoint cycle driver.
pub mod orchestrator;
/// Per-task annotation parsing and tap geometry.
pub mod parser;
/// Message source traits and built-in sources.
pub mod source;
/// Input transports used by sources (filesystem today).
pub mod transport;
/// Shared type aliases.
pub mod types;

mod errors;

pub use config::{
    AggregatorConfig, EstimationConfig, LiveQueueConfig, ParserConfig, ReplayConfig,
    ShutdownPolicy, SubjectFilter,
};
pub use data::{
    AnnotationBoxes, AnnotationEntry, BoundingBox, Classification, ImageDimensions, ImageInfo,
    Mark, NormalizedBatch, RawMessage, UniqueMessage,
};
pub use dedup::{Deduplicator, deduplicate};
pub use engine::{AggregationEngine, ArchiveEngine, FinishedReport, SaveOptions};
pub use errors::IngestError;
pub use orchestrator::{BatchOrchestrator, CycleOutcome, RunSummary, StopReason, StopToken};
pub use parser::{AnnotationParser, ProcessOutcome, SpamReport};
pub use source::{
    FetchBatch, LiveQueueSource, MemoryQueue, MessageSource, QueueTransport, ReplaySource,
};
pub use types::{
    BodyChecksum, ClassificationId, ReceiptHandle, SourceId, SubjectId, TaskLabel, ToolLabel,
    WorkerId,
};
