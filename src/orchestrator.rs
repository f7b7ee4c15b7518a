//! Batch orchestration: accumulate, parse per task, submit, checkpoint.
//!
//! One cycle runs to completion before the next. A cycle fetches until the
//! buffer holds `batch_size` unique messages (or the source runs dry), parses
//! the buffer once per task, and only when every task produced eligible data
//! hands the batches to the engines. Stop requests are observed between
//! fetches and at cycle boundaries, never while engines are being updated.

use std::ffi::OsString;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, info, warn};

use crate::config::{AggregatorConfig, ShutdownPolicy};
use crate::constants::orchestrator::PENDING_CHECKPOINT_SUFFIX;
use crate::data::{AnnotationEntry, UniqueMessage};
use crate::dedup::deduplicate;
use crate::engine::{AggregationEngine, FinishedReport, SaveOptions};
use crate::errors::IngestError;
use crate::parser::AnnotationParser;
use crate::source::MessageSource;
use crate::transport::fs::write_json_atomic;
use crate::types::TaskLabel;

/// Cooperative cancellation flag shared with signal handlers.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    requested: Arc<AtomicBool>,
}

impl StopToken {
    /// Create a token with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the orchestrator to stop at the next cycle boundary.
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Result of one orchestration cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The source was exhausted and nothing was buffered.
    NoBatch,
    /// A task had no eligible classifications; no engine was updated.
    TaskWithoutData { task: TaskLabel, messages: usize },
    /// Every task engine received its batch.
    Submitted {
        cycle: u64,
        messages: usize,
        checkpointed: bool,
    },
}

impl CycleOutcome {
    /// Returns `true` when engines were updated.
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted { .. })
    }
}

/// Why [`BatchOrchestrator::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Empty cycles exceeded the retry budget.
    Exhausted,
    /// The stop token was triggered.
    Requested,
}

/// Totals reported when a run ends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunSummary {
    /// Why the run ended.
    pub reason: StopReason,
    /// Successful submissions.
    pub cycles: u64,
    /// Checkpoints written, the final save included.
    pub checkpoints: u64,
    /// Unique messages handed to the parsers in successful cycles.
    pub messages_submitted: usize,
    /// Cycles aborted because a task had no eligible data.
    pub aborted_cycles: u64,
    /// Whether engine state was saved on the way out.
    pub saved_on_exit: bool,
}

struct TaskPipeline<E> {
    parser: AnnotationParser,
    engine: E,
    retained: Vec<AnnotationEntry>,
}

/// Drives a message source through per-task parsers into aggregation engines.
pub struct BatchOrchestrator<S, E> {
    config: AggregatorConfig,
    source: S,
    tasks: Vec<TaskPipeline<E>>,
    buffer: Vec<UniqueMessage>,
    stop: StopToken,
    cycles: u64,
    checkpoints: u64,
    last_checkpoint_cycle: u64,
    messages_submitted: usize,
    aborted_cycles: u64,
}

impl<S, E> BatchOrchestrator<S, E>
where
    S: MessageSource,
    E: AggregationEngine,
{
    /// Build an orchestrator with one parser and engine per configured task.
    ///
    /// `engine_for` receives the task label and its working-file prefix.
    pub fn new<F>(config: AggregatorConfig, source: S, mut engine_for: F) -> Result<Self, IngestError>
    where
        F: FnMut(&TaskLabel, &Path) -> E,
    {
        config.validate()?;
        let mut tasks = Vec::with_capacity(config.tasks.len());
        for task_config in &config.tasks {
            let parser = AnnotationParser::new(task_config.clone())?;
            let mut engine = engine_for(&task_config.task_label, &config.task_prefix(&task_config.task_label));
            if config.purge_stale_working_files {
                engine.purge_working_files()?;
            }
            tasks.push(TaskPipeline {
                parser,
                engine,
                retained: Vec::new(),
            });
        }
        info!(
            source_id = %source.id(),
            tasks = tasks.len(),
            batch_size = config.batch_size,
            checkpoint_every = config.checkpoint_every,
            "orchestrator ready"
        );
        Ok(Self {
            config,
            source,
            tasks,
            buffer: Vec::new(),
            stop: StopToken::new(),
            cycles: 0,
            checkpoints: 0,
            last_checkpoint_cycle: 0,
            messages_submitted: 0,
            aborted_cycles: 0,
        })
    }

    /// Replace the stop token (for example with one wired to a signal handler).
    pub fn with_stop_token(mut self, stop: StopToken) -> Self {
        self.stop = stop;
        self
    }

    /// Clone of the token observed by this orchestrator.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Successful submissions so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Checkpoints written so far.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints
    }

    /// Unique messages waiting for the next submission.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Source feeding this orchestrator.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutable access to the source, e.g. to call `update` between runs.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Engine for `task`, if configured.
    pub fn engine(&self, task: &str) -> Option<&E> {
        self.pipeline(task).map(|pipeline| &pipeline.engine)
    }

    /// Parser for `task`, if configured.
    pub fn parser(&self, task: &str) -> Option<&AnnotationParser> {
        self.pipeline(task).map(|pipeline| &pipeline.parser)
    }

    /// Annotations retained for `task` since construction.
    pub fn retained_annotations(&self, task: &str) -> Option<&[AnnotationEntry]> {
        self.pipeline(task).map(|pipeline| pipeline.retained.as_slice())
    }

    fn pipeline(&self, task: &str) -> Option<&TaskPipeline<E>> {
        self.tasks
            .iter()
            .find(|pipeline| pipeline.parser.task_label() == task)
    }

    /// Fetch until the buffer is full. Returns `true` when the source ran dry.
    fn accumulate(&mut self) -> Result<bool, IngestError> {
        while self.buffer.len() < self.config.batch_size {
            if self.stop.is_stop_requested() {
                return Ok(false);
            }
            let fetched = self.source.fetch(true)?;
            if fetched.is_empty() {
                return Ok(true);
            }
            self.buffer.extend(fetched.unique);
        }
        Ok(false)
    }

    /// Run one accumulate/parse/submit cycle.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, IngestError> {
        let exhausted = self.accumulate()?;
        if self.buffer.is_empty() {
            debug!(source_id = %self.source.id(), "no messages available");
            return Ok(CycleOutcome::NoBatch);
        }
        if exhausted {
            debug!(
                buffered = self.buffer.len(),
                "source exhausted; submitting partial batch"
            );
        }

        let mut messages = mem::take(&mut self.buffer);
        if !self.source.is_prededuplicated() {
            messages = deduplicate(messages);
        }
        let count = messages.len();

        // Every parser sees the batch before any engine is touched.
        let mut failed_task = None;
        for pipeline in &mut self.tasks {
            let outcome = pipeline.parser.process(messages.iter().cloned());
            if !outcome.is_progress() {
                let task = pipeline.parser.task_label().clone();
                warn!(
                    task = %task,
                    messages = count,
                    repeated = outcome.repeated.len(),
                    filtered = outcome.filtered.len(),
                    "task has no eligible classifications; skipping submission"
                );
                failed_task = Some(task);
                break;
            }
        }
        if let Some(task) = failed_task {
            // Rows already parsed for other tasks belong to the dropped batch.
            for pipeline in &mut self.tasks {
                pipeline.parser.clear_processed_classifications();
            }
            self.aborted_cycles += 1;
            return Ok(CycleOutcome::TaskWithoutData {
                task,
                messages: count,
            });
        }

        for pipeline in &mut self.tasks {
            let batch = pipeline.parser.aggregator_input();
            if self.config.save_input_annotations {
                pipeline.retained.extend(batch.annos.iter().cloned());
            }
            pipeline.engine.load(batch, false)?;
            pipeline.engine.estimate_parameters(&self.config.estimation)?;
            pipeline.parser.clear_processed_classifications();
        }
        self.cycles += 1;
        self.messages_submitted += count;
        info!(cycle = self.cycles, messages = count, "submitted batch");
        self.report_finished();

        let checkpointed = self.config.checkpoint_every > 0
            && self.cycles % self.config.checkpoint_every == 0;
        if checkpointed {
            self.checkpoint()?;
        }
        Ok(CycleOutcome::Submitted {
            cycle: self.cycles,
            messages: count,
            checkpointed,
        })
    }

    fn report_finished(&mut self) {
        for pipeline in &mut self.tasks {
            let status = pipeline.engine.check_finished_annotations(true);
            let report = FinishedReport::from_status(&status);
            info!(
                task = %pipeline.parser.task_label(),
                finished = report.finished,
                total = report.total,
                "{} / {} ({:.2}%) images are finished",
                report.finished,
                report.total,
                report.percent()
            );
        }
    }

    /// Persist every task engine (and retained annotations when enabled).
    ///
    /// Artifacts are written under pending names and only renamed into place
    /// once every task has been saved, so a failed save leaves the previous
    /// checkpoint set untouched.
    pub fn checkpoint(&mut self) -> Result<(), IngestError> {
        let mut staged = Vec::new();
        if let Err(err) = self.stage_checkpoint(&mut staged) {
            for (pending, _) in &staged {
                let _ = fs::remove_file(pending);
            }
            warn!(error = %err, "checkpoint abandoned; previous artifacts kept");
            return Err(err);
        }
        for (pending, path) in &staged {
            fs::rename(pending, path)?;
            debug!(path = %path.display(), "checkpoint artifact written");
        }
        self.checkpoints += 1;
        self.last_checkpoint_cycle = self.cycles;
        info!(cycle = self.cycles, checkpoints = self.checkpoints, "checkpoint complete");
        Ok(())
    }

    fn stage_checkpoint(&mut self, staged: &mut Vec<(PathBuf, PathBuf)>) -> Result<(), IngestError> {
        let options = SaveOptions::full();
        for pipeline in &mut self.tasks {
            let task = pipeline.parser.task_label().clone();
            pipeline.engine.purge_working_files()?;
            let path = self.config.aggregated_path(&task);
            let pending = pending_path(&path);
            staged.push((pending.clone(), path));
            pipeline.engine.save(&pending, &options)?;
            if self.config.save_input_annotations {
                let path = self.config.input_annotations_path(&task);
                let pending = pending_path(&path);
                staged.push((pending.clone(), path));
                write_json_atomic(&pending, &pipeline.retained)?;
            }
        }
        Ok(())
    }

    /// Loop until the stop token fires or the source stays exhausted.
    ///
    /// Without `stop_on_exhaustion` empty cycles are retried forever.
    pub fn run(&mut self) -> Result<RunSummary, IngestError> {
        let mut empty_cycles = 0usize;
        loop {
            if self.stop.is_stop_requested() {
                info!(cycle = self.cycles, "stop requested");
                return self.finish(StopReason::Requested);
            }
            match self.run_cycle()? {
                CycleOutcome::Submitted { .. } => {
                    empty_cycles = 0;
                    continue;
                }
                CycleOutcome::NoBatch | CycleOutcome::TaskWithoutData { .. } => {}
            }
            if self.stop.is_stop_requested() {
                continue;
            }
            if self.config.stop_on_exhaustion {
                empty_cycles += 1;
                self.report_finished();
                if empty_cycles > self.config.exhaustion_retries {
                    info!(
                        empty_cycles,
                        cycles = self.cycles,
                        "no messages received; stopping"
                    );
                    return self.finish(StopReason::Exhausted);
                }
            }
            let appended = self.source.update()?;
            if appended == 0 {
                debug!(empty_cycles, "no messages received; waiting");
            }
            if !self.config.idle_delay.is_zero() {
                thread::sleep(self.config.idle_delay);
            }
        }
    }

    fn finish(&mut self, reason: StopReason) -> Result<RunSummary, IngestError> {
        let pending = self.cycles > self.last_checkpoint_cycle;
        let saved_on_exit = match self.config.shutdown_policy {
            ShutdownPolicy::Save if pending => {
                self.checkpoint()?;
                true
            }
            ShutdownPolicy::Save => false,
            ShutdownPolicy::Discard => {
                if pending {
                    warn!(
                        cycles_since_checkpoint = self.cycles - self.last_checkpoint_cycle,
                        "discarding engine state on exit"
                    );
                }
                false
            }
        };
        Ok(RunSummary {
            reason,
            cycles: self.cycles,
            checkpoints: self.checkpoints,
            messages_submitted: self.messages_submitted,
            aborted_cycles: self.aborted_cycles,
            saved_on_exit,
        })
    }
}

fn pending_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(PENDING_CHECKPOINT_SUFFIX);
    PathBuf::from(name)
}
