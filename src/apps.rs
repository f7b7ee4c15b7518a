use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{Parser, error::ErrorKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{AggregatorConfig, LiveQueueConfig, ParserConfig, ReplayConfig, ShutdownPolicy};
use crate::constants::orchestrator::DEFAULT_EXHAUSTION_RETRIES;
use crate::engine::ArchiveEngine;
use crate::orchestrator::{BatchOrchestrator, RunSummary, StopToken};
use crate::source::{LiveQueueSource, MemoryQueue, MessageSource, ReplaySource};
use crate::transport::fs::read_message_dump;

type DynSource = Box<dyn MessageSource + 'static>;

const DEMO_QUEUE_URL: &str = "memory://aggregation-input";

#[derive(Debug, Parser)]
#[command(
    name = "replay_aggregator",
    disable_help_subcommand = true,
    about = "Replay recorded classification messages through the aggregation pipeline",
    long_about = "Feed recorded classification messages through deduplication, per-task parsing, and an archiving aggregation engine, checkpointing results to disk.",
    after_help = "Press Ctrl+C once to stop after the current cycle; press it again to abort immediately."
)]
/// CLI for `replay_aggregator`.
///
/// Common usage:
/// - Replay dumps in random slices: `--dump a.jsonl --dump b.json`
/// - Push a dump through the in-memory queue instead: `--queue-input a.jsonl`
/// - Load cadence and task settings from JSON: `--config aggregator.json`
struct ReplayAggregatorCli {
    #[arg(long = "dump", value_name = "PATH", help = "Message dump to replay, repeat as needed")]
    dumps: Vec<PathBuf>,
    #[arg(
        long = "queue-input",
        value_name = "PATH",
        conflicts_with = "dumps",
        help = "Post this dump to an in-memory queue and consume it as a live source"
    )]
    queue_input: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Aggregator configuration file (JSON)")]
    config: Option<PathBuf>,
    #[arg(
        long = "task",
        value_name = "LABEL",
        help = "Task label to aggregate, repeat as needed (ignored with --config)"
    )]
    tasks: Vec<String>,
    #[arg(
        long = "size-field",
        value_name = "FIELD",
        help = "Subject metadata field holding the mark size (ignored with --config)"
    )]
    size_field: Option<String>,
    #[arg(
        long = "batch-size",
        value_parser = parse_positive_usize,
        help = "Unique messages per submission"
    )]
    batch_size: Option<usize>,
    #[arg(long = "checkpoint-every", help = "Checkpoint every N successful cycles")]
    checkpoint_every: Option<u64>,
    #[arg(long = "save-dir", value_name = "DIR", help = "Directory for checkpoint artifacts")]
    save_dir: Option<PathBuf>,
    #[arg(long = "save-prefix", help = "Filename prefix for checkpoint artifacts")]
    save_prefix: Option<String>,
    #[arg(
        long = "save-input-annotations",
        help = "Also dump the annotations handed to each engine"
    )]
    save_input_annotations: bool,
    #[arg(long = "discard-on-exit", help = "Do not save engine state when stopping")]
    discard_on_exit: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_EXHAUSTION_RETRIES,
        help = "Empty cycles tolerated before stopping"
    )]
    retries: usize,
    #[arg(long = "min-fetch", default_value_t = 40, value_parser = parse_positive_usize)]
    min_fetch: usize,
    #[arg(long = "max-fetch", default_value_t = 60, value_parser = parse_positive_usize)]
    max_fetch: usize,
    #[arg(long, help = "Seed for replay slice sizes")]
    seed: Option<u64>,
    #[arg(long = "skip-anonymous", help = "Drop messages from anonymous workers")]
    skip_anonymous: bool,
    #[arg(long = "training-only", help = "Keep only training subjects")]
    training_only: bool,
    #[arg(
        long = "size-lookup",
        value_name = "PATH",
        requires = "size_field",
        help = "JSON object of subject id to size used to fill --size-field"
    )]
    size_lookup: Option<PathBuf>,
}

/// Run the `replay_aggregator` demo with the provided CLI args.
pub fn run_replay_aggregator<I>(args_iter: I) -> Result<(), Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    init_logging();
    let Some(cli) = parse_cli::<ReplayAggregatorCli, _>(
        std::iter::once("replay_aggregator".to_string()).chain(args_iter),
    )?
    else {
        return Ok(());
    };

    let config = aggregator_config(&cli)?;
    let source = build_source(&cli)?;
    let stop = StopToken::new();
    install_ctrl_c_handler(stop.clone())?;

    let mut orchestrator =
        BatchOrchestrator::new(config, source, |task, prefix| ArchiveEngine::new(task.clone(), prefix))?
            .with_stop_token(stop);
    let summary = orchestrator.run()?;
    print_summary(&summary);
    Ok(())
}

fn aggregator_config(cli: &ReplayAggregatorCli) -> Result<AggregatorConfig, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => AggregatorConfig::from_json_file(path)?,
        None => {
            let labels = if cli.tasks.is_empty() {
                vec!["T1".to_string()]
            } else {
                cli.tasks.clone()
            };
            AggregatorConfig::new(labels.into_iter().map(|label| {
                let parser = ParserConfig::new(label);
                match &cli.size_field {
                    Some(field) => parser.with_size_field(field.clone()),
                    None => parser,
                }
            }))
        }
    };
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(checkpoint_every) = cli.checkpoint_every {
        config.checkpoint_every = checkpoint_every;
    }
    if let Some(dir) = &cli.save_dir {
        config.save_dir = dir.clone();
    }
    if let Some(prefix) = &cli.save_prefix {
        config.save_prefix = prefix.clone();
    }
    if cli.save_input_annotations {
        config.save_input_annotations = true;
    }
    if cli.discard_on_exit {
        config.shutdown_policy = ShutdownPolicy::Discard;
    }
    config = config.with_stop_on_exhaustion(cli.retries);
    config.validate()?;
    Ok(config)
}

fn build_source(cli: &ReplayAggregatorCli) -> Result<DynSource, Box<dyn Error>> {
    if let Some(path) = &cli.queue_input {
        return Ok(Box::new(queue_source(path)?));
    }
    if cli.dumps.is_empty() {
        return Err("provide at least one --dump or a --queue-input file".into());
    }
    let mut replay = ReplayConfig::new(cli.dumps.iter().cloned())
        .with_fetch_range(cli.min_fetch, cli.max_fetch)
        .with_skip_anonymous(cli.skip_anonymous)
        .with_training_only(cli.training_only);
    if let Some(seed) = cli.seed {
        replay = replay.with_seed(seed);
    }
    if let (Some(path), Some(field)) = (&cli.size_lookup, &cli.size_field) {
        replay = replay.with_size_lookup(path, field.clone());
    }
    let source = ReplaySource::new(replay)?;
    info!(records = source.len(), "replay source ready");
    Ok(Box::new(source))
}

fn queue_source(path: &Path) -> Result<LiveQueueSource<MemoryQueue>, Box<dyn Error>> {
    let messages = read_message_dump(path)?;
    let config = LiveQueueConfig::new(DEMO_QUEUE_URL)
        .with_wait_time(Duration::from_millis(200))
        .with_visibility_timeout(Duration::from_secs(5));
    let source = LiveQueueSource::new(config, MemoryQueue::new())?;
    let posted = source.put_messages(&messages, true)?;
    info!(posted, path = %path.display(), "in-memory queue primed");
    Ok(source)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be installed by an embedding application.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Ctrl+C handler with two-phase shutdown.
///
/// The first Ctrl+C requests a stop at the next cycle boundary. The second
/// exits the process immediately.
fn install_ctrl_c_handler(stop: StopToken) -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "failed to install ctrl_c handler");
                    return;
                }
                eprintln!("\nReceived Ctrl+C, stopping after the current cycle...");
                stop.request_stop();

                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nReceived second Ctrl+C, aborting immediately.");
                    std::process::exit(1);
                }
            });
        })?;
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("=== aggregation run ===");
    println!("stop reason        : {:?}", summary.reason);
    println!("cycles submitted   : {}", summary.cycles);
    println!("messages submitted : {}", summary.messages_submitted);
    println!("aborted cycles     : {}", summary.aborted_cycles);
    println!("checkpoints        : {}", summary.checkpoints);
    println!("saved on exit      : {}", summary.saved_on_exit);
}

fn parse_positive_usize(raw: &str) -> Result<usize, String> {
    let parsed = raw
        .parse::<usize>()
        .map_err(|_| format!("could not parse '{raw}' as a positive integer"))?;
    if parsed == 0 {
        return Err("value must be greater than zero".to_string());
    }
    Ok(parsed)
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> ReplayAggregatorCli {
        parse_cli(std::iter::once("replay_aggregator").chain(args.iter().copied()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn cli_flags_override_task_defaults() {
        let cli = cli(&[
            "--dump",
            "a.json",
            "--task",
            "T0",
            "--task",
            "T1",
            "--size-field",
            "#size",
            "--batch-size",
            "25",
            "--discard-on-exit",
            "--retries",
            "2",
        ]);
        let config = aggregator_config(&cli).unwrap();
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[1].width_field.as_deref(), Some("#size"));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Discard);
        assert!(config.stop_on_exhaustion);
        assert_eq!(config.exhaustion_retries, 2);
    }

    #[test]
    fn zero_batch_size_and_conflicting_sources_are_rejected() {
        let parsed = parse_cli::<ReplayAggregatorCli, _>(["replay_aggregator", "--batch-size", "0"]);
        assert!(parsed.is_err());
        let parsed = parse_cli::<ReplayAggregatorCli, _>([
            "replay_aggregator",
            "--dump",
            "a.json",
            "--queue-input",
            "b.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn missing_source_is_reported() {
        let cli = cli(&["--task", "T1"]);
        assert!(build_source(&cli).is_err());
    }
}
