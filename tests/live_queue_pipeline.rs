use std::time::Duration;

use crowdbox::source::body_checksum;
use crowdbox::{
    AggregatorConfig, ArchiveEngine, BatchOrchestrator, CycleOutcome, LiveQueueConfig,
    LiveQueueSource, MemoryQueue, ParserConfig, QueueTransport,
};
use serde_json::{Value, json};
use tempfile::tempdir;

const URL: &str = "memory://annotations";

fn classification(id: i64, worker: Value) -> Value {
    json!({
        "classification_id": id,
        "user_id": worker,
        "data": {"classification": {
            "subject": {"id": format!("s-{}", id % 3), "metadata": {}},
            "user_id": worker,
            "metadata": {"subject_dimensions": [{"naturalWidth": 1024, "naturalHeight": 768}]},
            "annotations": {
                "T0": [{"value": [{"x": 10.0, "y": 10.0, "tool": 0}]}],
                "T1": [{"value": [{"x": 300.0, "y": 200.0, "tool": 0}]}]
            }
        }}
    })
}

fn live_config() -> LiveQueueConfig {
    LiveQueueConfig::new(URL)
        .with_wait_time(Duration::ZERO)
        .with_visibility_timeout(Duration::from_secs(5))
}

#[test]
fn redelivered_messages_are_acknowledged_but_never_resubmitted() {
    let temp = tempdir().unwrap();
    let queue = MemoryQueue::new();
    let source = LiveQueueSource::new(live_config(), queue.clone()).unwrap();
    source
        .put_messages(
            &[
                classification(1, json!(11)),
                classification(2, json!(12)),
                classification(1, json!(11)),
                classification(3, Value::Null),
            ],
            true,
        )
        .unwrap();

    let config = AggregatorConfig::new([ParserConfig::new("T0"), ParserConfig::new("T1")])
        .with_batch_size(10)
        .with_save_location(temp.path(), "live");
    let mut orchestrator =
        BatchOrchestrator::new(config, source, |task, prefix| ArchiveEngine::new(task.clone(), prefix))
            .unwrap();

    assert!(matches!(
        orchestrator.run_cycle().unwrap(),
        CycleOutcome::Submitted { messages: 3, .. }
    ));
    assert!(queue.is_empty(URL));
    assert_eq!(orchestrator.source().stats().acknowledged, 4);
    for task in ["T0", "T1"] {
        assert_eq!(orchestrator.engine(task).unwrap().annotation_count(), 3);
        assert_eq!(orchestrator.parser(task).unwrap().processed_classification_count(), 0);
    }

    // A late redelivery of an already-submitted id is acknowledged and skipped.
    queue
        .send(URL, classification(2, json!(12)).to_string())
        .unwrap();
    assert_eq!(
        orchestrator.run_cycle().unwrap(),
        CycleOutcome::TaskWithoutData {
            task: "T0".to_string(),
            messages: 1
        }
    );
    assert!(queue.is_empty(URL));
    assert_eq!(orchestrator.engine("T1").unwrap().annotation_count(), 3);
}

#[test]
fn corrupted_bodies_stay_on_the_queue() {
    let temp = tempdir().unwrap();
    let queue = MemoryQueue::new();
    let body = classification(9, json!(5)).to_string();
    queue.send_with_checksum(URL, body.clone(), "0".repeat(32));
    queue
        .send(URL, classification(10, json!(5)).to_string())
        .unwrap();

    let source = LiveQueueSource::new(live_config(), queue.clone()).unwrap();
    let config = AggregatorConfig::new([ParserConfig::new("T1")])
        .with_batch_size(10)
        .with_save_location(temp.path(), "corrupted");
    let mut orchestrator =
        BatchOrchestrator::new(config, source, |task, prefix| ArchiveEngine::new(task.clone(), prefix))
            .unwrap();

    assert!(matches!(
        orchestrator.run_cycle().unwrap(),
        CycleOutcome::Submitted { messages: 1, .. }
    ));
    assert_eq!(orchestrator.source().stats().checksum_mismatches, 1);
    assert_eq!(queue.len(URL), 1);
    assert_ne!(body_checksum(&body), "0".repeat(32));
}

#[test]
fn stop_token_ends_a_run_before_the_next_cycle() {
    let temp = tempdir().unwrap();
    let queue = MemoryQueue::new();
    let source = LiveQueueSource::new(live_config(), queue).unwrap();
    let config = AggregatorConfig::new([ParserConfig::new("T1")])
        .with_save_location(temp.path(), "stopped")
        .with_idle_delay(Duration::from_millis(5));
    let mut orchestrator =
        BatchOrchestrator::new(config, source, |task, prefix| ArchiveEngine::new(task.clone(), prefix))
            .unwrap();

    let stop = orchestrator.stop_token();
    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        stop.request_stop();
    });
    let summary = orchestrator.run().unwrap();
    trigger.join().unwrap();
    assert_eq!(summary.reason, crowdbox::StopReason::Requested);
    assert_eq!(summary.cycles, 0);
    assert!(!summary.saved_on_exit);
}
