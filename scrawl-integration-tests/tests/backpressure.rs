//! Bus back-pressure: a slow subscriber never slows the producer

use chrono::Utc;
use scrawl_connectors::{ProjectId, UserId};
use scrawl_pipeline::{
    Event, EventType, ProgressBus, Stage, Topic, WorkflowId, WorkflowStatus,
};
use std::time::Instant;

fn event(workflow_id: WorkflowId, n: u32) -> Event {
    Event {
        workflow_id,
        project_id: ProjectId::new("p1"),
        user_id: UserId::new("u1"),
        event: EventType::Progress,
        stage: Stage::Ocr,
        progress: 0,
        status: WorkflowStatus::Running,
        timestamp: Utc::now(),
        // Sequence rides in the message so order survives drops
        message: Some(n.to_string()),
        error: None,
    }
}

fn seq(event: &Event) -> u32 {
    event
        .message
        .as_deref()
        .and_then(|m| m.parse().ok())
        .expect("sequenced event")
}

#[tokio::test]
async fn test_slow_subscriber_sees_prefix_plus_suffix_in_order() {
    let bus = ProgressBus::new(128);
    let workflow_id = WorkflowId::new();
    let subscription = bus.subscribe(Topic::Workflow(workflow_id));

    // Consume a small prefix, then stall
    for n in 0..10 {
        bus.publish(event(workflow_id, n));
    }
    let mut received: Vec<u32> = Vec::new();
    for _ in 0..10 {
        received.push(seq(&subscription.recv().await));
    }

    for n in 10..1000 {
        bus.publish(event(workflow_id, n));
    }
    while let Some(event) = subscription.try_recv() {
        received.push(seq(&event));
    }

    // A strictly increasing sequence: the first N, a gap, the last M
    assert!(received.windows(2).all(|w| w[0] < w[1]));
    assert!(received.len() <= 1000);
    assert_eq!(received[..10], (0..10).collect::<Vec<u32>>()[..]);
    let tail = &received[10..];
    assert_eq!(tail.len(), 128, "buffer-sized suffix survives");
    assert_eq!(*tail.last().expect("tail non-empty"), 999);
    assert_eq!(subscription.dropped(), (1000 - 10 - 128) as u64);
}

#[tokio::test]
async fn test_publish_throughput_unaffected_by_stalled_subscriber() {
    let bus = ProgressBus::new(128);
    let workflow_id = WorkflowId::new();

    let start = Instant::now();
    for n in 0..1000 {
        bus.publish(event(workflow_id, n));
    }
    let baseline = start.elapsed();

    // Same publish volume with a stalled subscriber attached
    let _stalled = bus.subscribe(Topic::Workflow(workflow_id));
    let start = Instant::now();
    for n in 0..1000 {
        bus.publish(event(workflow_id, n));
    }
    let with_subscriber = start.elapsed();

    // Generous bound: fan-out must stay in the same order of magnitude
    assert!(
        with_subscriber < baseline * 20 + std::time::Duration::from_millis(50),
        "baseline {baseline:?} vs {with_subscriber:?}"
    );
}
