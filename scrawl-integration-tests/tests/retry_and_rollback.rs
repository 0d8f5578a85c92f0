//! Transient-failure retry and invalid-input rollback scenarios

use scrawl_integration_tests::{start_harness, test_config, FlakyOcr, RejectingClusterer};
use scrawl_pipeline::{ErrorKind, EventType, JobState, JobType, Stage, Topic, WorkflowStatus};
use std::sync::Arc;
use std::time::Duration;

async fn wait_terminal(
    harness: &scrawl_integration_tests::Harness,
    workflow_id: scrawl_pipeline::WorkflowId,
) -> scrawl_pipeline::Workflow {
    for _ in 0..600 {
        let workflow = harness
            .engine
            .get_workflow(workflow_id, &harness.user_id)
            .expect("workflow loads");
        if workflow.status.is_terminal() {
            return workflow;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("workflow never settled");
}

#[tokio::test]
async fn test_ocr_transient_failures_recover_within_attempt_budget() {
    // First two OCR attempts time out, the third succeeds
    let harness = start_harness(test_config(), |mut c| {
        c.ocr = Arc::new(FlakyOcr::new(c.ocr, 2));
        c
    })
    .await;

    let workflow_id = harness
        .engine
        .start_workflow(
            harness.user_id.clone(),
            harness.project_id.clone(),
            Default::default(),
        )
        .await
        .expect("workflow starts");

    let workflow = wait_terminal(&harness, workflow_id).await;
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let ocr_job = harness
        .engine
        .queue()
        .jobs_for_workflow(workflow_id)
        .await
        .into_iter()
        .find(|j| j.job_type == JobType::Ocr)
        .expect("ocr job exists");
    assert_eq!(ocr_job.state, JobState::Completed);
    assert!(ocr_job.attempts >= 3, "attempts = {}", ocr_job.attempts);

    harness.engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_ocr_failures_beyond_budget_fail_the_workflow() {
    let harness = start_harness(test_config(), |mut c| {
        c.ocr = Arc::new(FlakyOcr::new(c.ocr, u32::MAX));
        c
    })
    .await;

    let workflow_id = harness
        .engine
        .start_workflow(
            harness.user_id.clone(),
            harness.project_id.clone(),
            Default::default(),
        )
        .await
        .expect("workflow starts");

    let workflow = wait_terminal(&harness, workflow_id).await;
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(
        workflow.error.as_ref().expect("error recorded").kind,
        ErrorKind::Timeout
    );

    harness.engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_invalid_input_rolls_back_once_then_completes() {
    // The first clustering attempt rejects its input
    let harness = start_harness(test_config(), |mut c| {
        c.clustering = Arc::new(RejectingClusterer::new(c.clustering, 1));
        c
    })
    .await;
    let subscription = harness
        .engine
        .subscribe(Topic::Project(harness.project_id.clone()));

    let workflow_id = harness
        .engine
        .start_workflow(
            harness.user_id.clone(),
            harness.project_id.clone(),
            Default::default(),
        )
        .await
        .expect("workflow starts");

    let workflow = wait_terminal(&harness, workflow_id).await;
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.rollback_count, 1);

    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    let rollback_at = events
        .iter()
        .position(|e| e.event == EventType::Rollback)
        .expect("rollback event published");
    assert_eq!(events[rollback_at].stage, Stage::Clean);

    // Clean re-runs after the rollback, then cluster succeeds
    let clean_restart = events[rollback_at..]
        .iter()
        .position(|e| e.event == EventType::StageStarted && e.stage == Stage::Clean)
        .expect("clean re-started");
    assert!(events[rollback_at + clean_restart..]
        .iter()
        .any(|e| e.event == EventType::StageStarted && e.stage == Stage::Cluster));

    harness.engine.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
async fn test_invalid_input_recurrence_escalates_to_failed() {
    // Clustering rejects its input on the first run and on the re-run
    let harness = start_harness(test_config(), |mut c| {
        c.clustering = Arc::new(RejectingClusterer::new(c.clustering, 2));
        c
    })
    .await;
    let subscription = harness
        .engine
        .subscribe(Topic::Project(harness.project_id.clone()));

    let workflow_id = harness
        .engine
        .start_workflow(
            harness.user_id.clone(),
            harness.project_id.clone(),
            Default::default(),
        )
        .await
        .expect("workflow starts");

    let workflow = wait_terminal(&harness, workflow_id).await;
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(
        workflow.error.as_ref().expect("error recorded").kind,
        ErrorKind::InvalidInput
    );

    let mut rollbacks = 0;
    while let Some(event) = subscription.try_recv() {
        if event.event == EventType::Rollback {
            rollbacks += 1;
        }
    }
    assert_eq!(rollbacks, 1, "only one rollback before escalation");

    // A failed workflow can be restarted under a fresh id; the injected
    // failures are spent, so the restart completes
    let new_id = harness
        .engine
        .restart_failed_workflow(workflow_id, &harness.user_id)
        .await
        .expect("restart accepted");
    assert_ne!(new_id, workflow_id);
    let restarted = wait_terminal(&harness, new_id).await;
    assert_eq!(restarted.status, WorkflowStatus::Completed);
    let old = harness
        .engine
        .get_workflow(workflow_id, &harness.user_id)
        .expect("old workflow retained");
    assert_eq!(old.status, WorkflowStatus::Failed);

    harness.engine.shutdown().await.expect("clean shutdown");
}
