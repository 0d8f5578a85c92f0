//! Stuck detection and crash recovery scenarios

use scrawl_integration_tests::{start_harness, test_config, GatedOcr};
use scrawl_pipeline::{
    AlertType, ProgressBus, Stage, StateStore, Workflow, WorkflowConfig, WorkflowRegistry,
    WorkflowStatus,
};
use scrawl_pipeline::stages::StageConnectors;
use scrawl_pipeline::{EngineConfig, ErrorKind, PipelineEngine};
use scrawl_connectors::{ProjectId, UserId};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_stuck_workflow_alerts_then_completes_after_unfreeze() {
    let mut config = test_config();
    // Everything running counts as stuck, and the sweep runs continuously
    config.monitor.stuck_threshold = Duration::from_secs(0);
    config.monitor.metric_interval = Duration::from_millis(50);

    let mut release = None;
    let harness = start_harness(config, |mut c| {
        let (gated, tx) = GatedOcr::new(c.ocr);
        release = Some(tx);
        c.ocr = Arc::new(gated);
        c
    })
    .await;
    let release = release.expect("gate handle");

    let workflow_id = harness
        .engine
        .start_workflow(
            harness.user_id.clone(),
            harness.project_id.clone(),
            Default::default(),
        )
        .await
        .expect("workflow starts");

    // A warning alert lands within a sweep or two
    let mut saw_alert = false;
    for _ in 0..100 {
        if harness.engine.alerts().iter().any(|a| {
            a.workflow_id == Some(workflow_id)
                && matches!(a.alert_type, AlertType::Warning | AlertType::Error)
        }) {
            saw_alert = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_alert, "no stuck alert raised");

    // The consistency probe saw an in-flight job: no spurious failure
    let workflow = harness
        .engine
        .get_workflow(workflow_id, &harness.user_id)
        .expect("workflow loads");
    assert_eq!(workflow.status, WorkflowStatus::Running);

    // Unfreeze; the workflow completes normally
    release.send(true).expect("gate releases");
    for _ in 0..600 {
        let workflow = harness
            .engine
            .get_workflow(workflow_id, &harness.user_id)
            .expect("workflow loads");
        if workflow.status.is_terminal() {
            assert_eq!(workflow.status, WorkflowStatus::Completed);
            harness.engine.shutdown().await.expect("clean shutdown");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("workflow never completed after unfreeze");
}

#[tokio::test]
async fn test_restart_finalizes_interrupted_workflows() {
    let dir = tempfile::tempdir().expect("tempdir");

    // A previous process left a running workflow behind
    let interrupted = {
        let store = Arc::new(StateStore::open(dir.path()).expect("open store"));
        let bus = Arc::new(ProgressBus::new(16));
        let registry = Arc::new(
            WorkflowRegistry::new(store.clone(), bus, Duration::from_secs(3600)).expect("build"),
        );
        let workflow = Workflow::new(
            ProjectId::new("p-orphan"),
            UserId::new("u1"),
            WorkflowConfig::default(),
        );
        let id = workflow.id;
        registry.insert(workflow).expect("insert");
        registry.mark_stage_started(id, Stage::Ocr).expect("start");
        store.ping().expect("flush");
        id
        // store and registry drop here, releasing the sled lock
    };

    let mut config = test_config();
    config.data_dir = Some(dir.path().to_path_buf());
    let (connectors, _store, _blobs) = StageConnectors::in_memory();
    let engine = PipelineEngine::start(config, connectors)
        .await
        .expect("engine starts");

    let registry = engine.registry();
    let workflow = registry.get(interrupted).expect("workflow reloaded");
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    let error = workflow.error.expect("recovery error recorded");
    assert_eq!(error.kind, ErrorKind::Internal);
    assert!(error.detail.contains("ocr"), "{}", error.detail);

    // Recovery leaves an info alert trail
    assert!(engine
        .alerts()
        .iter()
        .any(|a| a.workflow_id == Some(interrupted) && a.alert_type == AlertType::Info));

    engine.shutdown().await.expect("clean shutdown");
}
