//! `scrawl demo`

use crate::fixtures;
use anyhow::Result;
use scrawl_pipeline::stages::StageConnectors;
use scrawl_pipeline::{EngineConfig, PipelineEngine, Topic, WorkflowConfig};
use scrawl_connectors::ProjectStore;

pub async fn run(json: bool) -> Result<()> {
    let (connectors, store, blobs) = StageConnectors::in_memory();
    let (project_id, user_id) = fixtures::seed_demo_project(&store, &blobs).await?;

    let engine = PipelineEngine::start(EngineConfig::default(), connectors).await?;
    let subscription = engine.subscribe(Topic::Project(project_id.clone()));

    let workflow_id = engine
        .start_workflow(user_id, project_id.clone(), WorkflowConfig::default())
        .await?;
    println!("started workflow {workflow_id}");

    loop {
        let event = subscription.recv().await;
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!(
                "{:<16} stage={:<9} progress={:>3} status={}",
                format!("{:?}", event.event),
                event.stage.to_string(),
                event.progress,
                event.status
            );
        }
        if event.status.is_terminal() {
            break;
        }
    }

    let workflow = engine.get_workflow(workflow_id, &scrawl_connectors::UserId::new(fixtures::DEMO_USER))?;
    println!("\nfinal status: {} ({}%)", workflow.status, workflow.progress);
    for (stage, result) in &workflow.stage_results {
        println!("  {stage}: {result}");
    }

    if let Some(summary) = store.summary(&project_id).await.map_err(|e| anyhow::anyhow!("{e}"))? {
        println!("\nthemes:");
        for theme in &summary.top_themes {
            println!(
                "  {} — {} notes ({:.0}%)",
                theme.label, theme.note_count, theme.percentage
            );
        }
        for insight in &summary.insights {
            println!("  note: {insight}");
        }
    }
    let artifacts = store.artifacts(&project_id).await.map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("\nartifacts:");
    for artifact in artifacts {
        println!("  {} -> {}", artifact.format, artifact.blob_key);
    }

    engine.shutdown().await?;
    Ok(())
}
