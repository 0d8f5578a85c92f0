//! `scrawl serve`

use crate::fixtures;
use anyhow::Result;
use scrawl_pipeline::stages::StageConnectors;
use scrawl_pipeline::{EngineConfig, PipelineEngine};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

pub async fn run(addr: SocketAddr, data_dir: Option<PathBuf>, seed_demo: bool) -> Result<()> {
    let mut config = EngineConfig::from_env()?;
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }

    let (connectors, store, blobs) = StageConnectors::in_memory();
    if seed_demo {
        let (project_id, user_id) = fixtures::seed_demo_project(&store, &blobs).await?;
        info!(%project_id, %user_id, "demo project seeded");
    }

    let engine = PipelineEngine::start(config, connectors).await?;
    scrawl_pipeline::api::serve(engine, addr).await?;
    Ok(())
}
