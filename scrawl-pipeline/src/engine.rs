//! Engine composition root
//!
//! Wires store, queue, registry, bus, workers, orchestrator, and monitor
//! into one value built at process start. Handlers receive this explicitly;
//! there is no ambient registry.

use crate::bus::{ProgressBus, Subscription, Topic};
use crate::config::EngineConfig;
use crate::error::PipelineResult;
use crate::monitor::{Alert, HealthReport, MetricsSnapshot, PipelineMonitor};
use crate::orchestrator::PipelineOrchestrator;
use crate::queue::{JobQueue, QueueHealth};
use crate::registry::WorkflowRegistry;
use crate::stages::{StageConnectors, StageRegistry};
use crate::state::StateStore;
use crate::worker::WorkerPool;
use crate::workflow::{Workflow, WorkflowConfig, WorkflowId};
use scrawl_connectors::{ProjectId, UserId};
use std::sync::Arc;
use tracing::info;

/// A running processing workflow engine
pub struct PipelineEngine {
    config: EngineConfig,
    store: Arc<StateStore>,
    bus: Arc<ProgressBus>,
    queue: Arc<JobQueue>,
    registry: Arc<WorkflowRegistry>,
    orchestrator: Arc<PipelineOrchestrator>,
    workers: Arc<WorkerPool>,
    monitor: Arc<PipelineMonitor>,
}

impl PipelineEngine {
    /// Build and start the engine
    ///
    /// Recovery runs before workers spawn: workflows interrupted by the
    /// previous process are finalized as failed and alerted on.
    pub async fn start(
        config: EngineConfig,
        connectors: StageConnectors,
    ) -> PipelineResult<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(match &config.data_dir {
            Some(dir) => StateStore::open(dir)?,
            None => StateStore::temporary()?,
        });
        let bus = Arc::new(ProgressBus::new(config.event_buffer));
        let registry = Arc::new(WorkflowRegistry::new(
            store.clone(),
            bus.clone(),
            config.retention,
        )?);
        let queue = Arc::new(JobQueue::new(store.clone(), config.queue.clone())?);
        let connectors = Arc::new(connectors);
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            connectors.store.clone(),
            config.orchestrator.clone(),
        ));

        let recovered = orchestrator.recover().await?;

        let workers = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(StageRegistry::standard()),
            connectors,
            config.worker.clone(),
        ));
        workers.spawn();

        let monitor = Arc::new(PipelineMonitor::new(
            registry.clone(),
            queue.clone(),
            store.clone(),
            orchestrator.clone(),
            config.monitor.clone(),
        ));
        monitor.record_recovery(&recovered);
        monitor.spawn();

        info!(recovered = recovered.len(), "pipeline engine started");
        Ok(Arc::new(Self {
            config,
            store,
            bus,
            queue,
            registry,
            orchestrator,
            workers,
            monitor,
        }))
    }

    /// Stop workers, drivers, and the monitor, then flush the store
    pub async fn shutdown(&self) -> PipelineResult<()> {
        self.workers.shutdown().await;
        self.orchestrator.shutdown();
        self.monitor.shutdown().await;
        self.store.ping()?;
        info!("pipeline engine stopped");
        Ok(())
    }

    /// Start a workflow over a project
    pub async fn start_workflow(
        &self,
        user_id: UserId,
        project_id: ProjectId,
        config: WorkflowConfig,
    ) -> PipelineResult<WorkflowId> {
        self.orchestrator
            .start_workflow(user_id, project_id, config)
            .await
    }

    /// Fetch a workflow the requester owns
    pub fn get_workflow(&self, id: WorkflowId, requester: &UserId) -> PipelineResult<Workflow> {
        self.orchestrator.get_workflow(id, requester)
    }

    /// Request cancellation of a workflow
    pub async fn cancel_workflow(&self, id: WorkflowId) -> PipelineResult<bool> {
        self.orchestrator.cancel_workflow(id).await
    }

    /// Restart a failed workflow under a fresh id
    pub async fn restart_failed_workflow(
        &self,
        id: WorkflowId,
        requester: &UserId,
    ) -> PipelineResult<WorkflowId> {
        self.orchestrator.restart_failed_workflow(id, requester).await
    }

    /// Workflows owned by a user
    pub fn list_user_workflows(&self, user_id: &UserId) -> Vec<Workflow> {
        self.orchestrator.list_user_workflows(user_id)
    }

    /// Workflows over a project
    pub fn list_project_workflows(&self, project_id: &ProjectId) -> Vec<Workflow> {
        self.orchestrator.list_project_workflows(project_id)
    }

    /// Subscribe to workflow events
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.bus.subscribe(topic)
    }

    /// Queue state counts
    pub async fn queue_health(&self) -> QueueHealth {
        self.queue.queue_health().await
    }

    /// Most recent metrics snapshot, computing one if none exists yet
    pub async fn metrics(&self) -> MetricsSnapshot {
        match self.monitor.latest_metrics() {
            Some(snapshot) => snapshot,
            None => self.monitor.sweep().await,
        }
    }

    /// Most recent health report, computing one if none exists yet
    pub async fn health(&self) -> HealthReport {
        match self.monitor.latest_health() {
            Some(report) => report,
            None => self.monitor.check_health().await,
        }
    }

    /// Monitor alerts, newest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.monitor.alerts()
    }

    /// The engine configuration in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Direct registry access for read paths
    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Direct queue access for read paths and maintenance
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }
}
