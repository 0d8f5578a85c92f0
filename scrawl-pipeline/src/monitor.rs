//! Pipeline monitor
//!
//! Two cadences over the registry and queue: a metric sweep computing the
//! snapshot and raising warnings, and a health check classifying the
//! engine. Stuck running workflows raise a warning first, an error on
//! repeat, and are handed to the orchestrator's consistency probe. Alert
//! creation is idempotent per workflow and key so a persistent failure does
//! not storm subscribers.

use crate::error::PipelineResult;
use crate::queue::{JobQueue, QueueHealth};
use crate::registry::WorkflowRegistry;
use crate::state::StateStore;
use crate::workflow::{WorkflowId, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::gauge;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Consistency probe the monitor runs against stuck workflows
#[async_trait]
pub trait WorkflowValidator: Send + Sync {
    /// Returns whether the workflow state is consistent; implementations
    /// may finalize inconsistent workflows as a side effect
    async fn validate_workflow(&self, id: WorkflowId) -> PipelineResult<bool>;
}

/// Alert identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub Uuid);

impl AlertId {
    /// Create new alert ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Info,
    Warning,
    Error,
}

/// Monitor-emitted observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub alert_type: AlertType,
    /// Absent for system-wide alerts
    pub workflow_id: Option<WorkflowId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    /// Create a new alert
    pub fn new(alert_type: AlertType, message: impl Into<String>) -> Self {
        Self {
            id: AlertId::new(),
            alert_type,
            workflow_id: None,
            message: message.into(),
            timestamp: Utc::now(),
            resolved: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a workflow
    pub fn with_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Attach metadata
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Point-in-time metrics over workflows and the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_workflows: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Stage histogram of running workflows
    pub stage_histogram: BTreeMap<String, usize>,
    pub mean_completion_ms: Option<f64>,
    /// Exponential running mean across sweeps
    pub running_mean_processing_ms: Option<f64>,
    /// Failed over total, 0.0..=1.0
    pub error_rate: f64,
    /// Completions in the trailing hour
    pub throughput_per_hour: usize,
    pub queue: QueueHealth,
    pub taken_at: DateTime<Utc>,
}

/// Engine health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, bool>,
    pub checked_at: DateTime<Utc>,
}

/// Monitor tuning knobs
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub metric_interval: Duration,
    pub health_interval: Duration,
    /// Running this long without settling counts as stuck
    pub stuck_threshold: Duration,
    /// Resolved alerts and settled jobs older than this are purged
    pub retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metric_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(30 * 60),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Out-of-band observer of the registry and queue
pub struct PipelineMonitor {
    registry: Arc<WorkflowRegistry>,
    queue: Arc<JobQueue>,
    store: Arc<StateStore>,
    validator: Arc<dyn WorkflowValidator>,
    config: MonitorConfig,
    alerts: RwLock<HashMap<AlertId, Alert>>,
    /// (workflow, key) -> alert, for idempotent raising
    dedup: RwLock<HashMap<(Option<WorkflowId>, String), AlertId>>,
    /// Consecutive stuck detections per workflow
    stuck_seen: RwLock<HashMap<WorkflowId, u32>>,
    ema_processing_ms: Mutex<Option<f64>>,
    latest_metrics: RwLock<Option<MetricsSnapshot>>,
    latest_health: RwLock<Option<HealthReport>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineMonitor {
    /// Create the monitor; call `spawn` to start the sweeps
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        queue: Arc<JobQueue>,
        store: Arc<StateStore>,
        validator: Arc<dyn WorkflowValidator>,
        config: MonitorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry,
            queue,
            store,
            validator,
            config,
            alerts: RwLock::new(HashMap::new()),
            dedup: RwLock::new(HashMap::new()),
            stuck_seen: RwLock::new(HashMap::new()),
            ema_processing_ms: Mutex::new(None),
            latest_metrics: RwLock::new(None),
            latest_health: RwLock::new(None),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Start both sweep cadences
    pub fn spawn(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut metric_tick = tokio::time::interval(monitor.config.metric_interval);
            let mut health_tick = tokio::time::interval(monitor.config.health_interval);
            metric_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = metric_tick.tick() => { monitor.sweep().await; }
                    _ = health_tick.tick() => { monitor.check_health().await; }
                    _ = shutdown.changed() => break,
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stop the sweeps
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run one metric sweep
    pub async fn sweep(&self) -> MetricsSnapshot {
        let now = Utc::now();
        let workflows = self.registry.all();
        let total_workflows = workflows.len();

        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut stage_histogram: BTreeMap<String, usize> = BTreeMap::new();
        let mut completion_ms: Vec<f64> = Vec::new();
        let mut failed = 0usize;
        let mut completions_last_hour = 0usize;

        for workflow in &workflows {
            *by_status.entry(workflow.status.to_string()).or_insert(0) += 1;
            match workflow.status {
                WorkflowStatus::Running => {
                    *stage_histogram
                        .entry(workflow.current_stage.to_string())
                        .or_insert(0) += 1;
                }
                WorkflowStatus::Completed => {
                    if let Some(at) = workflow.completed_at {
                        completion_ms
                            .push((at - workflow.started_at).num_milliseconds() as f64);
                        if at > now - ChronoDuration::hours(1) {
                            completions_last_hour += 1;
                        }
                    }
                }
                WorkflowStatus::Failed => failed += 1,
                _ => {}
            }
        }

        let mean_completion_ms = if completion_ms.is_empty() {
            None
        } else {
            Some(completion_ms.iter().sum::<f64>() / completion_ms.len() as f64)
        };
        let running_mean_processing_ms = {
            let mut ema = self.ema_processing_ms.lock();
            if let Some(mean) = mean_completion_ms {
                let next = match *ema {
                    Some(prev) => prev * 0.8 + mean * 0.2,
                    None => mean,
                };
                *ema = Some(next);
            }
            *ema
        };

        let error_rate = if total_workflows == 0 {
            0.0
        } else {
            failed as f64 / total_workflows as f64
        };

        if total_workflows > 0 && error_rate > 0.10 {
            self.raise(
                Alert::new(
                    AlertType::Warning,
                    format!("error rate at {:.0}%", error_rate * 100.0),
                ),
                "error-rate",
            );
        }
        if total_workflows > 0 && completions_last_hour < 1 {
            self.raise(
                Alert::new(AlertType::Warning, "throughput below one workflow per hour"),
                "throughput",
            );
        }

        self.detect_stuck(&workflows, now).await;

        // Retention housekeeping rides the metric sweep
        if let Err(err) = self.registry.purge_expired() {
            warn!(%err, "workflow purge failed");
        }
        if let Err(err) = self.queue.clean(None, self.config.retention).await {
            warn!(%err, "job cleanup failed");
        }
        self.cleanup_alerts();

        let snapshot = MetricsSnapshot {
            total_workflows,
            by_status,
            stage_histogram,
            mean_completion_ms,
            running_mean_processing_ms,
            error_rate,
            throughput_per_hour: completions_last_hour,
            queue: self.queue.queue_health().await,
            taken_at: now,
        };
        gauge!("scrawl_error_rate").set(snapshot.error_rate);
        gauge!("scrawl_throughput_per_hour").set(snapshot.throughput_per_hour as f64);
        *self.latest_metrics.write() = Some(snapshot.clone());
        snapshot
    }

    async fn detect_stuck(&self, workflows: &[crate::workflow::Workflow], now: DateTime<Utc>) {
        let threshold = ChronoDuration::from_std(self.config.stuck_threshold)
            .unwrap_or_else(|_| ChronoDuration::minutes(30));
        for workflow in workflows {
            if workflow.status != WorkflowStatus::Running {
                self.stuck_seen.write().remove(&workflow.id);
                continue;
            }
            if now - workflow.started_at <= threshold {
                continue;
            }
            let detections = {
                let mut seen = self.stuck_seen.write();
                let entry = seen.entry(workflow.id).or_insert(0);
                *entry += 1;
                *entry
            };
            // Repeated detections escalate
            let severity = if detections >= 2 {
                AlertType::Error
            } else {
                AlertType::Warning
            };
            warn!(workflow_id = %workflow.id, stage = %workflow.current_stage, detections, "stuck workflow detected");
            self.raise(
                Alert::new(
                    severity,
                    format!(
                        "workflow stuck in {} for over {}s",
                        workflow.current_stage,
                        self.config.stuck_threshold.as_secs()
                    ),
                )
                .with_workflow(workflow.id)
                .with_metadata("stage", workflow.current_stage.to_string()),
                "stuck",
            );
            if let Err(err) = self.validator.validate_workflow(workflow.id).await {
                warn!(workflow_id = %workflow.id, %err, "state validation failed");
            }
        }
    }

    /// Run one health check
    pub async fn check_health(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        let store_ok = self.store.ping().is_ok();
        components.insert("store".to_string(), store_ok);
        components.insert("queue".to_string(), true);
        components.insert("registry".to_string(), true);
        components.insert("bus".to_string(), true);

        let has_error_alert = self
            .alerts
            .read()
            .values()
            .any(|a| !a.resolved && a.alert_type == AlertType::Error);

        let status = if !store_ok {
            HealthStatus::Unhealthy
        } else if has_error_alert {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let report = HealthReport {
            status,
            components,
            checked_at: Utc::now(),
        };
        if status != HealthStatus::Healthy {
            warn!(?status, "engine health degraded");
        }
        *self.latest_health.write() = Some(report.clone());
        report
    }

    /// Record an alert, idempotently per `(workflow, key)`
    ///
    /// An unresolved alert with the same key is refreshed in place (and
    /// upgraded if the new severity is higher) instead of duplicated.
    pub fn raise(&self, alert: Alert, key: &str) -> AlertId {
        let dedup_key = (alert.workflow_id, key.to_string());
        let mut dedup = self.dedup.write();
        let mut alerts = self.alerts.write();
        if let Some(existing_id) = dedup.get(&dedup_key) {
            if let Some(existing) = alerts.get_mut(existing_id) {
                if !existing.resolved {
                    existing.timestamp = alert.timestamp;
                    existing.alert_type = existing.alert_type.max(alert.alert_type);
                    existing.message = alert.message;
                    return *existing_id;
                }
            }
        }
        let id = alert.id;
        info!(alert_id = ?id.0, message = %alert.message, "alert raised");
        dedup.insert(dedup_key, id);
        alerts.insert(id, alert);
        id
    }

    /// Info alerts for workflows finalized during crash recovery
    pub fn record_recovery(&self, recovered: &[WorkflowId]) {
        for id in recovered {
            self.raise(
                Alert::new(
                    AlertType::Info,
                    "workflow finalized as failed after process restart",
                )
                .with_workflow(*id),
                "recovered",
            );
        }
    }

    /// All alerts, newest first
    pub fn alerts(&self) -> Vec<Alert> {
        let mut out: Vec<Alert> = self.alerts.read().values().cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    /// Mark an alert resolved
    pub fn resolve(&self, id: AlertId) -> bool {
        match self.alerts.write().get_mut(&id) {
            Some(alert) => {
                alert.resolved = true;
                true
            }
            None => false,
        }
    }

    /// Drop resolved alerts older than the retention window
    pub fn cleanup_alerts(&self) {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.retention)
                .unwrap_or_else(|_| ChronoDuration::hours(24));
        let mut alerts = self.alerts.write();
        let stale: Vec<AlertId> = alerts
            .values()
            .filter(|a| a.resolved && a.timestamp < cutoff)
            .map(|a| a.id)
            .collect();
        for id in &stale {
            alerts.remove(id);
        }
        if !stale.is_empty() {
            self.dedup.write().retain(|_, id| alerts.contains_key(id));
        }
    }

    /// Most recent metrics snapshot
    pub fn latest_metrics(&self) -> Option<MetricsSnapshot> {
        self.latest_metrics.read().clone()
    }

    /// Most recent health report
    pub fn latest_health(&self) -> Option<HealthReport> {
        self.latest_health.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ProgressBus;
    use crate::queue::QueueConfig;
    use crate::workflow::{Workflow, WorkflowConfig};
    use scrawl_connectors::{ProjectId, UserId};

    struct NoopValidator;

    #[async_trait]
    impl WorkflowValidator for NoopValidator {
        async fn validate_workflow(&self, _id: WorkflowId) -> PipelineResult<bool> {
            Ok(true)
        }
    }

    fn monitor(config: MonitorConfig) -> (Arc<PipelineMonitor>, Arc<WorkflowRegistry>) {
        let store = Arc::new(StateStore::temporary().expect("open store"));
        let bus = Arc::new(ProgressBus::new(32));
        let registry = Arc::new(
            WorkflowRegistry::new(store.clone(), bus, Duration::from_secs(3600)).expect("build"),
        );
        let queue =
            Arc::new(JobQueue::new(store.clone(), QueueConfig::default()).expect("build queue"));
        (
            Arc::new(PipelineMonitor::new(
                registry.clone(),
                queue,
                store,
                Arc::new(NoopValidator),
                config,
            )),
            registry,
        )
    }

    #[tokio::test]
    async fn test_sweep_counts_statuses() {
        let (monitor, registry) = monitor(MonitorConfig::default());
        let wf = Workflow::new(
            ProjectId::new("p1"),
            UserId::new("u1"),
            WorkflowConfig::default(),
        );
        let id = wf.id;
        registry.insert(wf).expect("insert");
        registry
            .mark_stage_started(id, crate::workflow::Stage::Ocr)
            .expect("start");

        let snapshot = monitor.sweep().await;
        assert_eq!(snapshot.total_workflows, 1);
        assert_eq!(snapshot.by_status.get("running"), Some(&1));
        assert_eq!(snapshot.stage_histogram.get("ocr"), Some(&1));
    }

    #[tokio::test]
    async fn test_stuck_detection_raises_then_escalates() {
        let (monitor, registry) = monitor(MonitorConfig {
            stuck_threshold: Duration::from_secs(0),
            ..MonitorConfig::default()
        });
        let wf = Workflow::new(
            ProjectId::new("p1"),
            UserId::new("u1"),
            WorkflowConfig::default(),
        );
        let id = wf.id;
        registry.insert(wf).expect("insert");
        registry
            .mark_stage_started(id, crate::workflow::Stage::Ocr)
            .expect("start");

        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.sweep().await;
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Warning);
        assert_eq!(alerts[0].workflow_id, Some(id));

        // Second detection upgrades the same alert instead of duplicating
        monitor.sweep().await;
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Error);
    }

    #[tokio::test]
    async fn test_alert_raise_is_idempotent_per_key() {
        let (monitor, _registry) = monitor(MonitorConfig::default());
        let first = monitor.raise(Alert::new(AlertType::Warning, "one"), "k");
        let second = monitor.raise(Alert::new(AlertType::Warning, "two"), "k");
        assert_eq!(first, second);
        assert_eq!(monitor.alerts().len(), 1);
        assert_eq!(monitor.alerts()[0].message, "two");

        // A resolved alert no longer absorbs new raises
        assert!(monitor.resolve(first));
        let third = monitor.raise(Alert::new(AlertType::Warning, "three"), "k");
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_health_reflects_error_alerts() {
        let (monitor, _registry) = monitor(MonitorConfig::default());
        assert_eq!(monitor.check_health().await.status, HealthStatus::Healthy);

        monitor.raise(Alert::new(AlertType::Error, "bad"), "k");
        assert_eq!(monitor.check_health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_cleanup_drops_old_resolved_alerts() {
        let (monitor, _registry) = monitor(MonitorConfig {
            retention: Duration::from_secs(0),
            ..MonitorConfig::default()
        });
        let id = monitor.raise(Alert::new(AlertType::Info, "done"), "k");
        monitor.resolve(id);
        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.cleanup_alerts();
        assert!(monitor.alerts().is_empty());
    }
}
