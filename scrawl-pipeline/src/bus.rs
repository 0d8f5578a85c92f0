//! Progress bus
//!
//! Topic-based fan-out of workflow events. Each subscriber owns a bounded
//! buffer; when it fills, the oldest event is dropped so publishers never
//! block. Per-workflow publish order is preserved within each subscriber.
//! Late subscribers get the last event for their workflow as a snapshot.

use crate::error::ErrorInfo;
use crate::workflow::{Stage, WorkflowId, WorkflowStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use scrawl_connectors::{ProjectId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Subscription topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Workflow(WorkflowId),
    Project(ProjectId),
    User(UserId),
}

/// Event discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    StageStarted,
    Progress,
    StageCompleted,
    StatusChanged,
    Error,
    Rollback,
}

/// One workflow event, in the wire shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub workflow_id: WorkflowId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub event: EventType,
    pub stage: Stage,
    pub progress: u8,
    pub status: WorkflowStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

struct SubscriberInner {
    topic: Topic,
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Live event stream handle
///
/// Dropping the subscription detaches it from the bus.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
    snapshot: Option<Event>,
}

impl Subscription {
    /// The last event published for the topic before this subscription
    pub fn snapshot(&self) -> Option<&Event> {
        self.snapshot.as_ref()
    }

    /// Events dropped because this subscriber was slow
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Pop one event without waiting
    pub fn try_recv(&self) -> Option<Event> {
        self.inner.buffer.lock().pop_front()
    }

    /// Wait for the next event
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Topic fan-out with bounded per-subscriber buffers
pub struct ProgressBus {
    subscribers: RwLock<Vec<Arc<SubscriberInner>>>,
    last_events: RwLock<HashMap<WorkflowId, Event>>,
    capacity: usize,
}

impl ProgressBus {
    /// Create a bus with the given per-subscriber buffer capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            last_events: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a topic, with the last matching event as snapshot
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let snapshot = match &topic {
            Topic::Workflow(id) => self.last_events.read().get(id).cloned(),
            Topic::Project(project_id) => self
                .last_events
                .read()
                .values()
                .filter(|e| e.project_id == *project_id)
                .max_by_key(|e| e.timestamp)
                .cloned(),
            Topic::User(user_id) => self
                .last_events
                .read()
                .values()
                .filter(|e| e.user_id == *user_id)
                .max_by_key(|e| e.timestamp)
                .cloned(),
        };
        let inner = Arc::new(SubscriberInner {
            topic,
            buffer: Mutex::new(VecDeque::with_capacity(self.capacity)),
            capacity: self.capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.write().push(inner.clone());
        Subscription { inner, snapshot }
    }

    fn matches(topic: &Topic, event: &Event) -> bool {
        match topic {
            Topic::Workflow(id) => event.workflow_id == *id,
            Topic::Project(project_id) => event.project_id == *project_id,
            Topic::User(user_id) => event.user_id == *user_id,
        }
    }

    /// Publish an event to every matching subscriber
    ///
    /// Never blocks and never awaits: a full subscriber loses its oldest
    /// buffered event instead of slowing the producer down.
    pub fn publish(&self, event: Event) {
        self.last_events
            .write()
            .insert(event.workflow_id, event.clone());

        let mut pruned = false;
        {
            let subscribers = self.subscribers.read();
            for sub in subscribers.iter() {
                if sub.closed.load(Ordering::Acquire) {
                    pruned = true;
                    continue;
                }
                if !Self::matches(&sub.topic, &event) {
                    continue;
                }
                let mut buffer = sub.buffer.lock();
                if buffer.len() >= sub.capacity {
                    buffer.pop_front();
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                }
                buffer.push_back(event.clone());
                drop(buffer);
                sub.notify.notify_one();
            }
        }
        if pruned {
            self.subscribers
                .write()
                .retain(|s| !s.closed.load(Ordering::Acquire));
        }
    }

    /// Drop retained last-events for a workflow (registry cleanup hook)
    pub fn forget_workflow(&self, workflow_id: WorkflowId) {
        self.last_events.write().remove(&workflow_id);
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
