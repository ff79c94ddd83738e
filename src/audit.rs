//! Audit collaborator.
//!
//! Bans, releases and escalation denials are reported as [`AuditEvent`]s.
//! The gate never awaits a sink directly: events go through
//! [`NonBlockingAudit`], which queues them for a background worker and drops
//! them (counted) when the queue is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::info;

/// Actor recorded for decisions taken by the gate itself.
pub const SYSTEM_ACTOR: &str = "system";

/// One audited change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Who made the change (`system` or an administrator id).
    pub actor_id: String,
    /// What happened, e.g. `ip_banned`, `ip_unbanned`, `ip_auto_released`.
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_values: Option<JsonValue>,
    /// Free-form request context (endpoint, release reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_context: Option<String>,
    pub at_millis: u64,
}

/// Failure reported by an [`AuditSink`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("audit sink: {0}")]
pub struct AuditError(pub String);

/// Audit sink interface.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Audit sink that logs via tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "portcullis::audit",
            actor = %event.actor_id,
            action = %event.action,
            entity = %event.entity_id,
            context = event.client_context.as_deref().unwrap_or(""),
            "audit"
        );
        Ok(())
    }
}

/// In-memory audit sink (tests/diagnostics).
#[derive(Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, oldest first.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    /// Recorded events with the given action.
    pub async fn actions(&self, action: &str) -> Vec<AuditEvent> {
        self.events.lock().await.iter().filter(|e| e.action == action).cloned().collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

enum Message {
    Event(AuditEvent),
    Barrier(oneshot::Sender<()>),
}

/// Offloads audit emission to a bounded channel and worker task.
#[derive(Clone)]
pub struct NonBlockingAudit {
    tx: mpsc::Sender<Message>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for NonBlockingAudit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingAudit").field("dropped", &self.dropped()).finish()
    }
}

impl NonBlockingAudit {
    /// Spawn the worker on the current tokio runtime.
    pub fn with_capacity(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Event(event) => {
                        if let Err(err) = sink.record(event).await {
                            tracing::warn!(target: "portcullis::audit", error = %err, "audit sink failed");
                        }
                    }
                    Message::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Queue an event without waiting.
    pub fn emit(&self, event: AuditEvent) {
        if self.tx.try_send(Message::Event(event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until every event queued before this call reached the sink.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Message::Barrier(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// How many events were dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
