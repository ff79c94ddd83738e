//! Fire-and-forget durable writes.
//!
//! Callers enqueue a [`WriteOp`] with `try_send` and return immediately. One
//! worker task drains the bounded queue in order, applying each write with a
//! bounded [`WriteRetry`]. A full queue drops the write and bumps a counter;
//! a write that exhausts its retries is dropped with a warning. Neither case
//! reaches the request path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::StoreError;
use crate::model::{Ban, LoginAttemptRecord, RequestOutcome};
use crate::retry::WriteRetry;
use crate::store::DurableStore;

/// A queued durable write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Window { client_id: String, endpoint: String, window_start: u64, outcome: RequestOutcome },
    LoginAttempt(LoginAttemptRecord),
    UpsertBan(Ban),
    ReleaseBan { ip_address: String, at: u64, released_by: String, automatic: bool },
}

impl WriteOp {
    fn kind(&self) -> &'static str {
        match self {
            WriteOp::Window { .. } => "window",
            WriteOp::LoginAttempt(_) => "login_attempt",
            WriteOp::UpsertBan(_) => "upsert_ban",
            WriteOp::ReleaseBan { .. } => "release_ban",
        }
    }

    async fn apply(&self, store: &dyn DurableStore) -> Result<(), StoreError> {
        match self {
            WriteOp::Window { client_id, endpoint, window_start, outcome } => {
                store.increment_window(client_id, endpoint, *window_start, *outcome).await
            }
            WriteOp::LoginAttempt(record) => store.append_login_attempt(record.clone()).await,
            WriteOp::UpsertBan(ban) => store.upsert_ban(ban).await,
            WriteOp::ReleaseBan { ip_address, at, released_by, automatic } => {
                store.release_ban(ip_address, *at, released_by, *automatic).await.map(|_| ())
            }
        }
    }
}

enum Message {
    Write(WriteOp),
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    dropped_full: AtomicU64,
    failed: AtomicU64,
    applied: AtomicU64,
}

/// Counts of what the dispatcher has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Applied successfully (possibly after retries).
    pub applied: u64,
    /// Rejected because the queue was full.
    pub dropped: u64,
    /// Dropped after exhausting retries or on a permanent error.
    pub failed: u64,
}

/// Handle to the write queue. Clones share the queue and counters.
#[derive(Debug, Clone)]
pub struct WriteDispatcher {
    tx: mpsc::Sender<Message>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Write(op) => f.debug_tuple("Write").field(op).finish(),
            Message::Barrier(_) => f.write_str("Barrier"),
        }
    }
}

impl WriteDispatcher {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// The worker exits once every handle is dropped and the queue drains.
    pub fn spawn(store: Arc<dyn DurableStore>, retry: WriteRetry, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    Message::Write(op) => {
                        match retry.execute(|| op.apply(store.as_ref())).await {
                            Ok(()) => {
                                worker_counters.applied.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(
                                    target: "portcullis::window",
                                    kind = op.kind(),
                                    error = %err,
                                    "dropping durable write"
                                );
                            }
                        }
                    }
                    Message::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, counters }
    }

    /// Enqueue without waiting. Returns `false` if the write was dropped.
    pub fn submit(&self, op: WriteOp) -> bool {
        let kind = op.kind();
        match self.tx.try_send(Message::Write(op)) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.counters.dropped_full.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    target: "portcullis::window",
                    kind,
                    dropped,
                    "write queue full, dropping durable write"
                );
                false
            }
        }
    }

    /// Wait until every write submitted before this call has been applied or dropped.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Message::Barrier(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            dropped: self.counters.dropped_full.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
