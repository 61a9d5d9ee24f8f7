//! Bounded pending-review queue gating outbound responses.
//!
//! Inbound messages become the queue's property the moment they are
//! enqueued. The pending set is bounded (oldest evicted first with a
//! warning); processed records move to a bounded history ring. Every
//! transition emits `MessageProcessed(id, status)` on the bus; enqueue
//! emits `PendingApproval(record)`.
//!
//! The outbound provider send happens outside the queue lock. A failed
//! send leaves the record pending, so a later approve may retry.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::bus::SignalHub;
use crate::models::message::{ApprovalRecord, MessageStatus};
use crate::persistence::pending::PendingRepo;
use crate::slack::provider::MessagingProvider;
use crate::{AppError, Result};

/// Outcome of one item inside [`ApprovalQueue::approve_all`].
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ApproveOutcome {
    /// Record identifier.
    pub id: String,
    /// Whether the send went through.
    pub sent: bool,
    /// Failure detail when `sent` is false.
    pub error: Option<String>,
}

struct QueueInner {
    pending: VecDeque<ApprovalRecord>,
    history: VecDeque<ApprovalRecord>,
    evictions: u64,
}

/// The approval queue. One per slack daemon.
pub struct ApprovalQueue {
    inner: Mutex<QueueInner>,
    max_pending: usize,
    history_size: usize,
    repo: PendingRepo,
    provider: Arc<dyn MessagingProvider>,
    hub: SignalHub,
}

impl ApprovalQueue {
    /// Build a queue with the given bounds.
    #[must_use]
    pub fn new(
        max_pending: usize,
        history_size: usize,
        repo: PendingRepo,
        provider: Arc<dyn MessagingProvider>,
        hub: SignalHub,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                history: VecDeque::new(),
                evictions: 0,
            }),
            max_pending,
            history_size,
            repo,
            provider,
            hub,
        }
    }

    /// Insert a record at the tail, evicting the oldest past the bound.
    pub async fn enqueue(&self, record: ApprovalRecord) {
        let payload = serde_json::to_value(&record).unwrap_or(Value::Null);
        {
            let mut inner = self.inner.lock().await;
            inner.pending.push_back(record);
            while inner.pending.len() > self.max_pending {
                if let Some(evicted) = inner.pending.pop_front() {
                    inner.evictions += 1;
                    warn!(
                        id = %evicted.message.id,
                        evictions = inner.evictions,
                        "approval queue full; oldest record evicted"
                    );
                }
            }
        }
        self.hub.emit("PendingApproval", payload);
    }

    /// Snapshot of the pending records, oldest first.
    pub async fn get_pending(&self) -> Vec<ApprovalRecord> {
        self.inner.lock().await.pending.iter().cloned().collect()
    }

    /// Pending count.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Evictions since start.
    pub async fn eviction_count(&self) -> u64 {
        self.inner.lock().await.evictions
    }

    /// Approve one record: send its response, then mark it sent.
    ///
    /// Returns the record with its updated status. On send failure the
    /// record remains pending and the stored status is untouched, so
    /// the call may be retried.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown IDs and
    /// `AppError::Provider` when the outbound send fails.
    pub async fn approve(&self, id: &str) -> Result<ApprovalRecord> {
        let record = {
            let inner = self.inner.lock().await;
            inner
                .pending
                .iter()
                .find(|r| r.message.id == id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("approval {id}")))?
        };

        // Provider call outside the lock.
        self.provider
            .send_message(
                &record.message.channel_id,
                &record.response,
                record.message.thread_parent.as_deref(),
            )
            .await?;

        self.repo.transition(id, MessageStatus::Approved).await?;
        let updated = self.repo.transition(id, MessageStatus::Sent).await?;

        let mut record = record;
        record.message.status = updated.status;
        record.message.processed_at = updated.processed_at;
        self.retire(id, record.clone()).await;

        self.hub
            .emit("MessageProcessed", json!({"id": id, "status": "sent"}));
        info!(id, "approval sent");
        Ok(record)
    }

    /// Reject one record without sending anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown IDs.
    pub async fn reject(&self, id: &str) -> Result<ApprovalRecord> {
        let record = {
            let inner = self.inner.lock().await;
            inner
                .pending
                .iter()
                .find(|r| r.message.id == id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("approval {id}")))?
        };

        let updated = self.repo.transition(id, MessageStatus::Rejected).await?;

        let mut record = record;
        record.message.status = updated.status;
        record.message.processed_at = updated.processed_at;
        self.retire(id, record.clone()).await;

        self.hub
            .emit("MessageProcessed", json!({"id": id, "status": "rejected"}));
        info!(id, "approval rejected");
        Ok(record)
    }

    /// Approve every pending record, reporting per-item outcomes.
    ///
    /// Partial failure is expected: failed items stay pending.
    pub async fn approve_all(&self) -> Vec<ApproveOutcome> {
        let ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.pending.iter().map(|r| r.message.id.clone()).collect()
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = match self.approve(&id).await {
                Ok(_) => ApproveOutcome {
                    id,
                    sent: true,
                    error: None,
                },
                Err(err) => ApproveOutcome {
                    id,
                    sent: false,
                    error: Some(err.to_string()),
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Recent processed records, newest first, optionally filtered.
    pub async fn get_history(
        &self,
        limit: usize,
        channel_id: Option<&str>,
        user_id: Option<&str>,
        status: Option<MessageStatus>,
    ) -> Vec<ApprovalRecord> {
        let inner = self.inner.lock().await;
        inner
            .history
            .iter()
            .rev()
            .filter(|r| channel_id.is_none_or(|c| r.message.channel_id == c))
            .filter(|r| user_id.is_none_or(|u| r.message.user_id == u))
            .filter(|r| status.is_none_or(|s| r.message.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    async fn retire(&self, id: &str, record: ApprovalRecord) {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|r| r.message.id != id);
        inner.history.push_back(record);
        while inner.history.len() > self.history_size {
            inner.history.pop_front();
        }
    }
}
