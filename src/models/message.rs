//! Inbound message records and their one-way status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status for an inbound message. Transitions are one-way.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Awaiting operator decision in the approval queue.
    Pending,
    /// Operator accepted the proposed response; send in progress.
    Approved,
    /// Operator rejected the proposed response.
    Rejected,
    /// Response delivered to the provider.
    Sent,
    /// Listener decided not to act (permissions or classification).
    Skipped,
}

impl MessageStatus {
    /// Whether the status may move to `next`.
    ///
    /// `Pending` fans out to operator decisions; `Approved` completes to
    /// `Sent`. Everything else is terminal.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved | Self::Rejected | Self::Skipped)
                | (Self::Approved, Self::Sent)
        )
    }

    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Sent => "sent",
            Self::Skipped => "skipped",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "sent" => Some(Self::Sent),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// An inbound provider message captured by the listener.
///
/// The identifying fields are immutable once created; only `status` and
/// `processed_at` change, and only forward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PendingMessage {
    /// `channel_id|timestamp`: unique within the store.
    pub id: String,
    /// Conversation the message arrived in.
    pub channel_id: String,
    /// Resolved channel name at capture time.
    pub channel_name: String,
    /// Author's provider user ID.
    pub user_id: String,
    /// Author's resolved display name.
    pub user_name: String,
    /// Message body.
    pub text: String,
    /// Parent thread timestamp when the message is a reply.
    pub thread_parent: Option<String>,
    /// The bot was mentioned directly.
    pub is_mention: bool,
    /// The message arrived in a direct-message conversation.
    pub is_dm: bool,
    /// Configured keywords found in the body.
    pub matched_keywords: Vec<String>,
    /// Provider timestamp (opaque, lexicographically ordered).
    pub timestamp: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Raw provider payload, JSON-encoded.
    pub raw_payload: String,
    /// Current lifecycle status.
    pub status: MessageStatus,
    /// Set when the record reaches a terminal status.
    pub processed_at: Option<DateTime<Utc>>,
}

impl PendingMessage {
    /// Compose the store key from its parts.
    #[must_use]
    pub fn make_id(channel_id: &str, timestamp: &str) -> String {
        format!("{channel_id}|{timestamp}")
    }
}

/// Queue-side mirror of a [`PendingMessage`] plus the generated response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalRecord {
    /// Underlying captured message.
    pub message: PendingMessage,
    /// Proposed outbound response text.
    pub response: String,
    /// Classifier verdict recorded for the operator.
    pub classification: String,
    /// Short free-form intent label from the response generator.
    pub intent: String,
}
