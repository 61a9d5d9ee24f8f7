//! Messaging provider capability surface.
//!
//! The wire client (HTTP, token refresh, per-endpoint pagination) lives
//! outside this crate; the daemon consumes only this trait. Rate limits
//! surface as [`AppError::RateLimited`] carrying the reported
//! retry-after. List calls paginate by cursor so callers can consume
//! pages lazily.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::message::PendingMessage;
use crate::Result;

/// One inbound message as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderMessage {
    /// Provider timestamp, lexicographically ordered within a channel.
    pub ts: String,
    /// Author user ID; empty for system messages.
    pub user_id: String,
    /// Message body.
    pub text: String,
    /// Thread parent timestamp for replies.
    pub thread_ts: Option<String>,
    /// Message was authored by a bot integration.
    pub is_bot: bool,
    /// Raw payload for auditing.
    pub raw: Value,
}

/// Conversation metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderChannel {
    /// Conversation ID.
    pub id: String,
    /// Conversation name; empty for DMs.
    pub name: String,
    /// Purpose text.
    pub purpose: String,
    /// Topic text.
    pub topic: String,
    /// Member count, when reported.
    pub member_count: i64,
}

/// Workspace user record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderUser {
    /// User ID.
    pub id: String,
    /// Login name.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Real name.
    pub real_name: String,
    /// Work email.
    pub email: String,
    /// Avatar URL; empty when none.
    pub avatar_url: String,
    /// Bot integrations are excluded from caches.
    pub is_bot: bool,
    /// Deactivated accounts are excluded from caches.
    pub deleted: bool,
}

/// User group record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderGroup {
    /// Group ID.
    pub id: String,
    /// Mention handle.
    pub handle: String,
    /// Display name.
    pub name: String,
    /// Ordered member user IDs.
    pub members: Vec<String>,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in this page.
    pub items: Vec<T>,
    /// Cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// Capability set the daemon consumes from the messaging provider.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Conversations visible in the user's sidebar, one page at a time.
    async fn list_channels(
        &self,
        cursor: Option<String>,
        limit: u32,
    ) -> Result<Page<ProviderChannel>>;

    /// Metadata for one conversation.
    async fn channel_info(&self, channel_id: &str) -> Result<Option<ProviderChannel>>;

    /// Messages in a conversation strictly after `oldest`, ascending by
    /// timestamp, at most `limit`.
    async fn channel_history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ProviderMessage>>;

    /// Member user IDs of a conversation, up to `count`.
    async fn channel_members(&self, channel_id: &str, count: u32) -> Result<Vec<String>>;

    /// One user record.
    async fn get_user(&self, user_id: &str) -> Result<Option<ProviderUser>>;

    /// Workspace users, one page at a time.
    async fn get_users(&self, cursor: Option<String>, limit: u32) -> Result<Page<ProviderUser>>;

    /// Replies under a thread parent, ascending, at most `limit`.
    async fn thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        limit: u32,
    ) -> Result<Vec<ProviderMessage>>;

    /// All user groups.
    async fn user_groups(&self) -> Result<Vec<ProviderGroup>>;

    /// Deliver a message; returns the assigned timestamp.
    async fn send_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_parent: Option<&str>,
    ) -> Result<String>;
}

/// A generated outbound response with a short intent label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GeneratedResponse {
    /// Response body to send.
    pub text: String,
    /// Free-form intent label shown to the reviewer.
    pub intent: String,
}

/// External response-generation collaborator.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Propose a response for an inbound message.
    async fn generate(&self, message: &PendingMessage) -> Result<GeneratedResponse>;
}

/// Provider stand-in used when no wire client is configured.
///
/// Listings are empty and sends fail, so a daemon without credentials
/// idles cleanly instead of erroring every tick.
pub struct OfflineProvider;

#[async_trait]
impl MessagingProvider for OfflineProvider {
    async fn list_channels(
        &self,
        _cursor: Option<String>,
        _limit: u32,
    ) -> Result<Page<ProviderChannel>> {
        Ok(Page {
            items: Vec::new(),
            next_cursor: None,
        })
    }

    async fn channel_info(&self, _channel_id: &str) -> Result<Option<ProviderChannel>> {
        Ok(None)
    }

    async fn channel_history(
        &self,
        _channel_id: &str,
        _oldest: Option<&str>,
        _limit: u32,
    ) -> Result<Vec<ProviderMessage>> {
        Ok(Vec::new())
    }

    async fn channel_members(&self, _channel_id: &str, _count: u32) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn get_user(&self, _user_id: &str) -> Result<Option<ProviderUser>> {
        Ok(None)
    }

    async fn get_users(&self, _cursor: Option<String>, _limit: u32) -> Result<Page<ProviderUser>> {
        Ok(Page {
            items: Vec::new(),
            next_cursor: None,
        })
    }

    async fn thread_replies(
        &self,
        _channel_id: &str,
        _thread_ts: &str,
        _limit: u32,
    ) -> Result<Vec<ProviderMessage>> {
        Ok(Vec::new())
    }

    async fn user_groups(&self) -> Result<Vec<ProviderGroup>> {
        Ok(Vec::new())
    }

    async fn send_message(
        &self,
        _channel_id: &str,
        _text: &str,
        _thread_parent: Option<&str>,
    ) -> Result<String> {
        Err(crate::AppError::Provider(
            "messaging provider not configured".into(),
        ))
    }
}

/// Fallback generator used when no external responder is wired in:
/// produces an acknowledgement that always goes through review.
pub struct TemplateResponder;

#[async_trait]
impl ResponseGenerator for TemplateResponder {
    async fn generate(&self, message: &PendingMessage) -> Result<GeneratedResponse> {
        let text = format!(
            "Thanks <@{}>, I saw your message and will follow up shortly.",
            message.user_id
        );
        Ok(GeneratedResponse {
            text,
            intent: "acknowledge".to_owned(),
        })
    }
}
