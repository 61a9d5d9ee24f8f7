//! Author classification and channel permission gates.
//!
//! Classifier plus channel mode form a small decision table evaluated
//! as a pure function per message: auto-reply, queue for approval, or
//! ignore.

use crate::config::{ChannelMode, ChannelPermissionConfig, ClassifierConfig};
use crate::models::cache::CachedUser;

/// Author trust classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// On a safe list; eligible for auto-response.
    Safe,
    /// Explicitly flagged; always reviewed.
    Concerned,
    /// Not on any list.
    Unknown,
}

impl Classification {
    /// Label recorded on approval records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Concerned => "concerned",
            Self::Unknown => "unknown",
        }
    }
}

/// What the listener does with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Generate and send a response without review.
    AutoReply,
    /// Queue the proposed response for approval.
    Queue,
    /// Take no action.
    Ignore,
}

/// Config-driven author classifier.
#[derive(Debug, Clone)]
pub struct UserClassifier {
    config: ClassifierConfig,
}

impl UserClassifier {
    /// Build from the classifier section of the config.
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify an author. Concerned listings win over safe listings.
    #[must_use]
    pub fn classify(&self, user: &CachedUser) -> Classification {
        if self.config.concerned_user_ids.iter().any(|id| id == &user.user_id) {
            return Classification::Concerned;
        }

        if self.config.safe_user_ids.iter().any(|id| id == &user.user_id) {
            return Classification::Safe;
        }
        if !user.user_name.is_empty()
            && self
                .config
                .safe_handles
                .iter()
                .any(|h| h.eq_ignore_ascii_case(&user.user_name))
        {
            return Classification::Safe;
        }
        if let Some(domain) = user.email.rsplit('@').next().filter(|_| user.email.contains('@')) {
            if self
                .config
                .safe_email_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
            {
                return Classification::Safe;
            }
        }

        Classification::Unknown
    }
}

/// Channel allow/deny gate.
#[derive(Debug, Clone)]
pub struct ChannelPermissions {
    config: ChannelPermissionConfig,
}

impl ChannelPermissions {
    /// Build from the channel permission section of the config.
    #[must_use]
    pub fn new(config: ChannelPermissionConfig) -> Self {
        Self { config }
    }

    /// Effective mode for a channel. Deny wins over any mode entry.
    #[must_use]
    pub fn mode_for(&self, channel_id: &str) -> ChannelMode {
        if self.config.deny.iter().any(|id| id == channel_id) {
            return ChannelMode::Ignore;
        }
        self.config
            .modes
            .get(channel_id)
            .copied()
            .unwrap_or(self.config.default_mode)
    }
}

/// The decision table over `(classification, channel mode)`.
///
/// Auto-response requires both a `safe` author and an `auto` channel;
/// `ignore` channels swallow everything; everything else is reviewed.
#[must_use]
pub fn decide(classification: Classification, mode: ChannelMode) -> Decision {
    match (mode, classification) {
        (ChannelMode::Ignore, _) => Decision::Ignore,
        (ChannelMode::Auto, Classification::Safe) => Decision::AutoReply,
        (ChannelMode::Auto | ChannelMode::Approve, _) => Decision::Queue,
    }
}
