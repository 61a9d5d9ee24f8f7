//! Calendar provider capability surface and conference-URL validation.

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One calendar as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProviderCalendar {
    /// Provider calendar ID.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// One event in a calendar's window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CalendarEvent {
    /// Provider event ID, stable across updates.
    pub id: String,
    /// Event title.
    pub title: String,
    /// Organizer email or name.
    pub organizer: String,
    /// Scheduled start.
    pub start: DateTime<Utc>,
    /// Scheduled end, when the event has one.
    pub end: Option<DateTime<Utc>>,
    /// Conference URL, when the event carries one.
    pub conference_url: Option<String>,
}

/// Capability set the scheduler consumes from the calendar provider.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Calendars visible to the user.
    async fn list_calendars(&self) -> Result<Vec<ProviderCalendar>>;

    /// Events in `[time_min, time_max]` for one calendar.
    async fn list_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>>;
}

/// Provider stand-in used when no wire client is configured.
pub struct OfflineCalendar;

#[async_trait]
impl CalendarProvider for OfflineCalendar {
    async fn list_calendars(&self) -> Result<Vec<ProviderCalendar>> {
        Ok(Vec::new())
    }

    async fn list_events(
        &self,
        _calendar_id: &str,
        _time_min: DateTime<Utc>,
        _time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>> {
        Ok(Vec::new())
    }
}

static MEET_URL: OnceLock<Regex> = OnceLock::new();

fn meet_url_pattern() -> &'static Regex {
    MEET_URL.get_or_init(|| {
        #[allow(clippy::expect_used)] // Pattern is a compile-time constant.
        Regex::new(r"https://meet\.google\.com/[a-z]{3}-[a-z]{4}-[a-z]{3}(\?[\w=&-]*)?")
            .expect("valid meet url pattern")
    })
}

/// Extract and normalize the conference URL if it matches the accepted
/// provider pattern; events without a match are rejected at ingest.
#[must_use]
pub fn parse_meet_url(raw: &str) -> Option<String> {
    meet_url_pattern()
        .find(raw)
        .map(|m| m.as_str().split('?').next().unwrap_or(m.as_str()).to_owned())
}
