//! Scheduled meetings, sessions, and the per-meeting state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-meeting state machine status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    /// Known from the calendar; awaiting approval.
    Scheduled,
    /// Approved for attendance; waiting for the pre-roll window.
    Approved,
    /// Operator opted out; terminal.
    Skipped,
    /// Join attempt in flight.
    Joining,
    /// The bot is in the meeting.
    Active,
    /// The meeting ended or the bot left; terminal.
    Completed,
    /// Join attempts exhausted or an unrecoverable failure; terminal.
    Error,
}

impl MeetingStatus {
    /// Terminal states are never updated by calendar polls or ticks.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Completed | Self::Error)
    }

    /// Whether the status may move to `next`.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Approved | Self::Skipped)
                | (Self::Approved, Self::Scheduled | Self::Joining | Self::Skipped)
                | (Self::Joining, Self::Active | Self::Error | Self::Completed)
                | (Self::Active, Self::Completed | Self::Error)
        )
    }

    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Approved => "approved",
            Self::Skipped => "skipped",
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// A meeting projected from a watched calendar (or joined ad hoc).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScheduledMeeting {
    /// Calendar event ID, or a generated ID for ad-hoc joins.
    pub event_id: String,
    /// Event title.
    pub title: String,
    /// Conference URL; validated against the provider pattern at ingest.
    pub meet_url: String,
    /// Scheduled start.
    pub scheduled_start: DateTime<Utc>,
    /// Scheduled end; `None` for ad-hoc joins with no known end.
    pub scheduled_end: Option<DateTime<Utc>>,
    /// Organizer email or name.
    pub organizer: String,
    /// Source calendar ID; empty for ad-hoc joins.
    pub calendar_id: String,
    /// Source calendar display name.
    pub calendar_name: String,
    /// State machine position.
    pub status: MeetingStatus,
    /// Attendance mode (for example `notes` or `active`).
    pub bot_mode: String,
    /// Whether the rendered video persona is requested.
    pub video_enabled: bool,
    /// Who approved the meeting, when approved manually.
    pub approved_by: Option<String>,
    /// Populated on transition to `Error`.
    pub error: Option<String>,
    /// Actual end time, set on completion.
    pub actual_end: Option<DateTime<Utc>>,
}

/// One appended caption line from an active meeting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptEntry {
    /// Owning meeting event ID.
    pub meeting_id: String,
    /// Speaker name as reported by the browser collaborator.
    pub speaker: String,
    /// Caption text.
    pub text: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
}
