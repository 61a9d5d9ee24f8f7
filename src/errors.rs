//! Error types shared across the daemon fleet.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure. Fatal at startup.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Service-bus transport or dispatch failure.
    Bus(String),
    /// Messaging provider (Slack) call failure.
    Provider(String),
    /// Provider signalled a rate limit; carries the retry-after in seconds.
    RateLimited(u64),
    /// Calendar provider call failure.
    Calendar(String),
    /// Browser collaborator or media-device failure.
    Media(String),
    /// Another instance already holds the daemon lock; carries its PID.
    AlreadyRunning(u32),
    /// Requested entity does not exist.
    NotFound(String),
    /// A state machine was asked to make a disallowed transition.
    InvalidTransition(String),
    /// An operation exceeded its deadline.
    Timeout(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Bus(msg) => write!(f, "bus: {msg}"),
            Self::Provider(msg) => write!(f, "provider: {msg}"),
            Self::RateLimited(secs) => write!(f, "rate limited, retry after {secs}s"),
            Self::Calendar(msg) => write!(f, "calendar: {msg}"),
            Self::Media(msg) => write!(f, "media: {msg}"),
            Self::AlreadyRunning(pid) => write!(f, "another instance is running (pid {pid})"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Timeout(msg) => write!(f, "timed out: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
