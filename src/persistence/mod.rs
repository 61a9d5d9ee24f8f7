//! Embedded `SQLite` persistence: watermarks, pending messages,
//! discovery caches, transcripts, and retention.
//!
//! One store file per daemon; a store is never shared across daemon
//! processes: cross-daemon access goes through the bus.

pub mod caches;
pub mod db;
pub mod meetings;
pub mod notified;
pub mod pending;
pub mod resolve;
pub mod retention;
pub mod schema;
pub mod watermarks;
