#![forbid(unsafe_code)]

//! `botfleet`: a fleet of long-running user-session automation
//! daemons sharing one lifecycle harness and a host-local service bus.
//!
//! Each daemon owns a well-known bus name, persistent state, and a
//! published state file. The slack daemon watches conversations and
//! gates responses behind an approval queue; the meet daemon projects
//! meetings from calendars and drives the per-meeting state machine.

pub mod bus;
pub mod config;
pub mod config_watcher;
pub mod errors;
pub mod harness;
pub mod meet;
pub mod models;
pub mod persistence;
pub mod slack;

pub use errors::{AppError, Result};
