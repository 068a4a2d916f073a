//! reflex-core: domain logic for the reflex error tracker.
//!
//! This crate owns payload normalization, backtrace parsing, fingerprinting,
//! SQLite storage of groups and events, the query and signal layer, and the
//! service facade the CLI drives.

pub mod backtrace;
pub mod config;
pub mod core;
pub mod fingerprint;
pub mod ids;
pub mod notify;
pub mod payload;
pub mod store;
