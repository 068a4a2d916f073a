//! Implementation of `reflex notify` subcommands.

use anyhow::Result;

use reflex_core::core::notifications::log_delivery;
use reflex_core::core::ReflexServices;

use crate::output::{Formatter, OutputFormat};

/// List pending notification jobs, oldest first.
pub fn run_notify_pending(services: &ReflexServices, limit: usize, format: OutputFormat) -> Result<()> {
    let jobs = services.notifications().pending(limit)?;
    Formatter::new(format).print_list(&jobs, "No pending notifications.", "jobs")
}

/// Deliver pending notifications as log records.
#[tracing::instrument(skip(services, format))]
pub fn run_notify_drain(services: &ReflexServices, limit: usize, format: OutputFormat) -> Result<()> {
    let report = services.notifications().drain(limit, log_delivery)?;
    Formatter::new(format).print(&report)
}
