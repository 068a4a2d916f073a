//! Implementation of `reflex stats` and `reflex analytics`.

use anyhow::Result;
use chrono::Duration;

use reflex_core::core::ReflexServices;
use reflex_core::store::{Project, DEFAULT_SINCE};

use crate::cli::commands::helpers::period_start;
use crate::output::{Formatter, OutputFormat};

/// Default analytics period.
const DEFAULT_ANALYTICS_PERIOD: Duration = Duration::days(7);

/// Print group counts, event totals, and the top unresolved errors.
pub fn run_stats(
    services: &ReflexServices,
    project: &Project,
    since: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let start = period_start(since, DEFAULT_SINCE)?;
    let stats = services.groups().stats(&project.id, start)?;

    let formatter = Formatter::new(format);
    match format {
        OutputFormat::Json => formatter.print(&stats),
        OutputFormat::Text => {
            let groups = &stats.groups;
            println!(
                "groups:{}  unresolved:{}  resolved:{}  ignored:{}  muted:{}",
                groups.total, groups.unresolved, groups.resolved, groups.ignored, groups.muted
            );
            println!(
                "events:{}  in_period:{}",
                stats.total_events, stats.events_in_period
            );
            if !stats.by_environment.is_empty() {
                formatter.print(&stats.by_environment)?;
            }
            formatter.print_list(&stats.top_errors, "No unresolved errors.", "top_errors")
        }
    }
}

/// Print the analytics breakdowns for the period.
pub fn run_analytics(
    services: &ReflexServices,
    project: &Project,
    since: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let start = period_start(since, DEFAULT_ANALYTICS_PERIOD)?;
    let analytics = services.groups().analytics(&project.id, start)?;
    Formatter::new(format).print(&analytics)
}
