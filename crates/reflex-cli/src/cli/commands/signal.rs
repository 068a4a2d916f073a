//! Implementation of `reflex signal` subcommands.

use anyhow::Result;

use reflex_core::core::ReflexServices;
use reflex_core::store::{Aggregation, Project, SignalFilter};

use crate::cli::SignalArgs;
use crate::output::{Formatter, OutputFormat};

fn signal_filter(args: &SignalArgs) -> SignalFilter {
    SignalFilter {
        environment: args.environment.clone(),
        status: args.status,
    }
}

/// Count or per-minute rate of matching events.
pub fn run_signal_rate(
    services: &ReflexServices,
    project: &Project,
    target: &SignalArgs,
    window: Option<&str>,
    aggregation: Aggregation,
    format: OutputFormat,
) -> Result<()> {
    let reading = services.signals().rate(
        &project.id,
        target.error_type.as_deref(),
        window,
        &signal_filter(target),
        aggregation,
    )?;
    Formatter::new(format).print(&reading)
}

/// Hourly baseline of matching events.
pub fn run_signal_baseline(
    services: &ReflexServices,
    project: &Project,
    target: &SignalArgs,
    window: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let baseline = services.signals().baseline(
        &project.id,
        target.error_type.as_deref(),
        window,
        &signal_filter(target),
    )?;
    Formatter::new(format).print(&baseline)
}

/// Most recent matching event.
pub fn run_signal_last(
    services: &ReflexServices,
    project: &Project,
    target: &SignalArgs,
    format: OutputFormat,
) -> Result<()> {
    let last = services.signals().last(
        &project.id,
        target.error_type.as_deref(),
        &signal_filter(target),
    )?;
    Formatter::new(format).print(&last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflex_core::store::GroupStatus;

    #[test]
    fn test_signal_filter_from_args() {
        let args = SignalArgs {
            error_type: Some("Timeout".to_string()),
            environment: Some("production".to_string()),
            status: Some(GroupStatus::Unresolved),
        };
        let filter = signal_filter(&args);
        assert_eq!(filter.environment.as_deref(), Some("production"));
        assert_eq!(filter.status, Some(GroupStatus::Unresolved));
    }
}
