//! reflex - error tracking: ingest reports, group them, query the groups

mod cli;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use reflex_core::core::ReflexServices;
use reflex_core::store::{GroupStatus, Project};

use crate::cli::commands::helpers::{open_services, resolve_project};
use crate::cli::commands::{
    run_analytics, run_errors_events, run_errors_list, run_errors_notifications,
    run_errors_show, run_errors_transition, run_ingest, run_notify_drain, run_notify_pending,
    run_project_delete, run_project_ensure, run_project_show, run_reconcile, run_search,
    run_signal_baseline, run_signal_last, run_signal_rate, run_stats,
};
use crate::cli::{Cli, Commands, ErrorsCommands, NotifyCommands, ProjectCommands, SignalCommands};
use crate::output::OutputFormat;

/// Logs go to stderr so stdout stays parseable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_errors(
    services: &ReflexServices,
    project: &Project,
    cmd: ErrorsCommands,
    format: OutputFormat,
) -> Result<()> {
    let transition = |group_id: &str, status: GroupStatus, by: Option<&str>| {
        run_errors_transition(services, project, group_id, status, by, format)
    };

    match cmd {
        ErrorsCommands::List { search, filter } => {
            run_errors_list(services, project, &filter, search, format)
        }
        ErrorsCommands::Show { group_id } => run_errors_show(services, project, &group_id, format),
        ErrorsCommands::Events {
            group_id,
            environment,
            limit,
        } => run_errors_events(
            services,
            project,
            &group_id,
            environment.as_deref(),
            limit,
            format,
        ),
        ErrorsCommands::Resolve { group_id, by } => {
            transition(&group_id, GroupStatus::Resolved, by.as_deref())
        }
        ErrorsCommands::Unresolve { group_id } => {
            transition(&group_id, GroupStatus::Unresolved, None)
        }
        ErrorsCommands::Ignore { group_id } => transition(&group_id, GroupStatus::Ignored, None),
        ErrorsCommands::Mute { group_id } => transition(&group_id, GroupStatus::Muted, None),
        ErrorsCommands::Notifications { group_id, off } => {
            run_errors_notifications(services, project, &group_id, !off, format)
        }
    }
}

fn run_signal(
    services: &ReflexServices,
    project: &Project,
    cmd: SignalCommands,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        SignalCommands::Rate {
            target,
            window,
            aggregation,
        } => run_signal_rate(
            services,
            project,
            &target,
            window.as_deref(),
            aggregation,
            format,
        ),
        SignalCommands::Baseline { target, window } => {
            run_signal_baseline(services, project, &target, window.as_deref(), format)
        }
        SignalCommands::Last { target } => run_signal_last(services, project, &target, format),
    }
}

fn main() -> Result<()> {
    let Cli {
        json,
        log_json,
        db,
        config,
        project,
        command,
    } = Cli::parse();

    init_tracing(log_json);

    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let services = open_services(config.as_deref(), db)?;
    let project = project.as_deref();

    match command {
        Commands::Ingest {
            file,
            message,
            batch,
        } => {
            let project = resolve_project(&services, project)?;
            run_ingest(&services, &project, file.as_deref(), message, batch, format)?;
        }

        Commands::Errors(cmd) => {
            let project = resolve_project(&services, project)?;
            run_errors(&services, &project, cmd, format)?;
        }

        Commands::Search { query, filter } => {
            let project = resolve_project(&services, project)?;
            run_search(&services, &project, &query, &filter, format)?;
        }

        Commands::Stats { since } => {
            let project = resolve_project(&services, project)?;
            run_stats(&services, &project, since.as_deref(), format)?;
        }

        Commands::Analytics { since } => {
            let project = resolve_project(&services, project)?;
            run_analytics(&services, &project, since.as_deref(), format)?;
        }

        Commands::Signal(cmd) => {
            let project = resolve_project(&services, project)?;
            run_signal(&services, &project, cmd, format)?;
        }

        Commands::Notify(cmd) => match cmd {
            NotifyCommands::Pending { limit } => {
                run_notify_pending(&services, limit, format)?;
            }
            NotifyCommands::Drain { limit } => {
                run_notify_drain(&services, limit, format)?;
            }
        },

        Commands::Reconcile => {
            let project = resolve_project(&services, project)?;
            run_reconcile(&services, &project, format)?;
        }

        Commands::Project(cmd) => match cmd {
            ProjectCommands::Show => {
                let project = resolve_project(&services, project)?;
                run_project_show(&project, format)?;
            }
            ProjectCommands::Ensure { file } => {
                run_project_ensure(&services, file.as_deref(), format)?;
            }
            ProjectCommands::Delete { force } => {
                run_project_delete(&services, project, force, format)?;
            }
        },
    }

    Ok(())
}
