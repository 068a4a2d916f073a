//! Implementation of `reflex errors` subcommands and `reflex search`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use reflex_core::config::Surface;
use reflex_core::core::ReflexServices;
use reflex_core::store::{ErrorGroup, GroupStatus, Project};

use crate::cli::commands::helpers::{actor, group_filter};
use crate::cli::FilterArgs;
use crate::output::{Formatter, OutputFormat};

/// One line of a group listing.
#[derive(Debug, Serialize)]
struct GroupLine {
    id: String,
    status: GroupStatus,
    error_class: String,
    message: Option<String>,
    location: Option<String>,
    event_count: i64,
    last_seen_at: DateTime<Utc>,
}

impl From<&ErrorGroup> for GroupLine {
    fn from(group: &ErrorGroup) -> Self {
        Self {
            id: group.id.clone(),
            status: group.status,
            error_class: group.error_class.clone(),
            message: group.short_message(),
            location: group.location(),
            event_count: group.event_count,
            last_seen_at: group.last_seen_at,
        }
    }
}

/// List groups of the project.
pub fn run_errors_list(
    services: &ReflexServices,
    project: &Project,
    filter: &FilterArgs,
    search: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let filter = group_filter(filter, search)?;
    let groups = services.groups().list(&project.id, &filter, Surface::Api)?;
    let lines: Vec<GroupLine> = groups.iter().map(GroupLine::from).collect();

    Formatter::new(format).print_list(&lines, "No errors found.", "groups")
}

/// Search groups, reporting the total match count.
pub fn run_search(
    services: &ReflexServices,
    project: &Project,
    query: &str,
    filter: &FilterArgs,
    format: OutputFormat,
) -> Result<()> {
    let filter = group_filter(filter, Some(query.to_string()))?;
    let result = services.groups().search(&project.id, &filter)?;
    let lines: Vec<GroupLine> = result.groups.iter().map(GroupLine::from).collect();

    let formatter = Formatter::new(format);
    match format {
        OutputFormat::Json => formatter.print(&serde_json::json!({
            "groups": lines,
            "count": result.count,
        })),
        OutputFormat::Text => {
            formatter.print_list(&lines, &format!("No errors match '{query}'."), "groups")?;
            let shown = i64::try_from(lines.len()).unwrap_or(i64::MAX);
            if result.count > shown {
                println!("({} of {} matches shown)", lines.len(), result.count);
            }
            Ok(())
        }
    }
}

/// Show one group in full.
pub fn run_errors_show(
    services: &ReflexServices,
    project: &Project,
    group_id: &str,
    format: OutputFormat,
) -> Result<()> {
    let group = services.groups().get(&project.id, group_id)?;
    Formatter::new(format).print(&group)
}

/// Show recent events of a group.
pub fn run_errors_events(
    services: &ReflexServices,
    project: &Project,
    group_id: &str,
    environment: Option<&str>,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let history = services
        .events()
        .for_group(&project.id, group_id, environment, limit)?;

    let formatter = Formatter::new(format);
    match format {
        OutputFormat::Json => formatter.print(&history),
        OutputFormat::Text => {
            println!("{} ({} events total)", history.group_id, history.total_count);
            formatter.print_list(&history.events, "No events found.", "events")
        }
    }
}

/// Move a group to `status`.
#[tracing::instrument(skip(services, project, format), fields(project_id = %project.id))]
pub fn run_errors_transition(
    services: &ReflexServices,
    project: &Project,
    group_id: &str,
    status: GroupStatus,
    by: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let groups = services.groups();
    let group = match status {
        GroupStatus::Resolved => groups.resolve(&project.id, group_id, actor(by).as_deref())?,
        GroupStatus::Unresolved => groups.unresolve(&project.id, group_id)?,
        GroupStatus::Ignored => groups.ignore(&project.id, group_id)?,
        GroupStatus::Muted => groups.mute(&project.id, group_id)?,
    };

    Formatter::new(format).print(&GroupLine::from(&group))
}

/// Turn notifications for a group on or off.
pub fn run_errors_notifications(
    services: &ReflexServices,
    project: &Project,
    group_id: &str,
    enabled: bool,
    format: OutputFormat,
) -> Result<()> {
    let group = services
        .groups()
        .set_notifications(&project.id, group_id, enabled)?;

    Formatter::new(format).print(&serde_json::json!({
        "id": group.id,
        "notifications_enabled": group.notifications_enabled,
    }))
}
