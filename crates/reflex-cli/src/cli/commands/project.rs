//! Implementation of `reflex project` subcommands and `reflex reconcile`.

use anyhow::{bail, Context, Result};
use std::path::Path;

use reflex_core::core::projects::ProjectIdentity;
use reflex_core::core::ReflexServices;
use reflex_core::store::Project;

use crate::cli::commands::helpers::{project_id_arg, read_json};
use crate::output::{Formatter, OutputFormat};

/// Show the project, creating it on first use.
pub fn run_project_show(project: &Project, format: OutputFormat) -> Result<()> {
    Formatter::new(format).print(project)
}

/// Resolve an identity document to its project.
#[tracing::instrument(skip(services, format))]
pub fn run_project_ensure(
    services: &ReflexServices,
    file: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    let identity: ProjectIdentity =
        serde_json::from_value(read_json(file)?).context("Invalid identity document")?;
    let project = services.projects().ensure_for_identity(&identity)?;
    Formatter::new(format).print(&project)
}

/// Delete the project named by `--project`.
#[tracing::instrument(skip(services, format))]
pub fn run_project_delete(
    services: &ReflexServices,
    project: Option<&str>,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let platform_id = project_id_arg(project)?;
    let Some(project) = services.projects().find_by_platform_id(&platform_id)? else {
        bail!("Project '{platform_id}' not found");
    };
    if !force {
        bail!(
            "Refusing to delete project '{platform_id}' ({} groups, {} events) without --force",
            project.error_count,
            project.event_count
        );
    }

    services.projects().delete(&project.id)?;
    Formatter::new(format).print(&serde_json::json!({
        "id": project.id,
        "platform_project_id": platform_id,
        "deleted": true,
    }))
}

/// Recompute the project's counters from its events.
pub fn run_reconcile(services: &ReflexServices, project: &Project, format: OutputFormat) -> Result<()> {
    let fixed = services.projects().reconcile(&project.id)?;
    Formatter::new(format).print(&serde_json::json!({
        "id": project.id,
        "fixed": fixed,
    }))
}
