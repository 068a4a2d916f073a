//! Shared helpers for CLI commands.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};

use reflex_core::config::ReflexConfig;
use reflex_core::core::ReflexServices;
use reflex_core::notify::TracingBroadcaster;
use reflex_core::store::{parse_since, GroupFilter, Project};

use crate::cli::FilterArgs;

/// Environment variable naming the default platform project.
pub const PROJECT_ENV: &str = "REFLEX_PROJECT";

/// Load configuration and open the services it describes.
///
/// An explicit `--db` wins over the configured database path.
pub fn open_services(config_path: Option<&Path>, db: Option<PathBuf>) -> Result<ReflexServices> {
    let mut config = ReflexConfig::discover(config_path)?;
    if let Some(db) = db {
        config.database = db;
    }
    tracing::debug!(database = %config.database.display(), "opening database");

    let services = ReflexServices::open(config)
        .context("Failed to open reflex database")?
        .with_broadcaster(TracingBroadcaster);
    Ok(services)
}

/// The platform project ID from `--project` or `$REFLEX_PROJECT`.
pub fn project_id_arg(project: Option<&str>) -> Result<String> {
    if let Some(id) = project.filter(|p| !p.is_empty()) {
        return Ok(id.to_string());
    }
    match std::env::var(PROJECT_ENV) {
        Ok(id) if !id.is_empty() => Ok(id),
        _ => bail!("No project given. Pass --project <id> or set {PROJECT_ENV}."),
    }
}

/// Find or create the project named by `--project` or `$REFLEX_PROJECT`.
pub fn resolve_project(services: &ReflexServices, project: Option<&str>) -> Result<Project> {
    let platform_id = project_id_arg(project)?;
    Ok(services
        .projects()
        .find_or_create_for_platform(&platform_id, None, None)?)
}

/// Read a JSON document from a file, or stdin when no file is given.
pub fn read_json(file: Option<&Path>) -> Result<Value> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    serde_json::from_str(&text).context("Input is not valid JSON")
}

/// Parse a `<N>h|d|w` period, rejecting anything else.
pub fn parse_period(text: &str) -> Result<Duration> {
    match parse_since(text) {
        Some(period) => Ok(period),
        None => bail!("Invalid period '{text}'. Use <N>h, <N>d, or <N>w (e.g. 24h, 7d, 2w)."),
    }
}

/// Start of an optional period ending now, or `default` when not given.
pub fn period_start(text: Option<&str>, default: Duration) -> Result<DateTime<Utc>> {
    let period = text.map(parse_period).transpose()?.unwrap_or(default);
    Ok(Utc::now() - period)
}

/// Who performed an action: the explicit name, else `$USER`.
pub fn actor(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .filter(|a| !a.is_empty())
}

/// Build a store filter from the shared CLI filter flags.
pub fn group_filter(args: &FilterArgs, search: Option<String>) -> Result<GroupFilter> {
    let since = args
        .since
        .as_deref()
        .map(|text| parse_period(text).map(|period| Utc::now() - period))
        .transpose()?;

    Ok(GroupFilter {
        status: args.status,
        error_class: args.error_class.clone(),
        search,
        since,
        environment: args.environment.clone(),
        event_user_id: args.user.clone(),
        event_commit: args.commit.clone(),
        sort: args.sort,
        limit: args.limit,
    })
}
