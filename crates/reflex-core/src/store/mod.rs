//! SQLite storage for projects, error groups, events, and notification jobs.
//!
//! Writers rely on the database for coordination: a unique index on
//! `(project_id, fingerprint)` decides which concurrent insert creates a
//! group, and counters only ever move through `SET n = n + 1`.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

mod models;
mod query;
mod signals;

pub use models::{to_db_time, ErrorEvent, ErrorGroup, GroupStatus, Project};
pub use query::{
    Analytics, ClassCount, DayCount, GroupFilter, GroupStats, HourCount, KeyCount, SearchResult,
    SortOrder, StatusCounts, TopError, UserCount,
};
pub use signals::{
    baseline_from_counts, parse_since, parse_window, rate_per_minute, Aggregation, Baseline,
    LastEvent, SignalFilter, DEFAULT_BASELINE_WINDOW, DEFAULT_RATE_WINDOW, DEFAULT_SINCE,
};

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::backtrace::Frame;
use crate::ids::{new_event_id, new_group_id, new_job_id, new_project_id};

/// How long a writer waits for another connection's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database handle for all reflex state.
pub struct ReflexDb {
    conn: Connection,
}

/// Representative fields of a group, taken from its first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewGroup {
    pub fingerprint: String,
    pub error_class: String,
    pub message: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub function_name: Option<String>,
    pub controller: Option<String>,
    pub action: Option<String>,
}

/// An occurrence ready to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEvent {
    pub error_class: String,
    pub message: Option<String>,
    pub backtrace: Vec<Frame>,
    pub environment: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub release: Option<String>,
    pub server_name: Option<String>,
    pub request_id: Option<String>,
    pub request_method: Option<String>,
    pub request_url: Option<String>,
    pub request_path: Option<String>,
    pub request_params: Map<String, Value>,
    pub request_headers: Map<String, Value>,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub user_data: Map<String, Value>,
    pub context: Map<String, Value>,
    pub tags: Map<String, Value>,
    pub extra: Map<String, Value>,
    pub breadcrumbs: Vec<Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Lifecycle of a notification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Delivered,
    /// The group or event no longer exists.
    Dropped,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Dropped => "dropped",
            Self::Failed => "failed",
        }
    }
}

/// A row of the notification outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationJob {
    pub id: String,
    pub group_id: String,
    pub event_id: String,
    pub attempts: i64,
}

/// Adds `fold_case(text)`: Unicode lowercasing, matching `str::to_lowercase`.
/// SQLite's built-in `lower()` only folds ASCII.
fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "fold_case",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text = ctx.get::<Option<String>>(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )
    .context("Failed to register fold_case")
}

impl ReflexDb {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create parent directories: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .context("Failed to enable WAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        register_functions(&conn)?;

        Ok(Self { conn })
    }

    /// Create an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        register_functions(&conn)?;
        Ok(Self { conn })
    }

    /// Initialize the database schema.
    ///
    /// Creates all tables and indexes if they don't exist.
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;
        Ok(())
    }

    /// Get a reference to the underlying connection (for advanced queries).
    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction that takes the write lock up front.
    ///
    /// Statements issued through `self` while the transaction is alive run
    /// inside it.
    pub fn immediate_transaction(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin transaction")
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Find a project by its platform identifier, creating it if needed.
    pub fn find_or_create_project(
        &self,
        platform_project_id: &str,
        name: Option<&str>,
        environment: &str,
        now: DateTime<Utc>,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (id, platform_project_id, name, environment, created_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (platform_project_id) DO NOTHING",
                params![
                    new_project_id(),
                    platform_project_id,
                    name,
                    environment,
                    to_db_time(&now),
                ],
            )
            .context("Failed to insert project")?;

        self.find_project_by_platform_id(platform_project_id)?
            .with_context(|| format!("Project vanished after insert: {platform_project_id}"))
    }

    /// Delete a project with all its groups, events, and jobs.
    ///
    /// Returns `false` if the project did not exist.
    pub fn delete_project(&self, project_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?", params![project_id])
            .context("Failed to delete project")?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Groups and events
    // ========================================================================

    /// Find the group for `(project_id, fingerprint)` or create it.
    ///
    /// Returns the group and whether this call created it. Representative
    /// fields are only written on creation. A concurrent creator losing the
    /// unique-index race falls through to the lookup.
    pub fn find_or_create_group(
        &self,
        project_id: &str,
        group: &NewGroup,
        now: DateTime<Utc>,
    ) -> Result<(ErrorGroup, bool)> {
        let now_str = to_db_time(&now);
        let inserted = self
            .conn
            .execute(
                "INSERT INTO error_groups (
                    id, project_id, fingerprint, error_class, message,
                    file_path, line_number, function_name, controller, action,
                    status, event_count, first_seen_at, last_seen_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'unresolved', 0, ?, ?, ?)
                ON CONFLICT (project_id, fingerprint) DO NOTHING",
                params![
                    new_group_id(),
                    project_id,
                    group.fingerprint,
                    group.error_class,
                    group.message,
                    group.file_path,
                    group.line_number,
                    group.function_name,
                    group.controller,
                    group.action,
                    now_str,
                    now_str,
                    now_str,
                ],
            )
            .context("Failed to insert error group")?;

        let created = inserted > 0;
        if created {
            self.conn
                .execute(
                    "UPDATE projects SET error_count = error_count + 1 WHERE id = ?",
                    params![project_id],
                )
                .context("Failed to increment project error_count")?;
        }

        let found = self
            .find_group_by_fingerprint(project_id, &group.fingerprint)?
            .with_context(|| format!("Error group vanished after insert: {}", group.fingerprint))?;

        Ok((found, created))
    }

    /// Append an event to a group. Returns the new event ID.
    pub fn insert_event(
        &self,
        project_id: &str,
        group_id: &str,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let event_id = new_event_id();
        self.conn
            .execute(
                "INSERT INTO error_events (
                    id, group_id, project_id, error_class, message, backtrace,
                    environment, commit_hash, branch, release_version, server_name,
                    request_id, request_method, request_url, request_path,
                    request_params, request_headers,
                    user_id, user_email, user_data,
                    context, tags, extra, breadcrumbs,
                    occurred_at, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    event_id,
                    group_id,
                    project_id,
                    event.error_class,
                    event.message,
                    to_json(&event.backtrace)?,
                    event.environment,
                    event.commit,
                    event.branch,
                    event.release,
                    event.server_name,
                    event.request_id,
                    event.request_method,
                    event.request_url,
                    event.request_path,
                    to_json(&event.request_params)?,
                    to_json(&event.request_headers)?,
                    event.user_id,
                    event.user_email,
                    to_json(&event.user_data)?,
                    to_json(&event.context)?,
                    to_json(&event.tags)?,
                    to_json(&event.extra)?,
                    to_json(&event.breadcrumbs)?,
                    to_db_time(&event.occurred_at),
                    to_db_time(&now),
                ],
            )
            .context("Failed to insert error event")?;
        Ok(event_id)
    }

    /// Count one more occurrence of a group.
    ///
    /// Increments the group and project counters in place, moves the
    /// last-seen fields to this occurrence, and reopens a resolved group.
    /// Ignored and muted groups keep their status.
    pub fn record_occurrence(
        &self,
        group_id: &str,
        occurred_at: DateTime<Utc>,
        commit: Option<&str>,
        environment: Option<&str>,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE error_groups SET
                    event_count = event_count + 1,
                    last_seen_at = ?,
                    last_commit = ?,
                    last_environment = ?,
                    resolved_at = CASE WHEN status = 'resolved' THEN NULL ELSE resolved_at END,
                    resolved_by = CASE WHEN status = 'resolved' THEN NULL ELSE resolved_by END,
                    status = CASE WHEN status = 'resolved' THEN 'unresolved' ELSE status END
                WHERE id = ?",
                params![to_db_time(&occurred_at), commit, environment, group_id],
            )
            .context("Failed to record occurrence")?;
        anyhow::ensure!(changed == 1, "Error group not found: {group_id}");

        self.conn
            .execute(
                "UPDATE projects SET event_count = event_count + 1
                 WHERE id = (SELECT project_id FROM error_groups WHERE id = ?)",
                params![group_id],
            )
            .context("Failed to increment project event_count")?;
        Ok(())
    }

    /// Overwrite a group's status.
    ///
    /// Resolving stamps `resolved_at`/`resolved_by`; unresolving clears
    /// them; ignoring and muting leave them alone. Returns `false` if the
    /// group does not exist in the project.
    pub fn set_status(
        &self,
        project_id: &str,
        group_id: &str,
        status: GroupStatus,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE error_groups SET
                    status = ?1,
                    resolved_at = CASE ?1
                        WHEN 'resolved' THEN ?2
                        WHEN 'unresolved' THEN NULL
                        ELSE resolved_at END,
                    resolved_by = CASE ?1
                        WHEN 'resolved' THEN ?3
                        WHEN 'unresolved' THEN NULL
                        ELSE resolved_by END
                WHERE id = ?4 AND project_id = ?5",
                params![status.as_str(), to_db_time(&now), actor, group_id, project_id],
            )
            .context("Failed to update group status")?;
        Ok(changed > 0)
    }

    /// Record that a notification was scheduled for a group.
    pub fn stamp_notified(&self, group_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE error_groups SET last_notified_at = ? WHERE id = ?",
                params![to_db_time(&now), group_id],
            )
            .context("Failed to stamp last_notified_at")?;
        Ok(())
    }

    /// Turn notifications for a group on or off.
    pub fn set_notifications_enabled(
        &self,
        project_id: &str,
        group_id: &str,
        enabled: bool,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE error_groups SET notifications_enabled = ? WHERE id = ? AND project_id = ?",
                params![enabled, group_id, project_id],
            )
            .context("Failed to update notifications_enabled")?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Notification outbox
    // ========================================================================

    /// Add a pending job. Returns the job ID.
    pub fn enqueue_job(&self, group_id: &str, event_id: &str, now: DateTime<Utc>) -> Result<String> {
        let job_id = new_job_id();
        self.conn
            .execute(
                "INSERT INTO notification_jobs (id, project_id, group_id, event_id, status, enqueued_at)
                 VALUES (?, (SELECT project_id FROM error_groups WHERE id = ?), ?, ?, 'pending', ?)",
                params![job_id, group_id, group_id, event_id, to_db_time(&now)],
            )
            .context("Failed to enqueue notification job")?;
        Ok(job_id)
    }

    /// Pending jobs, oldest first.
    pub fn pending_jobs(&self, limit: usize) -> Result<Vec<NotificationJob>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, group_id, event_id, attempts FROM notification_jobs
                 WHERE status = 'pending'
                 ORDER BY enqueued_at, id
                 LIMIT ?",
            )
            .context("Failed to prepare pending_jobs query")?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(NotificationJob {
                    id: row.get(0)?,
                    group_id: row.get(1)?,
                    event_id: row.get(2)?,
                    attempts: row.get(3)?,
                })
            })
            .context("Failed to query pending jobs")?;

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to read job row")
    }

    /// Move a job out of the pending state.
    pub fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE notification_jobs SET
                    status = ?, last_error = ?, attempts = attempts + 1, processed_at = ?
                 WHERE id = ?",
                params![status.as_str(), error, to_db_time(&now), job_id],
            )
            .context("Failed to update notification job")?;
        Ok(())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Recompute the counter caches of a project from its rows.
    ///
    /// Returns how many groups and projects had a wrong counter.
    pub fn reconcile_counters(&self, project_id: &str) -> Result<usize> {
        let tx = self.immediate_transaction()?;

        let groups = tx
            .execute(
                "UPDATE error_groups SET event_count = (
                    SELECT COUNT(*) FROM error_events e WHERE e.group_id = error_groups.id
                 )
                 WHERE project_id = ?1 AND event_count != (
                    SELECT COUNT(*) FROM error_events e WHERE e.group_id = error_groups.id
                 )",
                params![project_id],
            )
            .context("Failed to reconcile group counters")?;

        let projects = tx
            .execute(
                "UPDATE projects SET
                    error_count = (SELECT COUNT(*) FROM error_groups WHERE project_id = ?1),
                    event_count = (SELECT COUNT(*) FROM error_events WHERE project_id = ?1)
                 WHERE id = ?1 AND (
                    error_count != (SELECT COUNT(*) FROM error_groups WHERE project_id = ?1)
                    OR event_count != (SELECT COUNT(*) FROM error_events WHERE project_id = ?1)
                 )",
                params![project_id],
            )
            .context("Failed to reconcile project counters")?;

        tx.commit().context("Failed to commit reconcile")?;
        Ok(groups + projects)
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

/// Look up a single row, mapping "no rows" to `None`.
pub(crate) fn optional_row<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Option<T>> {
    conn.query_row(sql, params, map)
        .optional()
        .context("Failed to query row")
}

// ============================================================================
// Schema SQL
// ============================================================================

const SCHEMA_SQL: &str = r"
-- PROJECTS
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    platform_project_id TEXT NOT NULL UNIQUE,
    name TEXT,
    environment TEXT NOT NULL DEFAULT 'live',
    error_count INTEGER NOT NULL DEFAULT 0,
    event_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- ERROR GROUPS
CREATE TABLE IF NOT EXISTS error_groups (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    fingerprint TEXT NOT NULL,
    error_class TEXT NOT NULL,
    message TEXT,
    file_path TEXT,
    line_number INTEGER,
    function_name TEXT,
    controller TEXT,
    action TEXT,
    status TEXT NOT NULL DEFAULT 'unresolved'
        CHECK (status IN ('unresolved', 'resolved', 'ignored', 'muted')),
    event_count INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    last_commit TEXT,
    last_environment TEXT,
    resolved_at TEXT,
    resolved_by TEXT,
    notifications_enabled INTEGER NOT NULL DEFAULT 1,
    last_notified_at TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_groups_project_fingerprint
    ON error_groups(project_id, fingerprint);
CREATE INDEX IF NOT EXISTS idx_groups_project_status ON error_groups(project_id, status);
CREATE INDEX IF NOT EXISTS idx_groups_project_last_seen ON error_groups(project_id, last_seen_at);
CREATE INDEX IF NOT EXISTS idx_groups_project_class ON error_groups(project_id, error_class);

-- ERROR EVENTS
CREATE TABLE IF NOT EXISTS error_events (
    id TEXT PRIMARY KEY,
    group_id TEXT NOT NULL REFERENCES error_groups(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    error_class TEXT NOT NULL,
    message TEXT,
    backtrace TEXT NOT NULL DEFAULT '[]',
    environment TEXT,
    commit_hash TEXT,
    branch TEXT,
    release_version TEXT,
    server_name TEXT,
    request_id TEXT,
    request_method TEXT,
    request_url TEXT,
    request_path TEXT,
    request_params TEXT NOT NULL DEFAULT '{}',
    request_headers TEXT NOT NULL DEFAULT '{}',
    user_id TEXT,
    user_email TEXT,
    user_data TEXT NOT NULL DEFAULT '{}',
    context TEXT NOT NULL DEFAULT '{}',
    tags TEXT NOT NULL DEFAULT '{}',
    extra TEXT NOT NULL DEFAULT '{}',
    breadcrumbs TEXT NOT NULL DEFAULT '[]',
    occurred_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_group_occurred ON error_events(group_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_events_project_occurred ON error_events(project_id, occurred_at);
CREATE INDEX IF NOT EXISTS idx_events_project_class_occurred
    ON error_events(project_id, error_class, occurred_at);

-- NOTIFICATION OUTBOX
-- group_id/event_id are plain text: a job outliving its records is dropped on drain.
CREATE TABLE IF NOT EXISTS notification_jobs (
    id TEXT PRIMARY KEY,
    project_id TEXT REFERENCES projects(id) ON DELETE CASCADE,
    group_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'delivered', 'dropped', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    enqueued_at TEXT NOT NULL,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON notification_jobs(status, enqueued_at);
";

// ============================================================================
// Tests
// ============================================================================
