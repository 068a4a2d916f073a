//! Stored entities and their row mappings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backtrace::{app_frames, Frame};

/// Characters kept by [`ErrorGroup::short_message`], ellipsis included.
const SHORT_MESSAGE_CHARS: usize = 100;

/// Status of an error group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    #[default]
    Unresolved,
    Resolved,
    Ignored,
    Muted,
}

impl GroupStatus {
    pub const ALL: [Self; 4] = [Self::Unresolved, Self::Resolved, Self::Ignored, Self::Muted];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
            Self::Muted => "muted",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

/// A tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: String,
    pub platform_project_id: String,
    pub name: Option<String>,
    pub environment: String,
    pub error_count: i64,
    pub event_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub(crate) const COLUMNS: &'static str =
        "id, platform_project_id, name, environment, error_count, event_count, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            platform_project_id: row.get(1)?,
            name: row.get(2)?,
            environment: row.get(3)?,
            error_count: row.get(4)?,
            event_count: row.get(5)?,
            created_at: time_column(row, 6)?,
        })
    }
}

/// The deduplicated identity of a recurring error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorGroup {
    pub id: String,
    pub project_id: String,
    pub fingerprint: String,
    pub error_class: String,
    /// Message of the first occurrence.
    pub message: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<i64>,
    pub function_name: Option<String>,
    pub controller: Option<String>,
    pub action: Option<String>,
    pub status: GroupStatus,
    pub event_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_commit: Option<String>,
    pub last_environment: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub notifications_enabled: bool,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ErrorGroup {
    pub(crate) const COLUMNS: &'static str = "g.id, g.project_id, g.fingerprint, g.error_class, \
         g.message, g.file_path, g.line_number, g.function_name, g.controller, g.action, \
         g.status, g.event_count, g.first_seen_at, g.last_seen_at, g.last_commit, \
         g.last_environment, g.resolved_at, g.resolved_by, g.notifications_enabled, \
         g.last_notified_at, g.created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            fingerprint: row.get(2)?,
            error_class: row.get(3)?,
            message: row.get(4)?,
            file_path: row.get(5)?,
            line_number: row.get(6)?,
            function_name: row.get(7)?,
            controller: row.get(8)?,
            action: row.get(9)?,
            status: status_column(row, 10)?,
            event_count: row.get(11)?,
            first_seen_at: time_column(row, 12)?,
            last_seen_at: time_column(row, 13)?,
            last_commit: row.get(14)?,
            last_environment: row.get(15)?,
            resolved_at: optional_time_column(row, 16)?,
            resolved_by: row.get(17)?,
            notifications_enabled: row.get(18)?,
            last_notified_at: optional_time_column(row, 19)?,
            created_at: time_column(row, 20)?,
        })
    }

    /// First line of the message, cut to 100 characters.
    #[must_use]
    pub fn short_message(&self) -> Option<String> {
        let first_line = self.message.as_deref()?.lines().next().unwrap_or_default();
        if first_line.chars().count() <= SHORT_MESSAGE_CHARS {
            return Some(first_line.to_string());
        }
        let kept: String = first_line.chars().take(SHORT_MESSAGE_CHARS - 3).collect();
        Some(format!("{kept}..."))
    }

    /// `file:line in function`, when the group has a file.
    #[must_use]
    pub fn location(&self) -> Option<String> {
        let file = self.file_path.as_deref()?;
        let line = self.line_number.map(|l| l.to_string()).unwrap_or_default();
        let function = self.function_name.as_deref().unwrap_or_default();
        Some(format!("{file}:{line} in {function}"))
    }

    /// Whether a notification may be scheduled at `now`.
    #[must_use]
    pub fn notification_due(&self, now: DateTime<Utc>, throttle: chrono::Duration) -> bool {
        self.notifications_enabled
            && self
                .last_notified_at
                .is_none_or(|last| last <= now - throttle)
    }
}

/// One occurrence of an error group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub id: String,
    pub group_id: String,
    pub project_id: String,
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
    pub created_at: DateTime<Utc>,
}

impl ErrorEvent {
    pub(crate) const COLUMNS: &'static str = "e.id, e.group_id, e.project_id, e.error_class, \
         e.message, e.backtrace, e.environment, e.commit_hash, e.branch, e.release_version, \
         e.server_name, e.request_id, e.request_method, e.request_url, e.request_path, \
         e.request_params, e.request_headers, e.user_id, e.user_email, e.user_data, \
         e.context, e.tags, e.extra, e.breadcrumbs, e.occurred_at, e.created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            project_id: row.get(2)?,
            error_class: row.get(3)?,
            message: row.get(4)?,
            backtrace: json_column(row, 5)?,
            environment: row.get(6)?,
            commit: row.get(7)?,
            branch: row.get(8)?,
            release: row.get(9)?,
            server_name: row.get(10)?,
            request_id: row.get(11)?,
            request_method: row.get(12)?,
            request_url: row.get(13)?,
            request_path: row.get(14)?,
            request_params: json_column(row, 15)?,
            request_headers: json_column(row, 16)?,
            user_id: row.get(17)?,
            user_email: row.get(18)?,
            user_data: json_column(row, 19)?,
            context: json_column(row, 20)?,
            tags: json_column(row, 21)?,
            extra: json_column(row, 22)?,
            breadcrumbs: json_column(row, 23)?,
            occurred_at: time_column(row, 24)?,
            created_at: time_column(row, 25)?,
        })
    }

    /// In-app frames, or the whole backtrace when none are in-app.
    #[must_use]
    pub fn app_backtrace(&self) -> Vec<&Frame> {
        app_frames(&self.backtrace)
    }

    #[must_use]
    pub fn first_app_frame(&self) -> Option<&Frame> {
        self.app_backtrace().into_iter().next()
    }
}

/// Fixed-width UTC text; lexical order is chronological order.
#[must_use]
pub fn to_db_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_db_time(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_db_time(idx, &text)
}

pub(crate) fn optional_time_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_db_time(idx, &t)).transpose()
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<GroupStatus> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
