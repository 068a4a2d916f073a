//! Read-side queries: lookups, filtered group lists, stats and analytics.
//!
//! All result types implement Serialize for text/JSON output.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, ToSql};
use serde::Serialize;

use super::models::{to_db_time, ErrorEvent, ErrorGroup, GroupStatus, Project};
use super::{optional_row, ReflexDb};

// ============================================================================
// Filters
// ============================================================================

/// Ordering of group lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Most recently seen first.
    #[default]
    Recent,
    /// Highest event count first.
    Frequent,
    /// Most recently created first.
    FirstSeen,
}

impl SortOrder {
    const fn order_by(self) -> &'static str {
        match self {
            Self::Recent => "g.last_seen_at DESC, g.id",
            Self::Frequent => "g.event_count DESC, g.last_seen_at DESC, g.id",
            Self::FirstSeen => "g.first_seen_at DESC, g.id",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recent => "recent",
            Self::Frequent => "frequent",
            Self::FirstSeen => "first_seen",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recent" => Ok(Self::Recent),
            "frequent" => Ok(Self::Frequent),
            "first_seen" => Ok(Self::FirstSeen),
            other => Err(format!("unknown sort '{other}'")),
        }
    }
}

/// Filters for listing and searching groups. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupFilter {
    pub status: Option<GroupStatus>,
    pub error_class: Option<String>,
    /// Case-insensitive substring of error class, message, or file path.
    pub search: Option<String>,
    /// Lower bound on `last_seen_at`.
    pub since: Option<DateTime<Utc>>,
    /// Matches the group's last environment.
    pub environment: Option<String>,
    /// Only groups with at least one event from this user.
    pub event_user_id: Option<String>,
    /// Only groups with at least one event at this commit.
    pub event_commit: Option<String>,
    pub sort: SortOrder,
    /// Already resolved against the configured caps.
    pub limit: Option<usize>,
}

impl GroupFilter {
    /// Append WHERE conditions for this filter to `sql`.
    fn push_conditions(
        &self,
        project_id: &str,
        sql: &mut String,
        param_values: &mut Vec<Box<dyn ToSql>>,
    ) {
        sql.push_str(" WHERE g.project_id = ?");
        param_values.push(Box::new(project_id.to_string()));

        if let Some(status) = self.status {
            sql.push_str(" AND g.status = ?");
            param_values.push(Box::new(status.as_str()));
        }
        if let Some(class) = &self.error_class {
            sql.push_str(" AND g.error_class = ?");
            param_values.push(Box::new(class.clone()));
        }
        if let Some(term) = self.search.as_deref().filter(|t| !t.is_empty()) {
            sql.push_str(
                " AND (fold_case(g.error_class) LIKE ? ESCAPE '\\'
                   OR fold_case(COALESCE(g.message, '')) LIKE ? ESCAPE '\\'
                   OR fold_case(COALESCE(g.file_path, '')) LIKE ? ESCAPE '\\')",
            );
            let pattern = like_pattern(term);
            for _ in 0..3 {
                param_values.push(Box::new(pattern.clone()));
            }
        }
        if let Some(since) = self.since {
            sql.push_str(" AND g.last_seen_at >= ?");
            param_values.push(Box::new(to_db_time(&since)));
        }
        if let Some(env) = &self.environment {
            sql.push_str(" AND g.last_environment = ?");
            param_values.push(Box::new(env.clone()));
        }
        if self.event_user_id.is_some() || self.event_commit.is_some() {
            sql.push_str(" AND g.id IN (SELECT e.group_id FROM error_events e WHERE e.project_id = ?");
            param_values.push(Box::new(project_id.to_string()));
            if let Some(user_id) = &self.event_user_id {
                sql.push_str(" AND e.user_id = ?");
                param_values.push(Box::new(user_id.clone()));
            }
            if let Some(commit) = &self.event_commit {
                sql.push_str(" AND e.commit_hash = ?");
                param_values.push(Box::new(commit.clone()));
            }
            sql.push(')');
        }
    }
}

/// `%term%`, lowercased, with LIKE wildcards escaped.
fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

// ============================================================================
// Query Result Types
// ============================================================================

/// Groups matching a search, with the total before the limit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub groups: Vec<ErrorGroup>,
    pub count: i64,
}

/// A group in a ranked list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopError {
    pub id: String,
    pub error_class: String,
    pub message: Option<String>,
    pub count: i64,
}

impl TopError {
    fn from_group(group: &ErrorGroup) -> Self {
        Self {
            id: group.id.clone(),
            error_class: group.error_class.clone(),
            message: group.short_message(),
            count: group.event_count,
        }
    }
}

/// A count for one value of a grouping column. `key` is `None` for rows
/// without a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCount {
    pub key: Option<String>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassCount {
    pub error_class: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourCount {
    pub hour: u32,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserCount {
    pub user_id: String,
    pub user_email: Option<String>,
    pub count: i64,
}

/// Group counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: i64,
    pub unresolved: i64,
    pub resolved: i64,
    pub ignored: i64,
    pub muted: i64,
}

impl StatusCounts {
    fn add(&mut self, status: GroupStatus, count: i64) {
        self.total += count;
        match status {
            GroupStatus::Unresolved => self.unresolved += count,
            GroupStatus::Resolved => self.resolved += count,
            GroupStatus::Ignored => self.ignored += count,
            GroupStatus::Muted => self.muted += count,
        }
    }
}

/// Overview of a project's errors.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub groups: StatusCounts,
    pub total_events: i64,
    pub events_in_period: i64,
    /// Unresolved groups by event count.
    pub top_errors: Vec<TopError>,
    pub by_environment: Vec<KeyCount>,
}

/// Breakdowns for a reporting period.
#[derive(Debug, Clone, Serialize)]
pub struct Analytics {
    pub groups: StatusCounts,
    pub total_events: i64,
    pub events_in_period: i64,
    /// One entry per day from the period start to today, zero-filled.
    pub events_by_day: Vec<DayCount>,
    /// Groups seen in the period by event count.
    pub top_errors: Vec<TopError>,
    /// Event counts summed per error class over groups seen in the period.
    pub errors_by_class: Vec<ClassCount>,
    /// Groups first seen in the period, newest first.
    pub new_errors: Vec<TopError>,
    pub status_breakdown: BTreeMap<String, i64>,
    pub by_environment: Vec<KeyCount>,
    pub by_hour: Vec<HourCount>,
    pub affected_users: Vec<UserCount>,
    pub by_release: Vec<KeyCount>,
    pub by_branch: Vec<KeyCount>,
    pub by_commit: Vec<KeyCount>,
    pub by_server: Vec<KeyCount>,
}

/// Event columns that may be broken down by value.
#[derive(Debug, Clone, Copy)]
enum EventColumn {
    Release,
    Branch,
    Commit,
    Server,
}

impl EventColumn {
    const fn name(self) -> &'static str {
        match self {
            Self::Release => "release_version",
            Self::Branch => "branch",
            Self::Commit => "commit_hash",
            Self::Server => "server_name",
        }
    }
}

// ============================================================================
// Query Functions
// ============================================================================

impl ReflexDb {
    pub fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        optional_row(
            &self.conn,
            &format!("SELECT {} FROM projects WHERE id = ?", Project::COLUMNS),
            params![project_id],
            Project::from_row,
        )
        .context("Failed to query project")
    }

    pub fn find_project_by_platform_id(&self, platform_project_id: &str) -> Result<Option<Project>> {
        optional_row(
            &self.conn,
            &format!(
                "SELECT {} FROM projects WHERE platform_project_id = ?",
                Project::COLUMNS
            ),
            params![platform_project_id],
            Project::from_row,
        )
        .context("Failed to query project by platform id")
    }

    pub fn find_group_by_fingerprint(
        &self,
        project_id: &str,
        fingerprint: &str,
    ) -> Result<Option<ErrorGroup>> {
        optional_row(
            &self.conn,
            &format!(
                "SELECT {} FROM error_groups g WHERE g.project_id = ? AND g.fingerprint = ?",
                ErrorGroup::COLUMNS
            ),
            params![project_id, fingerprint],
            ErrorGroup::from_row,
        )
        .context("Failed to query group by fingerprint")
    }

    /// Get a group within a project. Returns `None` if it doesn't exist there.
    pub fn get_group(&self, project_id: &str, group_id: &str) -> Result<Option<ErrorGroup>> {
        optional_row(
            &self.conn,
            &format!(
                "SELECT {} FROM error_groups g WHERE g.id = ? AND g.project_id = ?",
                ErrorGroup::COLUMNS
            ),
            params![group_id, project_id],
            ErrorGroup::from_row,
        )
        .context("Failed to query group")
    }

    /// Get a group regardless of project (background work).
    pub fn get_group_by_id(&self, group_id: &str) -> Result<Option<ErrorGroup>> {
        optional_row(
            &self.conn,
            &format!("SELECT {} FROM error_groups g WHERE g.id = ?", ErrorGroup::COLUMNS),
            params![group_id],
            ErrorGroup::from_row,
        )
        .context("Failed to query group")
    }

    /// Get an event within a project. Returns `None` if it doesn't exist there.
    pub fn get_event(&self, project_id: &str, event_id: &str) -> Result<Option<ErrorEvent>> {
        optional_row(
            &self.conn,
            &format!(
                "SELECT {} FROM error_events e WHERE e.id = ? AND e.project_id = ?",
                ErrorEvent::COLUMNS
            ),
            params![event_id, project_id],
            ErrorEvent::from_row,
        )
        .context("Failed to query event")
    }

    /// Get an event regardless of project (background work).
    pub fn get_event_by_id(&self, event_id: &str) -> Result<Option<ErrorEvent>> {
        optional_row(
            &self.conn,
            &format!("SELECT {} FROM error_events e WHERE e.id = ?", ErrorEvent::COLUMNS),
            params![event_id],
            ErrorEvent::from_row,
        )
        .context("Failed to query event")
    }

    /// List groups matching a filter, in the filter's sort order.
    pub fn list_groups(&self, project_id: &str, filter: &GroupFilter) -> Result<Vec<ErrorGroup>> {
        let mut sql = format!("SELECT {} FROM error_groups g", ErrorGroup::COLUMNS);
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
        filter.push_conditions(project_id, &mut sql, &mut param_values);

        sql.push_str(" ORDER BY ");
        sql.push_str(filter.sort.order_by());
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            param_values.push(Box::new(limit as i64));
        }

        let params: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_groups query")?;
        let rows = stmt
            .query_map(params.as_slice(), ErrorGroup::from_row)
            .context("Failed to execute list_groups query")?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.context("Failed to read group row")?);
        }
        Ok(results)
    }

    /// Count groups matching a filter, ignoring its limit.
    pub fn count_groups(&self, project_id: &str, filter: &GroupFilter) -> Result<i64> {
        let mut sql = String::from("SELECT COUNT(*) FROM error_groups g");
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
        filter.push_conditions(project_id, &mut sql, &mut param_values);

        let params: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
        self.conn
            .query_row(&sql, params.as_slice(), |row| row.get(0))
            .context("Failed to count groups")
    }

    /// Events of a group, most recent occurrence first.
    pub fn group_events(
        &self,
        project_id: &str,
        group_id: &str,
        environment: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ErrorEvent>> {
        let mut sql = format!(
            "SELECT {} FROM error_events e WHERE e.project_id = ? AND e.group_id = ?",
            ErrorEvent::COLUMNS
        );
        let mut param_values: Vec<Box<dyn ToSql>> =
            vec![Box::new(project_id.to_string()), Box::new(group_id.to_string())];
        if let Some(env) = environment {
            sql.push_str(" AND e.environment = ?");
            param_values.push(Box::new(env.to_string()));
        }
        sql.push_str(" ORDER BY e.occurred_at DESC, e.created_at DESC LIMIT ?");
        param_values.push(Box::new(limit as i64));

        let params: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare group_events query")?;
        let events = stmt
            .query_map(params.as_slice(), ErrorEvent::from_row)
            .context("Failed to query group events")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read event row")?;
        Ok(events)
    }

    /// Status counts, event totals and top unresolved errors.
    pub fn stats(&self, project_id: &str, since: DateTime<Utc>) -> Result<GroupStats> {
        let top_errors = self
            .list_groups(
                project_id,
                &GroupFilter {
                    status: Some(GroupStatus::Unresolved),
                    sort: SortOrder::Frequent,
                    limit: Some(5),
                    ..GroupFilter::default()
                },
            )?
            .iter()
            .map(TopError::from_group)
            .collect();

        Ok(GroupStats {
            groups: self.status_counts(project_id)?,
            total_events: self.event_total(project_id, None)?,
            events_in_period: self.event_total(project_id, Some(since))?,
            top_errors,
            by_environment: self.environment_counts(project_id, since)?,
        })
    }

    /// Period breakdowns for dashboards.
    pub fn analytics(
        &self,
        project_id: &str,
        start: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<Analytics> {
        let start_str = to_db_time(&start);
        let groups = self.status_counts(project_id)?;

        let top_errors = self
            .ranked_groups(project_id, "g.last_seen_at >= ?", "g.event_count DESC", &start_str)?
            .iter()
            .map(TopError::from_group)
            .collect();
        let new_errors = self
            .ranked_groups(project_id, "g.first_seen_at >= ?", "g.first_seen_at DESC", &start_str)?
            .iter()
            .map(TopError::from_group)
            .collect();

        let status_breakdown = GroupStatus::ALL
            .iter()
            .map(|s| {
                let n = match s {
                    GroupStatus::Unresolved => groups.unresolved,
                    GroupStatus::Resolved => groups.resolved,
                    GroupStatus::Ignored => groups.ignored,
                    GroupStatus::Muted => groups.muted,
                };
                (s.as_str().to_string(), n)
            })
            .filter(|(_, n)| *n > 0)
            .collect();

        Ok(Analytics {
            total_events: self.event_total(project_id, None)?,
            events_in_period: self.event_total(project_id, Some(start))?,
            events_by_day: self.events_by_day(project_id, start, today)?,
            top_errors,
            errors_by_class: self.errors_by_class(project_id, &start_str)?,
            new_errors,
            status_breakdown,
            groups,
            by_environment: self.environment_counts(project_id, start)?,
            by_hour: self.events_by_hour(project_id, &start_str)?,
            affected_users: self.affected_users(project_id, &start_str)?,
            by_release: self.event_column_counts(project_id, &start_str, EventColumn::Release, 8)?,
            by_branch: self.event_column_counts(project_id, &start_str, EventColumn::Branch, 5)?,
            by_commit: self.event_column_counts(project_id, &start_str, EventColumn::Commit, 8)?,
            by_server: self.event_column_counts(project_id, &start_str, EventColumn::Server, 5)?,
        })
    }

    fn status_counts(&self, project_id: &str) -> Result<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM error_groups WHERE project_id = ? GROUP BY status")
            .context("Failed to prepare status count query")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to count groups by status")?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row.context("Failed to read status count")?;
            if let Ok(status) = status.parse() {
                counts.add(status, n);
            }
        }
        Ok(counts)
    }

    fn event_total(&self, project_id: &str, since: Option<DateTime<Utc>>) -> Result<i64> {
        let since = since.map_or_else(String::new, |s| to_db_time(&s));
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM error_events WHERE project_id = ? AND occurred_at >= ?",
                params![project_id, since],
                |row| row.get(0),
            )
            .context("Failed to count events")
    }

    fn ranked_groups(
        &self,
        project_id: &str,
        condition: &str,
        order: &str,
        start: &str,
    ) -> Result<Vec<ErrorGroup>> {
        let sql = format!(
            "SELECT {} FROM error_groups g WHERE g.project_id = ? AND {condition}
             ORDER BY {order}, g.id LIMIT 5",
            ErrorGroup::COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare ranked groups query")?;
        let groups = stmt
            .query_map(params![project_id, start], ErrorGroup::from_row)
            .context("Failed to query ranked groups")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read group row")?;
        Ok(groups)
    }

    fn errors_by_class(&self, project_id: &str, start: &str) -> Result<Vec<ClassCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT error_class, SUM(event_count) AS total FROM error_groups
                 WHERE project_id = ? AND last_seen_at >= ?
                 GROUP BY error_class
                 ORDER BY total DESC, error_class
                 LIMIT 8",
            )
            .context("Failed to prepare errors_by_class query")?;
        let rows = stmt
            .query_map(params![project_id, start], |row| {
                Ok(ClassCount {
                    error_class: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .context("Failed to query errors by class")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read class count")?;
        Ok(rows)
    }

    fn events_by_day(
        &self,
        project_id: &str,
        start: DateTime<Utc>,
        today: NaiveDate,
    ) -> Result<Vec<DayCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT substr(occurred_at, 1, 10) AS day, COUNT(*) FROM error_events
                 WHERE project_id = ? AND occurred_at >= ?
                 GROUP BY day",
            )
            .context("Failed to prepare events_by_day query")?;
        let rows = stmt
            .query_map(params![project_id, to_db_time(&start)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query events by day")?;

        let mut by_day = HashMap::new();
        for row in rows {
            let (day, n) = row.context("Failed to read day count")?;
            if let Ok(date) = NaiveDate::parse_from_str(&day, "%Y-%m-%d") {
                by_day.insert(date, n);
            }
        }

        Ok(start
            .date_naive()
            .iter_days()
            .take_while(|d| *d <= today)
            .map(|date| DayCount {
                date,
                count: by_day.get(&date).copied().unwrap_or(0),
            })
            .collect())
    }

    fn events_by_hour(&self, project_id: &str, start: &str) -> Result<Vec<HourCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT CAST(substr(occurred_at, 12, 2) AS INTEGER) AS hour, COUNT(*)
                 FROM error_events
                 WHERE project_id = ? AND occurred_at >= ?
                 GROUP BY hour
                 ORDER BY hour",
            )
            .context("Failed to prepare events_by_hour query")?;
        let rows = stmt
            .query_map(params![project_id, start], |row| {
                Ok(HourCount {
                    hour: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .context("Failed to query events by hour")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read hour count")?;
        Ok(rows)
    }

    fn affected_users(&self, project_id: &str, start: &str) -> Result<Vec<UserCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, user_email, COUNT(*) AS n FROM error_events
                 WHERE project_id = ? AND occurred_at >= ? AND user_id IS NOT NULL
                 GROUP BY user_id, user_email
                 ORDER BY n DESC, user_id
                 LIMIT 5",
            )
            .context("Failed to prepare affected_users query")?;
        let rows = stmt
            .query_map(params![project_id, start], |row| {
                Ok(UserCount {
                    user_id: row.get(0)?,
                    user_email: row.get(1)?,
                    count: row.get(2)?,
                })
            })
            .context("Failed to query affected users")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read user count")?;
        Ok(rows)
    }

    /// Events per environment in the period, including events without one.
    fn environment_counts(&self, project_id: &str, since: DateTime<Utc>) -> Result<Vec<KeyCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT environment, COUNT(*) AS n FROM error_events
                 WHERE project_id = ? AND occurred_at >= ?
                 GROUP BY environment
                 ORDER BY n DESC, environment",
            )
            .context("Failed to prepare environment count query")?;
        let rows = stmt
            .query_map(params![project_id, to_db_time(&since)], |row| {
                Ok(KeyCount {
                    key: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .context("Failed to count events by environment")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read environment count")?;
        Ok(rows)
    }

    /// Top values of a column among events in the period, blanks skipped.
    fn event_column_counts(
        &self,
        project_id: &str,
        start: &str,
        column: EventColumn,
        limit: usize,
    ) -> Result<Vec<KeyCount>> {
        let col = column.name();
        let sql = format!(
            "SELECT {col}, COUNT(*) AS n FROM error_events
             WHERE project_id = ? AND occurred_at >= ? AND {col} IS NOT NULL AND {col} != ''
             GROUP BY {col}
             ORDER BY n DESC, {col}
             LIMIT ?"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare {col} breakdown"))?;
        let rows = stmt
            .query_map(params![project_id, start, limit as i64], |row| {
                Ok(KeyCount {
                    key: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .with_context(|| format!("Failed to query {col} breakdown"))?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read breakdown row")?;
        Ok(rows)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::t0;
    use crate::store::{NewEvent, NewGroup};
    use chrono::Duration;

    fn setup() -> (ReflexDb, String) {
        let db = ReflexDb::open_in_memory().unwrap();
        db.init_schema().unwrap();
        let project = db.find_or_create_project("prj_q", None, "live", t0()).unwrap();
        (db, project.id)
    }

    /// Record one occurrence of `fingerprint`, creating its group on first use.
    fn occur(
        db: &ReflexDb,
        project_id: &str,
        fingerprint: &str,
        class: &str,
        at: DateTime<Utc>,
        tweak: impl FnOnce(&mut NewEvent),
    ) -> ErrorGroup {
        let (group, _) = db
            .find_or_create_group(
                project_id,
                &NewGroup {
                    fingerprint: fingerprint.to_string(),
                    error_class: class.to_string(),
                    message: Some(format!("{class} happened")),
                    file_path: Some(format!("app/{fingerprint}.rb")),
                    ..NewGroup::default()
                },
                at,
            )
            .unwrap();
        let mut event = NewEvent {
            error_class: class.to_string(),
            occurred_at: at,
            ..NewEvent::default()
        };
        tweak(&mut event);
        db.insert_event(project_id, &group.id, &event, at).unwrap();
        db.record_occurrence(
            &group.id,
            at,
            event.commit.as_deref(),
            event.environment.as_deref(),
        )
        .unwrap();
        db.get_group(project_id, &group.id).unwrap().unwrap()
    }

    fn ids(groups: &[ErrorGroup]) -> Vec<String> {
        groups.iter().map(|g| g.fingerprint.clone()).collect()
    }

    #[test]
    fn test_list_groups_empty() {
        let (db, project) = setup();
        assert!(db.list_groups(&project, &GroupFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn test_list_groups_sorting() {
        let (db, project) = setup();
        occur(&db, &project, "a", "A", t0(), |_| {});
        occur(&db, &project, "b", "B", t0() + Duration::minutes(1), |_| {});
        occur(&db, &project, "b", "B", t0() + Duration::minutes(2), |_| {});
        occur(&db, &project, "c", "C", t0() + Duration::minutes(3), |_| {});

        let recent = db.list_groups(&project, &GroupFilter::default()).unwrap();
        assert_eq!(ids(&recent), vec!["c", "b", "a"]);

        let frequent = GroupFilter {
            sort: SortOrder::Frequent,
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &frequent).unwrap())[0], "b");

        let first_seen = GroupFilter {
            sort: SortOrder::FirstSeen,
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &first_seen).unwrap()), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_list_groups_filters() {
        let (db, project) = setup();
        let a = occur(&db, &project, "a", "NoMethodError", t0(), |e| {
            e.environment = Some("production".to_string());
        });
        occur(&db, &project, "b", "ArgumentError", t0() + Duration::hours(2), |e| {
            e.environment = Some("staging".to_string());
        });
        db.set_status(&project, &a.id, GroupStatus::Resolved, None, t0()).unwrap();

        let by_status = GroupFilter {
            status: Some(GroupStatus::Resolved),
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &by_status).unwrap()), vec!["a"]);

        let by_class = GroupFilter {
            error_class: Some("ArgumentError".to_string()),
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &by_class).unwrap()), vec!["b"]);

        let by_since = GroupFilter {
            since: Some(t0() + Duration::hours(1)),
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &by_since).unwrap()), vec!["b"]);

        let by_env = GroupFilter {
            environment: Some("production".to_string()),
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &by_env).unwrap()), vec!["a"]);
    }

    #[test]
    fn test_search_is_case_insensitive_over_class_message_and_file() {
        let (db, project) = setup();
        occur(&db, &project, "users", "NoMethodError", t0(), |_| {});
        occur(&db, &project, "orders", "Timeout", t0(), |_| {});

        let search = |term: &str| GroupFilter {
            search: Some(term.to_string()),
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &search("nomethod")).unwrap()), vec!["users"]);
        assert_eq!(ids(&db.list_groups(&project, &search("TIMEOUT HAPP")).unwrap()), vec!["orders"]);
        assert_eq!(ids(&db.list_groups(&project, &search("app/orders")).unwrap()), vec!["orders"]);
        assert!(db.list_groups(&project, &search("100%")).unwrap().is_empty());
    }

    #[test]
    fn test_search_folds_non_ascii_case() {
        let (db, project) = setup();
        db.find_or_create_group(
            &project,
            &NewGroup {
                fingerprint: "intl".to_string(),
                error_class: "ÉchecError".to_string(),
                message: Some("Ошибка сети".to_string()),
                ..NewGroup::default()
            },
            t0(),
        )
        .unwrap();
        occur(&db, &project, "plain", "Timeout", t0(), |_| {});

        for term in ["échec", "ÉCHEC", "Échec", "ошибка", "ОШИБКА СЕТИ"] {
            let filter = GroupFilter {
                search: Some(term.to_string()),
                ..GroupFilter::default()
            };
            assert_eq!(db.count_groups(&project, &filter).unwrap(), 1, "search {term:?}");
        }
    }

    #[test]
    fn test_event_filters_and_count() {
        let (db, project) = setup();
        occur(&db, &project, "a", "A", t0(), |e| e.user_id = Some("u1".to_string()));
        occur(&db, &project, "b", "B", t0(), |e| {
            e.user_id = Some("u2".to_string());
            e.commit = Some("deadbeef".to_string());
        });
        occur(&db, &project, "c", "C", t0(), |e| e.commit = Some("deadbeef".to_string()));

        let by_user = GroupFilter {
            event_user_id: Some("u2".to_string()),
            ..GroupFilter::default()
        };
        assert_eq!(ids(&db.list_groups(&project, &by_user).unwrap()), vec!["b"]);

        let by_commit = GroupFilter {
            event_commit: Some("deadbeef".to_string()),
            limit: Some(1),
            ..GroupFilter::default()
        };
        assert_eq!(db.list_groups(&project, &by_commit).unwrap().len(), 1);
        assert_eq!(db.count_groups(&project, &by_commit).unwrap(), 2);
    }

    #[test]
    fn test_lookups_are_project_scoped() {
        let (db, project) = setup();
        let other = db.find_or_create_project("prj_other", None, "live", t0()).unwrap();
        let group = occur(&db, &project, "a", "A", t0(), |_| {});
        let event = &db.group_events(&project, &group.id, None, 10).unwrap()[0];

        assert!(db.get_group(&other.id, &group.id).unwrap().is_none());
        assert!(db.get_event(&other.id, &event.id).unwrap().is_none());
        assert!(db.get_group_by_id(&group.id).unwrap().is_some());
        assert!(db.get_event_by_id(&event.id).unwrap().is_some());
    }

    #[test]
    fn test_group_events_ordered_by_occurred_at() {
        let (db, project) = setup();
        // Inserted out of order on purpose
        occur(&db, &project, "a", "A", t0() + Duration::minutes(5), |e| {
            e.environment = Some("production".to_string());
        });
        let group = occur(&db, &project, "a", "A", t0(), |e| {
            e.environment = Some("staging".to_string());
        });
        occur(&db, &project, "a", "A", t0() + Duration::minutes(9), |e| {
            e.environment = Some("production".to_string());
        });

        let events = db.group_events(&project, &group.id, None, 10).unwrap();
        let times: Vec<_> = events.iter().map(|e| e.occurred_at).collect();
        assert_eq!(
            times,
            vec![t0() + Duration::minutes(9), t0() + Duration::minutes(5), t0()]
        );

        let prod = db.group_events(&project, &group.id, Some("production"), 10).unwrap();
        assert_eq!(prod.len(), 2);
        assert_eq!(db.group_events(&project, &group.id, None, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let (db, project) = setup();
        occur(&db, &project, "a", "A", t0(), |e| e.environment = Some("production".to_string()));
        occur(&db, &project, "a", "A", t0(), |e| e.environment = Some("production".to_string()));
        let b = occur(&db, &project, "b", "B", t0() - Duration::days(3), |_| {});
        db.set_status(&project, &b.id, GroupStatus::Ignored, None, t0()).unwrap();

        let stats = db.stats(&project, t0() - Duration::hours(24)).unwrap();
        assert_eq!(stats.groups.total, 2);
        assert_eq!(stats.groups.unresolved, 1);
        assert_eq!(stats.groups.ignored, 1);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_in_period, 2);
        assert_eq!(stats.top_errors.len(), 1);
        assert_eq!(stats.top_errors[0].count, 2);
        assert_eq!(
            stats.by_environment,
            vec![KeyCount {
                key: Some("production".to_string()),
                count: 2
            }]
        );
    }

    #[test]
    fn test_analytics_breakdowns() {
        let (db, project) = setup();
        let start = t0() - Duration::days(2);
        occur(&db, &project, "a", "NoMethodError", t0(), |e| {
            e.release = Some("v1.2".to_string());
            e.server_name = Some("web-1".to_string());
            e.user_id = Some("u1".to_string());
            e.user_email = Some("u1@example.com".to_string());
        });
        occur(&db, &project, "a", "NoMethodError", t0() + Duration::hours(1), |e| {
            e.release = Some(String::new());
            e.user_id = Some("u1".to_string());
            e.user_email = Some("u1@example.com".to_string());
        });
        occur(&db, &project, "b", "Timeout", t0() - Duration::days(1), |e| {
            e.branch = Some("main".to_string());
        });
        // Outside the period
        occur(&db, &project, "c", "Old", t0() - Duration::days(10), |_| {});

        let analytics = db.analytics(&project, start, t0().date_naive()).unwrap();

        assert_eq!(analytics.events_in_period, 3);
        assert_eq!(analytics.events_by_day.len(), 3);
        assert_eq!(analytics.events_by_day[0].count, 0);
        assert_eq!(analytics.events_by_day[1].count, 1);
        assert_eq!(analytics.events_by_day[2].count, 2);

        assert_eq!(analytics.top_errors.len(), 2);
        assert_eq!(analytics.top_errors[0].error_class, "NoMethodError");
        assert_eq!(
            analytics.errors_by_class[0],
            ClassCount {
                error_class: "NoMethodError".to_string(),
                count: 2
            }
        );
        assert!(analytics.new_errors.iter().all(|e| e.error_class != "Old"));
        assert_eq!(analytics.status_breakdown.get("unresolved"), Some(&3));

        assert_eq!(
            analytics.by_hour,
            vec![
                HourCount { hour: 12, count: 2 },
                HourCount { hour: 13, count: 1 }
            ]
        );
        assert_eq!(analytics.affected_users.len(), 1);
        assert_eq!(analytics.affected_users[0].count, 2);
        assert_eq!(analytics.by_release.len(), 1, "blank releases are skipped");
        assert_eq!(analytics.by_branch[0].key.as_deref(), Some("main"));
        assert_eq!(analytics.by_server[0].key.as_deref(), Some("web-1"));
        assert!(analytics.by_commit.is_empty());
    }

    #[test]
    fn test_sort_order_parsing() {
        assert_eq!("first_seen".parse::<SortOrder>(), Ok(SortOrder::FirstSeen));
        assert!("oldest".parse::<SortOrder>().is_err());
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }
}
