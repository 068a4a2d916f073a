//! Time-windowed event aggregation for alerting: counts, rates, hourly
//! baselines, and the most recent matching event.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::ToSql;
use serde::Serialize;

use super::models::{optional_time_column, to_db_time, GroupStatus};
use super::{optional_row, ReflexDb};

/// Window used by rate queries when none (or garbage) is given.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::minutes(5);

/// Window used by baseline queries when none (or garbage) is given.
pub const DEFAULT_BASELINE_WINDOW: Duration = Duration::hours(24);

/// Lookback used by `since` filters when none (or garbage) is given.
pub const DEFAULT_SINCE: Duration = Duration::hours(24);

/// How a rate query reports its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Number of matching events.
    #[default]
    Count,
    /// Matching events per minute of window.
    Rate,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Count => "count",
            Self::Rate => "rate",
        })
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "count" => Ok(Self::Count),
            "rate" => Ok(Self::Rate),
            other => Err(format!("unknown aggregation '{other}'")),
        }
    }
}

/// Extra event filters for signal queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalFilter {
    pub environment: Option<String>,
    /// Status of the event's group.
    pub status: Option<GroupStatus>,
}

/// Hourly event-count statistics over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Baseline {
    pub mean: f64,
    pub stddev: f64,
}

/// The most recent matching event, or all-`None` when there is none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LastEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parse `<N>m`, `<N>h` or `<N>d`.
#[must_use]
pub fn parse_window(text: &str) -> Option<Duration> {
    parse_amount(text, |n, unit| match unit {
        'm' => Duration::try_minutes(n),
        'h' => Duration::try_hours(n),
        'd' => Duration::try_days(n),
        _ => None,
    })
}

/// Parse `<N>h`, `<N>d` or `<N>w`.
#[must_use]
pub fn parse_since(text: &str) -> Option<Duration> {
    parse_amount(text, |n, unit| match unit {
        'h' => Duration::try_hours(n),
        'd' => Duration::try_days(n),
        'w' => Duration::try_weeks(n),
        _ => None,
    })
}

fn parse_amount(text: &str, to_duration: impl Fn(i64, char) -> Option<Duration>) -> Option<Duration> {
    let unit = text.chars().last()?;
    let digits = &text[..text.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    to_duration(digits.parse().ok()?, unit)
}

/// Events per minute over `window`, rounded to two decimals. Zero for an
/// empty window.
#[must_use]
pub fn rate_per_minute(count: i64, window: Duration) -> f64 {
    let minutes = window.num_milliseconds() as f64 / 60_000.0;
    if minutes <= 0.0 {
        return 0.0;
    }
    (count as f64 / minutes * 100.0).round() / 100.0
}

/// Mean and population standard deviation of per-bucket counts.
///
/// No buckets gives mean 0 and stddev 1. The stddev never drops below 1.
#[must_use]
pub fn baseline_from_counts(counts: &[i64]) -> Baseline {
    if counts.is_empty() {
        return Baseline {
            mean: 0.0,
            stddev: 1.0,
        };
    }
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<i64>() as f64 / n;
    let variance = counts
        .iter()
        .map(|c| (*c as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    Baseline {
        mean,
        stddev: variance.sqrt().max(1.0),
    }
}

/// `FROM ... WHERE` for events matching a class and filter.
fn event_scope(
    project_id: &str,
    error_class: Option<&str>,
    filter: &SignalFilter,
    param_values: &mut Vec<Box<dyn ToSql>>,
) -> String {
    let mut sql = String::from(" FROM error_events e");
    if filter.status.is_some() {
        sql.push_str(" JOIN error_groups g ON g.id = e.group_id");
    }
    sql.push_str(" WHERE e.project_id = ?");
    param_values.push(Box::new(project_id.to_string()));

    if let Some(class) = error_class {
        sql.push_str(" AND e.error_class = ?");
        param_values.push(Box::new(class.to_string()));
    }
    if let Some(env) = &filter.environment {
        sql.push_str(" AND e.environment = ?");
        param_values.push(Box::new(env.clone()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND g.status = ?");
        param_values.push(Box::new(status.as_str()));
    }
    sql
}

impl ReflexDb {
    /// Count events at or after `from`. `error_class = None` matches all.
    pub fn count_events(
        &self,
        project_id: &str,
        error_class: Option<&str>,
        filter: &SignalFilter,
        from: DateTime<Utc>,
    ) -> Result<i64> {
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut sql = String::from("SELECT COUNT(*)");
        sql.push_str(&event_scope(project_id, error_class, filter, &mut param_values));
        sql.push_str(" AND e.occurred_at >= ?");
        param_values.push(Box::new(to_db_time(&from)));

        let params: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
        self.conn
            .query_row(&sql, params.as_slice(), |row| row.get(0))
            .context("Failed to count events")
    }

    /// Count or per-minute rate of events in the window ending at `now`.
    pub fn rate(
        &self,
        project_id: &str,
        error_class: Option<&str>,
        filter: &SignalFilter,
        window: Duration,
        aggregation: Aggregation,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let count = self.count_events(project_id, error_class, filter, now - window)?;
        Ok(match aggregation {
            Aggregation::Count => count as f64,
            Aggregation::Rate => rate_per_minute(count, window),
        })
    }

    /// Event counts of the non-empty hours at or after `from`, oldest first.
    pub fn hourly_counts(
        &self,
        project_id: &str,
        error_class: Option<&str>,
        filter: &SignalFilter,
        from: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut sql = String::from("SELECT substr(e.occurred_at, 1, 13) AS bucket, COUNT(*)");
        sql.push_str(&event_scope(project_id, error_class, filter, &mut param_values));
        sql.push_str(" AND e.occurred_at >= ? GROUP BY bucket ORDER BY bucket");
        param_values.push(Box::new(to_db_time(&from)));

        let params: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare hourly count query")?;
        let counts = stmt
            .query_map(params.as_slice(), |row| row.get::<_, i64>(1))
            .context("Failed to query hourly counts")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read hourly count")?;
        Ok(counts)
    }

    /// Hourly baseline over the window ending at `now`.
    pub fn baseline(
        &self,
        project_id: &str,
        error_class: Option<&str>,
        filter: &SignalFilter,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Baseline> {
        let counts = self.hourly_counts(project_id, error_class, filter, now - window)?;
        Ok(baseline_from_counts(&counts))
    }

    /// Most recent matching event by `occurred_at`.
    pub fn last_event(
        &self,
        project_id: &str,
        error_class: Option<&str>,
        filter: &SignalFilter,
    ) -> Result<LastEvent> {
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut sql = String::from("SELECT e.occurred_at, e.error_class, e.message");
        sql.push_str(&event_scope(project_id, error_class, filter, &mut param_values));
        sql.push_str(" ORDER BY e.occurred_at DESC, e.created_at DESC LIMIT 1");

        let params: Vec<&dyn ToSql> = param_values.iter().map(AsRef::as_ref).collect();
        let found = optional_row(&self.conn, &sql, params.as_slice(), |row| {
            Ok(LastEvent {
                timestamp: optional_time_column(row, 0)?,
                value: Some(1),
                error_class: row.get(1)?,
                message: row.get(2)?,
            })
        })
        .context("Failed to query last event")?;
        Ok(found.unwrap_or_default())
    }
}
