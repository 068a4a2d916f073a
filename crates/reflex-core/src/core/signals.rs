//! Signal service: alerting queries over recent events.
//!
//! Error types are named the way alert rules name them: a class name, or
//! `all` (or nothing) for every class. Windows are `<N>m|h|d` strings and
//! fall back to a default when missing or unparseable.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::store::{
    parse_since, parse_window, Aggregation, Baseline, LastEvent, ReflexDb, SignalFilter,
    DEFAULT_BASELINE_WINDOW, DEFAULT_RATE_WINDOW, DEFAULT_SINCE,
};

use super::{CoreError, CoreResult};

/// Error type matching every class.
pub const ALL_ERRORS: &str = "all";

/// Result of a rate query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateReading {
    pub value: f64,
    pub error_type: String,
    /// The window as requested.
    pub window: Option<String>,
}

/// Start of a `since` period (`<N>h|d|w`) ending at `now`. Defaults to 24
/// hours.
#[must_use]
pub fn since_start(text: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    now - text.and_then(parse_since).unwrap_or(DEFAULT_SINCE)
}

fn window_or(text: Option<&str>, default: Duration) -> Duration {
    text.and_then(parse_window).unwrap_or(default)
}

/// `None` for the catch-all type.
fn class_filter(error_type: Option<&str>) -> Option<&str> {
    error_type.filter(|t| !t.is_empty() && *t != ALL_ERRORS)
}

/// Service for alerting signal queries.
pub struct SignalService<'a> {
    db: &'a ReflexDb,
}

impl<'a> SignalService<'a> {
    pub(crate) const fn new(db: &'a ReflexDb) -> Self {
        Self { db }
    }

    /// Count or per-minute rate of matching events in the window (default
    /// 5 minutes).
    pub fn rate(
        &self,
        project_id: &str,
        error_type: Option<&str>,
        window: Option<&str>,
        filter: &SignalFilter,
        aggregation: Aggregation,
    ) -> CoreResult<RateReading> {
        let value = self
            .db
            .rate(
                project_id,
                class_filter(error_type),
                filter,
                window_or(window, DEFAULT_RATE_WINDOW),
                aggregation,
                Utc::now(),
            )
            .map_err(CoreError::Internal)?;

        Ok(RateReading {
            value,
            error_type: error_type.unwrap_or(ALL_ERRORS).to_string(),
            window: window.map(str::to_string),
        })
    }

    /// Hourly baseline of matching events in the window (default 24 hours).
    pub fn baseline(
        &self,
        project_id: &str,
        error_type: Option<&str>,
        window: Option<&str>,
        filter: &SignalFilter,
    ) -> CoreResult<Baseline> {
        self.db
            .baseline(
                project_id,
                class_filter(error_type),
                filter,
                window_or(window, DEFAULT_BASELINE_WINDOW),
                Utc::now(),
            )
            .map_err(CoreError::Internal)
    }

    /// Most recent matching event. No match is not an error.
    pub fn last(
        &self,
        project_id: &str,
        error_type: Option<&str>,
        filter: &SignalFilter,
    ) -> CoreResult<LastEvent> {
        self.db
            .last_event(project_id, class_filter(error_type), filter)
            .map_err(CoreError::Internal)
    }
}
