//! Side-effect collaborators: live broadcast and notification scheduling.
//!
//! Both are fire-and-forget from the ingest path. Callers log failures and
//! carry on; nothing here can fail an ingest.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{ErrorEvent, ErrorGroup, GroupStatus, ReflexDb};

/// Group fields sent to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub id: String,
    pub error_class: String,
    pub message: Option<String>,
    pub event_count: i64,
    pub last_seen_at: DateTime<Utc>,
}

/// Event fields sent to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSummary {
    pub id: String,
    pub environment: Option<String>,
    pub commit: Option<String>,
}

/// A message for live subscribers of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    NewError {
        error_group: GroupSummary,
        event: EventSummary,
    },
    ErrorResolved {
        error_group_id: String,
        status: GroupStatus,
    },
    ErrorIgnored {
        error_group_id: String,
        status: GroupStatus,
    },
    ErrorUnresolved {
        error_group_id: String,
        status: GroupStatus,
    },
    ErrorMuted {
        error_group_id: String,
        status: GroupStatus,
    },
}

impl BroadcastMessage {
    #[must_use]
    pub fn new_error(group: &ErrorGroup, event: &ErrorEvent) -> Self {
        Self::NewError {
            error_group: GroupSummary {
                id: group.id.clone(),
                error_class: group.error_class.clone(),
                message: group.short_message(),
                event_count: group.event_count,
                last_seen_at: group.last_seen_at,
            },
            event: EventSummary {
                id: event.id.clone(),
                environment: event.environment.clone(),
                commit: event.commit.clone(),
            },
        }
    }

    /// The message announcing that `group` now has its current status.
    #[must_use]
    pub fn status_changed(group: &ErrorGroup) -> Self {
        let error_group_id = group.id.clone();
        let status = group.status;
        match status {
            GroupStatus::Resolved => Self::ErrorResolved {
                error_group_id,
                status,
            },
            GroupStatus::Ignored => Self::ErrorIgnored {
                error_group_id,
                status,
            },
            GroupStatus::Unresolved => Self::ErrorUnresolved {
                error_group_id,
                status,
            },
            GroupStatus::Muted => Self::ErrorMuted {
                error_group_id,
                status,
            },
        }
    }

    /// The wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NewError { .. } => "new_error",
            Self::ErrorResolved { .. } => "error_resolved",
            Self::ErrorIgnored { .. } => "error_ignored",
            Self::ErrorUnresolved { .. } => "error_unresolved",
            Self::ErrorMuted { .. } => "error_muted",
        }
    }
}

/// Delivers messages to live subscribers of a project.
pub trait Broadcaster {
    fn broadcast(&self, project_id: &str, message: &BroadcastMessage) -> Result<()>;
}

impl<T: Broadcaster + ?Sized> Broadcaster for Arc<T> {
    fn broadcast(&self, project_id: &str, message: &BroadcastMessage) -> Result<()> {
        (**self).broadcast(project_id, message)
    }
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _project_id: &str, _message: &BroadcastMessage) -> Result<()> {
        Ok(())
    }
}

/// Emits each message as a structured log record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBroadcaster;

impl Broadcaster for TracingBroadcaster {
    fn broadcast(&self, project_id: &str, message: &BroadcastMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        tracing::info!(
            target: "reflex::broadcast",
            project_id,
            kind = message.kind(),
            payload = %payload,
            "broadcast"
        );
        Ok(())
    }
}

/// Accepts notification work for asynchronous delivery.
pub trait NotificationQueue {
    fn enqueue(&self, group_id: &str, event_id: &str) -> Result<()>;
}

impl<T: NotificationQueue + ?Sized> NotificationQueue for Arc<T> {
    fn enqueue(&self, group_id: &str, event_id: &str) -> Result<()> {
        (**self).enqueue(group_id, event_id)
    }
}

/// Queue backed by the `notification_jobs` table.
pub struct OutboxQueue<'a> {
    db: &'a ReflexDb,
}

impl<'a> OutboxQueue<'a> {
    #[must_use]
    pub const fn new(db: &'a ReflexDb) -> Self {
        Self { db }
    }
}

impl NotificationQueue for OutboxQueue<'_> {
    fn enqueue(&self, group_id: &str, event_id: &str) -> Result<()> {
        self.db.enqueue_job(group_id, event_id, Utc::now()).map(|_| ())
    }
}

/// A pending job with the records it refers to, handed to a deliverer.
#[derive(Debug, Clone)]
pub struct Notification {
    pub job_id: String,
    pub group: ErrorGroup,
    pub event: ErrorEvent,
}

/// What happened to the jobs in one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub dropped: usize,
    pub failed: usize,
}
