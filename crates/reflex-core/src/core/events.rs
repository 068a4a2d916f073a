//! Event service: single events and per-group history.

use serde::Serialize;

use crate::config::{ReflexConfig, Surface};
use crate::store::{ErrorEvent, ReflexDb};

use super::{CoreError, CoreResult};

/// Recent events of one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupEvents {
    pub group_id: String,
    /// All events ever recorded for the group.
    pub total_count: i64,
    pub events: Vec<ErrorEvent>,
}

/// Service for event operations.
pub struct EventService<'a> {
    db: &'a ReflexDb,
    config: &'a ReflexConfig,
}

impl<'a> EventService<'a> {
    pub(crate) const fn new(db: &'a ReflexDb, config: &'a ReflexConfig) -> Self {
        Self { db, config }
    }

    /// Get an event within a project.
    ///
    /// Returns `Err(CoreError::EventNotFound)` if the event does not exist
    /// in that project.
    pub fn get(&self, project_id: &str, event_id: &str) -> CoreResult<ErrorEvent> {
        self.db
            .get_event(project_id, event_id)
            .map_err(CoreError::Internal)?
            .ok_or_else(|| CoreError::EventNotFound {
                event_id: event_id.to_string(),
            })
    }

    /// Most recent events of a group, optionally for one environment.
    pub fn for_group(
        &self,
        project_id: &str,
        group_id: &str,
        environment: Option<&str>,
        limit: Option<usize>,
    ) -> CoreResult<GroupEvents> {
        let group = self
            .db
            .get_group(project_id, group_id)
            .map_err(CoreError::Internal)?
            .ok_or_else(|| CoreError::GroupNotFound {
                group_id: group_id.to_string(),
            })?;
        let limit = self.config.limits.resolve(limit, Surface::Api);
        let events = self
            .db
            .group_events(project_id, group_id, environment, limit)
            .map_err(CoreError::Internal)?;

        Ok(GroupEvents {
            group_id: group.id,
            total_count: group.event_count,
            events,
        })
    }
}
