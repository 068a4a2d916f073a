//! Group service: listing, search, lifecycle transitions, and reporting.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{ReflexConfig, Surface};
use crate::notify::{BroadcastMessage, Broadcaster};
use crate::store::{
    Analytics, ErrorGroup, GroupFilter, GroupStats, GroupStatus, ReflexDb, SearchResult,
    SortOrder,
};

use super::{CoreError, CoreResult};

/// Parse a status name, reporting unknown names as invalid arguments.
pub fn parse_status(text: &str) -> CoreResult<GroupStatus> {
    text.parse()
        .map_err(|message| CoreError::InvalidArgument { message })
}

/// Parse a sort name, reporting unknown names as invalid arguments.
pub fn parse_sort(text: &str) -> CoreResult<SortOrder> {
    text.parse()
        .map_err(|message| CoreError::InvalidArgument { message })
}

/// Service for error group operations.
pub struct GroupService<'a> {
    db: &'a ReflexDb,
    config: &'a ReflexConfig,
    broadcaster: &'a dyn Broadcaster,
}

impl<'a> GroupService<'a> {
    pub(crate) fn new(
        db: &'a ReflexDb,
        config: &'a ReflexConfig,
        broadcaster: &'a dyn Broadcaster,
    ) -> Self {
        Self {
            db,
            config,
            broadcaster,
        }
    }

    /// List groups matching a filter.
    ///
    /// The filter's limit is resolved against the surface's default and the
    /// configured cap.
    pub fn list(
        &self,
        project_id: &str,
        filter: &GroupFilter,
        surface: Surface,
    ) -> CoreResult<Vec<ErrorGroup>> {
        let filter = GroupFilter {
            limit: Some(self.config.limits.resolve(filter.limit, surface)),
            ..filter.clone()
        };
        self.db
            .list_groups(project_id, &filter)
            .map_err(CoreError::Internal)
    }

    /// Search groups, returning the total match count with the first page.
    pub fn search(&self, project_id: &str, filter: &GroupFilter) -> CoreResult<SearchResult> {
        let groups = self.list(project_id, filter, Surface::Tool)?;
        let count = self
            .db
            .count_groups(project_id, filter)
            .map_err(CoreError::Internal)?;
        Ok(SearchResult { groups, count })
    }

    /// Get a group within a project.
    ///
    /// Returns `Err(CoreError::GroupNotFound)` if the group does not exist
    /// in that project.
    pub fn get(&self, project_id: &str, group_id: &str) -> CoreResult<ErrorGroup> {
        self.get_optional(project_id, group_id)?
            .ok_or_else(|| CoreError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    /// Get a group within a project, returning `None` if not found.
    pub fn get_optional(&self, project_id: &str, group_id: &str) -> CoreResult<Option<ErrorGroup>> {
        self.db
            .get_group(project_id, group_id)
            .map_err(CoreError::Internal)
    }

    /// Mark a group resolved by `actor`.
    pub fn resolve(
        &self,
        project_id: &str,
        group_id: &str,
        actor: Option<&str>,
    ) -> CoreResult<ErrorGroup> {
        self.transition(project_id, group_id, GroupStatus::Resolved, actor)
    }

    /// Reopen a group, clearing its resolution.
    pub fn unresolve(&self, project_id: &str, group_id: &str) -> CoreResult<ErrorGroup> {
        self.transition(project_id, group_id, GroupStatus::Unresolved, None)
    }

    /// Ignore a group. New occurrences keep it ignored.
    pub fn ignore(&self, project_id: &str, group_id: &str) -> CoreResult<ErrorGroup> {
        self.transition(project_id, group_id, GroupStatus::Ignored, None)
    }

    /// Mute a group. New occurrences keep it muted.
    pub fn mute(&self, project_id: &str, group_id: &str) -> CoreResult<ErrorGroup> {
        self.transition(project_id, group_id, GroupStatus::Muted, None)
    }

    /// Overwrite a group's status, then announce it to live subscribers.
    #[tracing::instrument(skip(self))]
    pub fn transition(
        &self,
        project_id: &str,
        group_id: &str,
        status: GroupStatus,
        actor: Option<&str>,
    ) -> CoreResult<ErrorGroup> {
        let updated = self
            .db
            .set_status(project_id, group_id, status, actor, Utc::now())
            .map_err(CoreError::Internal)?;
        if !updated {
            return Err(CoreError::GroupNotFound {
                group_id: group_id.to_string(),
            });
        }
        info!(group_id, status = %status, "group status changed");

        let group = self.get(project_id, group_id)?;
        let message = BroadcastMessage::status_changed(&group);
        if let Err(e) = self.broadcaster.broadcast(project_id, &message) {
            warn!(group_id, error = %e, "status broadcast failed");
        }
        Ok(group)
    }

    /// Turn notifications for a group on or off.
    pub fn set_notifications(
        &self,
        project_id: &str,
        group_id: &str,
        enabled: bool,
    ) -> CoreResult<ErrorGroup> {
        let updated = self
            .db
            .set_notifications_enabled(project_id, group_id, enabled)
            .map_err(CoreError::Internal)?;
        if !updated {
            return Err(CoreError::GroupNotFound {
                group_id: group_id.to_string(),
            });
        }
        self.get(project_id, group_id)
    }

    /// Status counts, totals and top unresolved errors since `since`.
    pub fn stats(&self, project_id: &str, since: DateTime<Utc>) -> CoreResult<GroupStats> {
        self.db.stats(project_id, since).map_err(CoreError::Internal)
    }

    /// Breakdowns from `since` through today.
    pub fn analytics(&self, project_id: &str, since: DateTime<Utc>) -> CoreResult<Analytics> {
        self.db
            .analytics(project_id, since, Utc::now().date_naive())
            .map_err(CoreError::Internal)
    }
}
