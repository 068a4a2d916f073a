//! Project service: tenant lookup, lazy creation, and maintenance.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::store::{Project, ReflexDb};

use super::{CoreError, CoreResult};

/// Environment label of projects created without one.
pub const DEFAULT_ENVIRONMENT: &str = "live";

/// Plan feature that grants access to error tracking.
pub const PRODUCT_FEATURE: &str = "reflex";

/// A credential as resolved by the identity collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProjectIdentity {
    pub valid: bool,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub environment: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

impl ProjectIdentity {
    #[must_use]
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}

/// Service for project operations.
pub struct ProjectService<'a> {
    db: &'a ReflexDb,
}

impl<'a> ProjectService<'a> {
    pub(crate) const fn new(db: &'a ReflexDb) -> Self {
        Self { db }
    }

    /// Find the project for a platform identifier, creating it on first use.
    ///
    /// Name and environment only apply when the project is created.
    pub fn find_or_create_for_platform(
        &self,
        platform_project_id: &str,
        name: Option<&str>,
        environment: Option<&str>,
    ) -> CoreResult<Project> {
        if platform_project_id.trim().is_empty() {
            return Err(CoreError::InvalidArgument {
                message: "platform project id must not be empty".to_string(),
            });
        }
        self.db
            .find_or_create_project(
                platform_project_id,
                name,
                environment.unwrap_or(DEFAULT_ENVIRONMENT),
                Utc::now(),
            )
            .map_err(CoreError::Internal)
    }

    /// Resolve the project behind a validated credential.
    ///
    /// Returns `Err(CoreError::InvalidIdentity)` if the credential was
    /// rejected, names no project, or lacks the product feature.
    #[tracing::instrument(skip(self, identity))]
    pub fn ensure_for_identity(&self, identity: &ProjectIdentity) -> CoreResult<Project> {
        if !identity.valid {
            return Err(CoreError::InvalidIdentity {
                reason: "credential rejected".to_string(),
            });
        }
        let Some(platform_project_id) = identity.project_id.as_deref() else {
            return Err(CoreError::InvalidIdentity {
                reason: "identity names no project".to_string(),
            });
        };
        if !identity.has_feature(PRODUCT_FEATURE) {
            return Err(CoreError::InvalidIdentity {
                reason: format!("plan does not include '{PRODUCT_FEATURE}'"),
            });
        }

        self.find_or_create_for_platform(
            platform_project_id,
            identity.project_name.as_deref(),
            identity.environment.as_deref(),
        )
    }

    /// Get a project by ID.
    ///
    /// Returns `Err(CoreError::ProjectNotFound)` if it does not exist.
    pub fn get(&self, project_id: &str) -> CoreResult<Project> {
        self.db
            .get_project(project_id)
            .map_err(CoreError::Internal)?
            .ok_or_else(|| CoreError::ProjectNotFound {
                project_id: project_id.to_string(),
            })
    }

    /// Find a project by platform identifier without creating it.
    pub fn find_by_platform_id(&self, platform_project_id: &str) -> CoreResult<Option<Project>> {
        self.db
            .find_project_by_platform_id(platform_project_id)
            .map_err(CoreError::Internal)
    }

    /// Delete a project with all of its groups, events, and jobs.
    pub fn delete(&self, project_id: &str) -> CoreResult<()> {
        if !self.db.delete_project(project_id).map_err(CoreError::Internal)? {
            return Err(CoreError::ProjectNotFound {
                project_id: project_id.to_string(),
            });
        }
        info!(project_id, "deleted project");
        Ok(())
    }

    /// Recompute a project's counter caches. Returns the number of records
    /// that were corrected.
    pub fn reconcile(&self, project_id: &str) -> CoreResult<usize> {
        self.get(project_id)?;
        let fixed = self
            .db
            .reconcile_counters(project_id)
            .map_err(CoreError::Internal)?;
        if fixed > 0 {
            info!(project_id, fixed, "reconciled counters");
        }
        Ok(fixed)
    }
}
