//! Typed error types for the reflex-core service layer.

use thiserror::Error;

/// Result type alias for core service operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the reflex-core service layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A project was not found.
    #[error("Project not found: {project_id}")]
    ProjectNotFound { project_id: String },

    /// An error group was not found in the caller's project.
    #[error("Error group not found: {group_id}")]
    GroupNotFound { group_id: String },

    /// An event was not found in the caller's project.
    #[error("Event not found: {event_id}")]
    EventNotFound { event_id: String },

    /// The identity collaborator rejected the credential.
    #[error("Invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    /// A caller-supplied argument could not be interpreted.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An internal storage or database error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether this is one of the not-found conditions.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProjectNotFound { .. } | Self::GroupNotFound { .. } | Self::EventNotFound { .. }
        )
    }
}
