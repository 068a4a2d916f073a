//! Service layer for reflex-core.
//!
//! Provides typed, high-level APIs for ingestion, group lifecycle, queries,
//! signals, and notification work. The service layer owns the database
//! handle and the side-effect collaborators behind one facade.
//!
//! # Usage
//!
//! ```no_run
//! use reflex_core::config::ReflexConfig;
//! use reflex_core::core::ReflexServices;
//! use serde_json::json;
//!
//! let services = ReflexServices::open(ReflexConfig::default()).unwrap();
//! let project = services
//!     .projects()
//!     .find_or_create_for_platform("prj_123", None, None)
//!     .unwrap();
//! let result = services
//!     .processor()
//!     .process(&project, &json!({"error_class": "RuntimeError", "message": "boom"}))
//!     .unwrap();
//! println!("{}", result.group.fingerprint);
//! ```

pub mod errors;
pub mod events;
pub mod groups;
pub mod notifications;
pub mod processor;
pub mod projects;
pub mod signals;

pub use errors::{CoreError, CoreResult};

use crate::config::ReflexConfig;
use crate::notify::{Broadcaster, NotificationQueue, NullBroadcaster};
use crate::store::ReflexDb;

/// Facade providing all reflex service APIs.
///
/// Owns an initialized database, the configuration, and the broadcast and
/// notification collaborators. Without an explicit queue, notifications go
/// to the database outbox.
pub struct ReflexServices {
    db: ReflexDb,
    config: ReflexConfig,
    broadcaster: Box<dyn Broadcaster>,
    queue: Option<Box<dyn NotificationQueue>>,
}

impl ReflexServices {
    /// Open the configured database and initialize its schema.
    pub fn open(config: ReflexConfig) -> CoreResult<Self> {
        let db = ReflexDb::open(&config.database).map_err(CoreError::Internal)?;
        Self::with_db(db, config)
    }

    /// Use an already opened database, initializing its schema.
    pub fn with_db(db: ReflexDb, config: ReflexConfig) -> CoreResult<Self> {
        db.init_schema().map_err(CoreError::Internal)?;
        Ok(Self {
            db,
            config,
            broadcaster: Box::new(NullBroadcaster),
            queue: None,
        })
    }

    /// Services over a fresh in-memory database.
    pub fn in_memory(config: ReflexConfig) -> CoreResult<Self> {
        let db = ReflexDb::open_in_memory().map_err(CoreError::Internal)?;
        Self::with_db(db, config)
    }

    /// Replace the live broadcast collaborator.
    #[must_use]
    pub fn with_broadcaster(mut self, broadcaster: impl Broadcaster + 'static) -> Self {
        self.broadcaster = Box::new(broadcaster);
        self
    }

    /// Send notification work to `queue` instead of the database outbox.
    #[must_use]
    pub fn with_notification_queue(mut self, queue: impl NotificationQueue + 'static) -> Self {
        self.queue = Some(Box::new(queue));
        self
    }

    /// Access project operations.
    #[must_use]
    pub fn projects(&self) -> projects::ProjectService<'_> {
        projects::ProjectService::new(&self.db)
    }

    /// Access the ingest pipeline.
    #[must_use]
    pub fn processor(&self) -> processor::ErrorProcessor<'_> {
        processor::ErrorProcessor::new(
            &self.db,
            &self.config,
            self.broadcaster.as_ref(),
            self.queue.as_deref(),
        )
    }

    /// Access error group operations.
    #[must_use]
    pub fn groups(&self) -> groups::GroupService<'_> {
        groups::GroupService::new(&self.db, &self.config, self.broadcaster.as_ref())
    }

    /// Access event operations.
    #[must_use]
    pub fn events(&self) -> events::EventService<'_> {
        events::EventService::new(&self.db, &self.config)
    }

    /// Access alerting signal queries.
    #[must_use]
    pub fn signals(&self) -> signals::SignalService<'_> {
        signals::SignalService::new(&self.db)
    }

    /// Access the notification outbox.
    #[must_use]
    pub fn notifications(&self) -> notifications::NotificationService<'_> {
        notifications::NotificationService::new(&self.db)
    }

    /// Get a reference to the underlying database.
    ///
    /// Useful for advanced queries not covered by the service layer.
    #[must_use]
    pub const fn db(&self) -> &ReflexDb {
        &self.db
    }

    /// Get a reference to the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReflexConfig {
        &self.config
    }
}
