//! Error processor: turns a raw report into a stored, grouped occurrence.
//!
//! The durable work (group upsert, event insert, counter update) commits in
//! one immediate transaction. Broadcast and notification scheduling run
//! afterwards and can only log their failures.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backtrace::{self, RawFrame};
use crate::config::ReflexConfig;
use crate::fingerprint;
use crate::notify::{BroadcastMessage, Broadcaster, NotificationQueue, OutboxQueue};
use crate::payload::{sanitize_params, ErrorPayload};
use crate::store::{ErrorEvent, ErrorGroup, NewEvent, NewGroup, Project, ReflexDb};

use super::{CoreError, CoreResult};

/// Stored class of reports that don't name one.
pub const UNKNOWN_ERROR_CLASS: &str = "UnknownError";

/// Class given to log-message reports.
pub const MESSAGE_ERROR_CLASS: &str = "Message";

/// Outcome of processing one report.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub group: ErrorGroup,
    pub event: ErrorEvent,
    /// Whether this report created the group.
    pub created: bool,
    /// Whether a notification job was handed to the queue.
    pub notification_scheduled: bool,
}

/// IDs of one processed report in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub event_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub processed: usize,
    pub results: Vec<BatchItem>,
}

/// The ingest pipeline for one project at a time.
pub struct ErrorProcessor<'a> {
    db: &'a ReflexDb,
    config: &'a ReflexConfig,
    broadcaster: &'a dyn Broadcaster,
    queue: Option<&'a dyn NotificationQueue>,
}

impl<'a> ErrorProcessor<'a> {
    pub(crate) fn new(
        db: &'a ReflexDb,
        config: &'a ReflexConfig,
        broadcaster: &'a dyn Broadcaster,
        queue: Option<&'a dyn NotificationQueue>,
    ) -> Self {
        Self {
            db,
            config,
            broadcaster,
            queue,
        }
    }

    /// Process a raw error report.
    pub fn process(&self, project: &Project, raw: &Value) -> CoreResult<ProcessResult> {
        self.process_at(project, raw, Utc::now())
    }

    /// Process a raw error report as if received at `now`.
    pub fn process_at(
        &self,
        project: &Project,
        raw: &Value,
        now: DateTime<Utc>,
    ) -> CoreResult<ProcessResult> {
        self.ingest(project, &ErrorPayload::from_value(raw), now)
    }

    /// Process a log message. The report is grouped under the `Message`
    /// class whatever class it carries.
    pub fn process_message(&self, project: &Project, raw: &Value) -> CoreResult<ProcessResult> {
        let mut payload = ErrorPayload::from_value(raw);
        payload.error_class = Some(MESSAGE_ERROR_CLASS.to_string());
        self.ingest(project, &payload, Utc::now())
    }

    /// Process several reports one after another.
    ///
    /// Each report commits on its own; the first failure stops the batch.
    pub fn process_batch(&self, project: &Project, raws: &[Value]) -> CoreResult<BatchResult> {
        let mut results = Vec::with_capacity(raws.len());
        for raw in raws {
            let result = self.process(project, raw)?;
            results.push(BatchItem {
                event_id: result.event.id,
                group_id: result.group.id,
            });
        }
        Ok(BatchResult {
            processed: results.len(),
            results,
        })
    }

    #[tracing::instrument(skip(self, project, payload), fields(project_id = %project.id))]
    fn ingest(
        &self,
        project: &Project,
        payload: &ErrorPayload,
        now: DateTime<Utc>,
    ) -> CoreResult<ProcessResult> {
        let fingerprint = fingerprint::generate(payload);
        let new_group = group_fields(payload, fingerprint);
        let new_event = self.new_event(payload, now);

        let tx = self.db.immediate_transaction().map_err(CoreError::Internal)?;
        let (group, created) = self
            .db
            .find_or_create_group(&project.id, &new_group, now)
            .map_err(CoreError::Internal)?;
        let event_id = self
            .db
            .insert_event(&project.id, &group.id, &new_event, now)
            .map_err(CoreError::Internal)?;
        self.db
            .record_occurrence(
                &group.id,
                new_event.occurred_at,
                new_event.commit.as_deref(),
                new_event.environment.as_deref(),
            )
            .map_err(CoreError::Internal)?;
        tx.commit().context("Failed to commit ingest")?;

        if created {
            debug!(group_id = %group.id, fingerprint = %group.fingerprint, "created error group");
        } else {
            debug!(group_id = %group.id, "matched error group");
        }

        let mut group = self
            .db
            .get_group(&project.id, &group.id)
            .map_err(CoreError::Internal)?
            .ok_or_else(|| CoreError::GroupNotFound {
                group_id: group.id.clone(),
            })?;
        let event = self
            .db
            .get_event(&project.id, &event_id)
            .map_err(CoreError::Internal)?
            .ok_or(CoreError::EventNotFound { event_id })?;

        self.broadcast_new_error(&group, &event);
        let notification_scheduled = self.maybe_notify(&mut group, &event, now);

        Ok(ProcessResult {
            group,
            event,
            created,
            notification_scheduled,
        })
    }

    fn new_event(&self, payload: &ErrorPayload, now: DateTime<Utc>) -> NewEvent {
        let sensitive_keys = self.config.sanitize.normalized_keys();
        NewEvent {
            error_class: error_class(payload),
            message: payload.message.clone(),
            backtrace: backtrace::normalize(&payload.backtrace),
            environment: payload.environment.clone(),
            commit: payload.commit.clone(),
            branch: payload.branch.clone(),
            release: payload.release.clone(),
            server_name: payload.server_name.clone(),
            request_id: payload.request.id.clone(),
            request_method: payload.request.method.clone(),
            request_url: payload.request.url.clone(),
            request_path: payload.request.path.clone(),
            request_params: sanitize_params(&payload.request.params, &sensitive_keys),
            request_headers: payload.request.headers.clone(),
            user_id: payload.user.id.clone(),
            user_email: payload.user.email.clone(),
            user_data: payload.user.data.clone(),
            context: payload.context.clone(),
            tags: payload.tags.clone(),
            extra: payload.extra.clone(),
            breadcrumbs: payload.breadcrumbs.clone(),
            occurred_at: payload.timestamp.resolve(now),
        }
    }

    fn broadcast_new_error(&self, group: &ErrorGroup, event: &ErrorEvent) {
        let message = BroadcastMessage::new_error(group, event);
        if let Err(e) = self.broadcaster.broadcast(&group.project_id, &message) {
            warn!(group_id = %group.id, error = %e, "new_error broadcast failed");
        }
    }

    /// Hand a notification to the queue if the group is due one.
    ///
    /// The group is stamped as notified right after enqueueing, before any
    /// delivery happens. `group` is updated to match the stored stamp.
    fn maybe_notify(&self, group: &mut ErrorGroup, event: &ErrorEvent, now: DateTime<Utc>) -> bool {
        if !group.notification_due(now, self.config.notifications.throttle()) {
            return false;
        }

        let enqueued = match self.queue {
            Some(queue) => queue.enqueue(&group.id, &event.id),
            None => OutboxQueue::new(self.db).enqueue(&group.id, &event.id),
        };
        if let Err(e) = enqueued {
            warn!(group_id = %group.id, error = %e, "notification enqueue failed");
            return false;
        }

        match self.db.stamp_notified(&group.id, now) {
            Ok(()) => group.last_notified_at = Some(now),
            Err(e) => warn!(group_id = %group.id, error = %e, "failed to stamp last_notified_at"),
        }
        info!(group_id = %group.id, event_id = %event.id, "notification scheduled");
        true
    }
}

/// Representative group fields, taken from the report's first frame.
fn group_fields(payload: &ErrorPayload, fingerprint: String) -> NewGroup {
    let location = payload
        .backtrace
        .first()
        .map(RawFrame::location)
        .unwrap_or_default();

    NewGroup {
        fingerprint,
        error_class: error_class(payload),
        message: payload.message.clone(),
        file_path: location.file,
        line_number: location.line,
        function_name: location.function,
        controller: payload.request.controller.clone(),
        action: payload.request.action.clone(),
    }
}

fn error_class(payload: &ErrorPayload) -> String {
    payload
        .error_class
        .clone()
        .unwrap_or_else(|| UNKNOWN_ERROR_CLASS.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ReflexServices;
    use crate::store::GroupStatus;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(String, BroadcastMessage)>>,
    }

    impl Broadcaster for Recorder {
        fn broadcast(&self, project_id: &str, message: &BroadcastMessage) -> anyhow::Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((project_id.to_string(), message.clone()));
            Ok(())
        }
    }

    struct FailingBroadcaster;

    impl Broadcaster for FailingBroadcaster {
        fn broadcast(&self, _: &str, _: &BroadcastMessage) -> anyhow::Result<()> {
            anyhow::bail!("socket closed")
        }
    }

    #[derive(Default)]
    struct MemoryQueue {
        jobs: Mutex<Vec<(String, String)>>,
    }

    impl NotificationQueue for MemoryQueue {
        fn enqueue(&self, group_id: &str, event_id: &str) -> anyhow::Result<()> {
            self.jobs
                .lock()
                .unwrap()
                .push((group_id.to_string(), event_id.to_string()));
            Ok(())
        }
    }

    struct FailingQueue;

    impl NotificationQueue for FailingQueue {
        fn enqueue(&self, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("queue unavailable")
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup(services: &ReflexServices) -> Project {
        services
            .projects()
            .find_or_create_for_platform("prj_proc", Some("Shop"), None)
            .unwrap()
    }

    fn report() -> Value {
        json!({
            "error_class": "NoMethodError",
            "message": "undefined method 'foo' for nil",
            "backtrace": ["app/models/user.rb:42:in `full_name'", "/gems/ar/lib/ar.rb:10:in `save'"],
            "environment": "production",
            "commit": "abc123",
            "timestamp": "2026-03-01T11:59:00Z",
            "request": {
                "controller": "UsersController",
                "action": "show",
                "params": {"id": "7", "user": {"password": "hunter2"}}
            },
            "user": {"id": "u1", "email": "u1@example.com"}
        })
    }

    #[test]
    fn test_process_creates_group_and_event() {
        let services = ReflexServices::in_memory(ReflexConfig::default()).unwrap();
        let project = setup(&services);

        let result = services.processor().process_at(&project, &report(), t0()).unwrap();
        assert!(result.created);
        assert_eq!(result.group.fingerprint.len(), 16);
        assert_eq!(result.group.event_count, 1);
        assert_eq!(result.group.status, GroupStatus::Unresolved);
        assert_eq!(result.group.file_path.as_deref(), Some("app/models/user.rb"));
        assert_eq!(result.group.line_number, Some(42));
        assert_eq!(result.group.function_name.as_deref(), Some("full_name"));
        assert_eq!(result.group.controller.as_deref(), Some("UsersController"));
        assert_eq!(result.group.last_commit.as_deref(), Some("abc123"));

        let event = &result.event;
        assert_eq!(event.occurred_at, Utc.with_ymd_and_hms(2026, 3, 1, 11, 59, 0).unwrap());
        assert_eq!(event.backtrace.len(), 2);
        assert!(event.backtrace[0].in_app);
        assert!(!event.backtrace[1].in_app);
        assert_eq!(event.request_params["user"]["password"], json!("[FILTERED]"));
        assert_eq!(event.request_params["id"], json!("7"));
        assert_eq!(event.user_email.as_deref(), Some("u1@example.com"));
    }

    #[test]
    fn test_process_twice_groups_once() {
        let services = ReflexServices::in_memory(ReflexConfig::default()).unwrap();
        let project = setup(&services);

        let first = services.processor().process_at(&project, &report(), t0()).unwrap();
        let second = services.processor().process_at(&project, &report(), t0()).unwrap();
        assert!(!second.created);
        assert_eq!(first.group.id, second.group.id);
        assert_eq!(second.group.event_count, 2);
        assert_ne!(first.event.id, second.event.id);

        let project = services.projects().get(&project.id).unwrap();
        assert_eq!(project.error_count, 1);
        assert_eq!(project.event_count, 2);
    }

    #[test]
    fn test_missing_class_is_stored_as_unknown() {
        let services = ReflexServices::in_memory(ReflexConfig::default()).unwrap();
        let project = setup(&services);
        let result = services
            .processor()
            .process_at(&project, &json!({"message": "boom", "timestamp": "garbage"}), t0())
            .unwrap();
        assert_eq!(result.group.error_class, "UnknownError");
        assert_eq!(result.event.occurred_at, t0());
    }

    #[test]
    fn test_process_message_forces_class() {
        let services = ReflexServices::in_memory(ReflexConfig::default()).unwrap();
        let project = setup(&services);
        let result = services
            .processor()
            .process_message(&project, &json!({"error_class": "Ignored", "message": "cache warmed"}))
            .unwrap();
        assert_eq!(result.group.error_class, "Message");
        assert_eq!(result.event.message.as_deref(), Some("cache warmed"));
    }

    #[test]
    fn test_process_batch() {
        let services = ReflexServices::in_memory(ReflexConfig::default()).unwrap();
        let project = setup(&services);
        let batch = services
            .processor()
            .process_batch(&project, &[report(), report(), json!({"error_class": "Other"})])
            .unwrap();
        assert_eq!(batch.processed, 3);
        assert_eq!(batch.results[0].group_id, batch.results[1].group_id);
        assert_ne!(batch.results[0].group_id, batch.results[2].group_id);
    }

    #[test]
    fn test_broadcasts_new_error() {
        let recorder = Arc::new(Recorder::default());
        let services = ReflexServices::in_memory(ReflexConfig::default())
            .unwrap()
            .with_broadcaster(Arc::clone(&recorder));
        let project = setup(&services);

        let result = services.processor().process_at(&project, &report(), t0()).unwrap();
        let messages = recorder.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, project.id);
        assert_eq!(messages[0].1, BroadcastMessage::new_error(&result.group, &result.event));
    }

    #[test]
    fn test_side_effect_failures_do_not_fail_ingest() {
        let services = ReflexServices::in_memory(ReflexConfig::default())
            .unwrap()
            .with_broadcaster(FailingBroadcaster)
            .with_notification_queue(FailingQueue);
        let project = setup(&services);

        let result = services.processor().process_at(&project, &report(), t0()).unwrap();
        assert!(!result.notification_scheduled);
        assert_eq!(result.group.event_count, 1);
        let group = services.groups().get(&project.id, &result.group.id).unwrap();
        assert_eq!(group.last_notified_at, None);
    }

    #[test]
    fn test_notifications_are_throttled() {
        let queue = Arc::new(MemoryQueue::default());
        let services = ReflexServices::in_memory(ReflexConfig::default())
            .unwrap()
            .with_notification_queue(Arc::clone(&queue));
        let project = setup(&services);
        let processor = services.processor();

        let first = processor.process_at(&project, &report(), t0()).unwrap();
        assert!(first.notification_scheduled);
        let second = processor
            .process_at(&project, &report(), t0() + Duration::minutes(4))
            .unwrap();
        assert!(!second.notification_scheduled);
        let third = processor
            .process_at(&project, &report(), t0() + Duration::minutes(5))
            .unwrap();
        assert!(third.notification_scheduled);

        assert_eq!(first.group.last_notified_at, Some(t0()));
        assert_eq!(second.group.last_notified_at, Some(t0()));
        assert_eq!(
            third.group.last_notified_at,
            Some(t0() + Duration::minutes(5))
        );

        let jobs = queue.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0], (first.group.id.clone(), first.event.id.clone()));
    }

    #[test]
    fn test_disabled_notifications_skip_queue() {
        let services = ReflexServices::in_memory(ReflexConfig::default()).unwrap();
        let project = setup(&services);
        let first = services.processor().process_at(&project, &report(), t0()).unwrap();
        services
            .groups()
            .set_notifications(&project.id, &first.group.id, false)
            .unwrap();

        let later = services
            .processor()
            .process_at(&project, &report(), t0() + Duration::hours(1))
            .unwrap();
        assert!(!later.notification_scheduled);
        assert_eq!(later.group.last_notified_at, Some(t0()));
        // Only the first occurrence reached the outbox
        assert_eq!(services.db().pending_jobs(10).unwrap().len(), 1);
    }
}
