//! Notification service: works the database outbox.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::notify::{DrainReport, Notification};
use crate::store::{JobStatus, NotificationJob, ReflexDb};

use super::{CoreError, CoreResult};

/// Deliverer that only writes a log record.
pub fn log_delivery(notification: &Notification) -> Result<()> {
    info!(
        target: "reflex::notification",
        group_id = %notification.group.id,
        event_id = %notification.event.id,
        "New error: {} - {}",
        notification.group.error_class,
        notification.group.short_message().unwrap_or_default()
    );
    Ok(())
}

/// Service for the notification outbox.
pub struct NotificationService<'a> {
    db: &'a ReflexDb,
}

impl<'a> NotificationService<'a> {
    pub(crate) const fn new(db: &'a ReflexDb) -> Self {
        Self { db }
    }

    /// Pending jobs, oldest first.
    pub fn pending(&self, limit: usize) -> CoreResult<Vec<NotificationJob>> {
        self.db.pending_jobs(limit).map_err(CoreError::Internal)
    }

    /// Hand up to `limit` pending jobs to `deliver`.
    ///
    /// Jobs whose group or event is gone are dropped without calling
    /// `deliver`. A delivery error marks that job failed and the drain
    /// moves on.
    #[tracing::instrument(skip(self, deliver))]
    pub fn drain<F>(&self, limit: usize, mut deliver: F) -> CoreResult<DrainReport>
    where
        F: FnMut(&Notification) -> Result<()>,
    {
        let mut report = DrainReport::default();

        for job in self.pending(limit)? {
            let group = self
                .db
                .get_group_by_id(&job.group_id)
                .map_err(CoreError::Internal)?;
            let event = self
                .db
                .get_event_by_id(&job.event_id)
                .map_err(CoreError::Internal)?;

            let (status, error) = match (group, event) {
                (Some(group), Some(event)) => {
                    let notification = Notification {
                        job_id: job.id.clone(),
                        group,
                        event,
                    };
                    match deliver(&notification) {
                        Ok(()) => {
                            report.delivered += 1;
                            (JobStatus::Delivered, None)
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "notification delivery failed");
                            report.failed += 1;
                            (JobStatus::Failed, Some(e.to_string()))
                        }
                    }
                }
                _ => {
                    report.dropped += 1;
                    (JobStatus::Dropped, None)
                }
            };

            self.db
                .finish_job(&job.id, status, error.as_deref(), Utc::now())
                .map_err(CoreError::Internal)?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReflexConfig;
    use crate::core::ReflexServices;
    use serde_json::json;

    fn services_with_jobs() -> (ReflexServices, Vec<String>) {
        let services = ReflexServices::in_memory(ReflexConfig::default()).unwrap();
        let project = services
            .projects()
            .find_or_create_for_platform("prj_notify", None, None)
            .unwrap();
        let mut groups = Vec::new();
        for class in ["A", "B", "C"] {
            let result = services
                .processor()
                .process(&project, &json!({"error_class": class}))
                .unwrap();
            assert!(result.notification_scheduled);
            groups.push(result.group.id);
        }
        (services, groups)
    }

    #[test]
    fn test_drain_delivers_pending_jobs() {
        let (services, _) = services_with_jobs();
        let mut seen = Vec::new();
        let report = services
            .notifications()
            .drain(10, |n| {
                seen.push(n.group.error_class.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(report.delivered, 3);
        seen.sort();
        assert_eq!(seen, vec!["A", "B", "C"]);
        assert!(services.notifications().pending(10).unwrap().is_empty());
    }

    #[test]
    fn test_drain_drops_jobs_for_missing_records() {
        let (services, groups) = services_with_jobs();
        services
            .db()
            .conn()
            .execute("DELETE FROM error_groups WHERE id = ?", [&groups[1]])
            .unwrap();

        let report = services.notifications().drain(10, log_delivery).unwrap();
        assert_eq!(
            report,
            DrainReport {
                delivered: 2,
                dropped: 1,
                failed: 0
            }
        );
    }

    #[test]
    fn test_drain_records_failures() {
        let (services, _) = services_with_jobs();
        let report = services
            .notifications()
            .drain(2, |_| anyhow::bail!("webhook returned 500"))
            .unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(services.notifications().pending(10).unwrap().len(), 1);

        let error: String = services
            .db()
            .conn()
            .query_row(
                "SELECT last_error FROM notification_jobs WHERE status = 'failed' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(error, "webhook returned 500");
    }
}
