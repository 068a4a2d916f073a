//! Implementation of `reflex ingest`.

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

use reflex_core::core::processor::ProcessResult;
use reflex_core::core::ReflexServices;
use reflex_core::store::{GroupStatus, Project};

use crate::output::{Formatter, OutputFormat};

/// What one ingested report turned into.
#[derive(Debug, Serialize)]
struct Ingested {
    group_id: String,
    event_id: String,
    fingerprint: String,
    error_class: String,
    status: GroupStatus,
    event_count: i64,
    created: bool,
    notification_scheduled: bool,
}

impl From<ProcessResult> for Ingested {
    fn from(result: ProcessResult) -> Self {
        Self {
            group_id: result.group.id,
            event_id: result.event.id,
            fingerprint: result.group.fingerprint,
            error_class: result.group.error_class,
            status: result.group.status,
            event_count: result.group.event_count,
            created: result.created,
            notification_scheduled: result.notification_scheduled,
        }
    }
}

/// Ingest one report, one log message, or a batch of reports.
#[tracing::instrument(skip(services, project, format), fields(project_id = %project.id))]
pub fn run_ingest(
    services: &ReflexServices,
    project: &Project,
    file: Option<&Path>,
    message: bool,
    batch: bool,
    format: OutputFormat,
) -> Result<()> {
    let input = super::helpers::read_json(file)?;
    let processor = services.processor();
    let formatter = Formatter::new(format);

    if batch {
        let Value::Array(reports) = input else {
            bail!("--batch expects a JSON array of reports");
        };
        let result = processor.process_batch(project, &reports)?;
        tracing::info!(processed = result.processed, "ingested batch");
        return formatter.print(&result);
    }

    let result = if message {
        processor.process_message(project, &input)?
    } else {
        processor.process(project, &input)?
    };
    formatter.print(&Ingested::from(result))
}
