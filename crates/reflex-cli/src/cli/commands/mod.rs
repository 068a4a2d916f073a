//! Command implementations.

pub mod errors;
pub mod helpers;
pub mod ingest;
pub mod insights;
pub mod notify;
pub mod project;
pub mod signal;

pub use errors::{
    run_errors_events, run_errors_list, run_errors_notifications, run_errors_show,
    run_errors_transition, run_search,
};
pub use ingest::run_ingest;
pub use insights::{run_analytics, run_stats};
pub use notify::{run_notify_drain, run_notify_pending};
pub use project::{run_project_delete, run_project_ensure, run_project_show, run_reconcile};
pub use signal::{run_signal_baseline, run_signal_last, run_signal_rate};
