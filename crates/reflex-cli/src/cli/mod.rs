//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reflex_core::store::{Aggregation, GroupStatus, SortOrder};

pub mod commands;

/// Error tracking: ingest reports, group them, query the groups
#[derive(Parser, Debug)]
#[command(name = "reflex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// SQLite database file (overrides the config file)
    #[arg(long, global = true, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Config file (default: $REFLEX_CONFIG)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Platform project ID (default: $REFLEX_PROJECT)
    #[arg(long, global = true)]
    pub project: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest error reports (JSON) from a file or stdin
    Ingest {
        /// Read from this file instead of stdin
        #[arg(long, short)]
        file: Option<PathBuf>,

        /// Treat reports as log messages
        #[arg(long, conflicts_with = "batch")]
        message: bool,

        /// Input is a JSON array of reports
        #[arg(long)]
        batch: bool,
    },

    /// Manage error groups
    #[command(subcommand)]
    Errors(ErrorsCommands),

    /// Search error groups by class, message, or file
    Search {
        /// Text to search for
        query: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Group counts and top unresolved errors
    Stats {
        /// Period to count events over: <N>h, <N>d, or <N>w (default: 24h)
        #[arg(long)]
        since: Option<String>,
    },

    /// Breakdowns by day, class, environment, release, and more
    Analytics {
        /// Period to analyze: <N>h, <N>d, or <N>w (default: 7d)
        #[arg(long)]
        since: Option<String>,
    },

    /// Alerting signal queries
    #[command(subcommand)]
    Signal(SignalCommands),

    /// Work the notification outbox
    #[command(subcommand)]
    Notify(NotifyCommands),

    /// Recompute denormalized counters from events
    Reconcile,

    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommands),
}

// ============================================================================
// Errors subcommands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum ErrorsCommands {
    /// List error groups
    List {
        /// Substring of class, message, or file
        #[arg(long)]
        search: Option<String>,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Show one error group
    Show {
        /// Group ID
        group_id: String,
    },

    /// Show recent events of a group
    Events {
        /// Group ID
        group_id: String,

        /// Only events from this environment
        #[arg(long, short)]
        environment: Option<String>,

        /// Maximum number of events
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Mark a group resolved
    Resolve {
        /// Group ID
        group_id: String,

        /// Who resolved it (default: $USER)
        #[arg(long)]
        by: Option<String>,
    },

    /// Reopen a group
    Unresolve {
        /// Group ID
        group_id: String,
    },

    /// Ignore a group
    Ignore {
        /// Group ID
        group_id: String,
    },

    /// Mute a group
    Mute {
        /// Group ID
        group_id: String,
    },

    /// Turn notifications for a group on or off
    Notifications {
        /// Group ID
        group_id: String,

        /// Disable instead of enable
        #[arg(long)]
        off: bool,
    },
}

/// Filters shared by listing and search.
#[derive(Args, Debug, Default, Clone)]
pub struct FilterArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<GroupStatus>,

    /// Filter by exact error class
    #[arg(long = "class")]
    pub error_class: Option<String>,

    /// Only groups seen within this period: <N>h, <N>d, or <N>w
    #[arg(long)]
    pub since: Option<String>,

    /// Filter by last environment
    #[arg(long, short)]
    pub environment: Option<String>,

    /// Only groups with events from this user ID
    #[arg(long)]
    pub user: Option<String>,

    /// Only groups with events at this commit
    #[arg(long)]
    pub commit: Option<String>,

    /// Sort order
    #[arg(long, default_value = "recent")]
    pub sort: SortOrder,

    /// Maximum number of groups
    #[arg(long, short)]
    pub limit: Option<usize>,
}

// ============================================================================
// Signal subcommands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum SignalCommands {
    /// Event count or per-minute rate within a window
    Rate {
        #[command(flatten)]
        target: SignalArgs,

        /// Window: <N>m, <N>h, or <N>d (default: 5m)
        #[arg(long)]
        window: Option<String>,

        /// Report a count or a per-minute rate
        #[arg(long, default_value = "count")]
        aggregation: Aggregation,
    },

    /// Mean and standard deviation of hourly counts
    Baseline {
        #[command(flatten)]
        target: SignalArgs,

        /// Window: <N>m, <N>h, or <N>d (default: 24h)
        #[arg(long)]
        window: Option<String>,
    },

    /// Most recent matching event
    Last {
        #[command(flatten)]
        target: SignalArgs,
    },
}

/// Which events a signal looks at.
#[derive(Args, Debug, Default, Clone)]
pub struct SignalArgs {
    /// Error class, or "all" (default)
    pub error_type: Option<String>,

    /// Only events from this environment
    #[arg(long, short)]
    pub environment: Option<String>,

    /// Only events whose group has this status
    #[arg(long)]
    pub status: Option<GroupStatus>,
}

// ============================================================================
// Notify subcommands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum NotifyCommands {
    /// List pending notification jobs
    Pending {
        /// Maximum number of jobs
        #[arg(long, short, default_value_t = 100)]
        limit: usize,
    },

    /// Deliver pending notifications to the log
    Drain {
        /// Maximum number of jobs
        #[arg(long, short, default_value_t = 100)]
        limit: usize,
    },
}

// ============================================================================
// Project subcommands
// ============================================================================

#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Find or create the project for --project
    Show,

    /// Find or create the project for a resolved identity (JSON)
    Ensure {
        /// Read the identity from this file instead of stdin
        #[arg(long, short)]
        file: Option<PathBuf>,
    },

    /// Delete the project with all groups, events, and jobs
    Delete {
        /// Confirm deletion
        #[arg(long)]
        force: bool,
    },
}
