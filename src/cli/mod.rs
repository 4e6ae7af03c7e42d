//! Operator CLI.
//!
//! Read-only stats and listings plus the two mutating operations an
//! operator needs: retry a failed job and drain an agent's queue.
//! - `Cli`, `Commands`: argument definitions via clap
//! - `run`: command dispatch against the configured store

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

pub use commands::run;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about = "Durable job orchestrator for agent fleets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Path to foreman.toml
    #[arg(long, global = true, env = "FOREMAN_CONFIG", default_value = "foreman.toml")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Per-agent queue statistics
    Stats {
        /// Limit to one agent
        #[arg(long)]
        agent: Option<String>,
    },

    /// List job records
    List {
        #[arg(long)]
        agent: Option<String>,

        /// Filter by record status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Dump one job record
    Inspect {
        job_id: String,
    },

    /// Re-dispatch a failed job
    Retry {
        job_id: String,
    },

    /// Remove all waiting and delayed jobs for an agent
    Drain {
        agent: String,

        /// Required; draining is destructive
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum StatusArg {
    Queued,
    Active,
    Announcing,
    Completed,
    Failed,
    FailedPermanent,
    Retrying,
    Stalled,
}

impl From<StatusArg> for crate::record::JobStatus {
    fn from(arg: StatusArg) -> Self {
        use crate::record::JobStatus;
        match arg {
            StatusArg::Queued => JobStatus::Queued,
            StatusArg::Active => JobStatus::Active,
            StatusArg::Announcing => JobStatus::Announcing,
            StatusArg::Completed => JobStatus::Completed,
            StatusArg::Failed => JobStatus::Failed,
            StatusArg::FailedPermanent => JobStatus::FailedPermanent,
            StatusArg::Retrying => JobStatus::Retrying,
            StatusArg::Stalled => JobStatus::Stalled,
        }
    }
}
