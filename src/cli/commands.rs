use std::sync::Arc;

use uuid::Uuid;

use super::{Cli, Commands, OutputFormat, StatusArg};
use crate::config::ForemanConfig;
use crate::error::{ForemanError, Result};
use crate::queue::{QueueEvents, QueueTuning};
use crate::record::{JobStatus, RecordPatch};
use crate::store::RedisStore;
use crate::tracker::JobTracker;
use crate::utils::format_relative;

/// Execute one operator command. Errors bubble to `main` for the
/// non-zero exit.
pub async fn run(cli: Cli) -> Result<()> {
    let config = ForemanConfig::load(&cli.config).await?;
    let store = Arc::new(RedisStore::connect(&config.redis.url()).await?);
    let tracker = JobTracker::new(store, QueueTuning::default(), QueueEvents::default());
    for agent_id in config.agents.keys() {
        tracker.agent_queue(agent_id);
    }

    match cli.command {
        Commands::Stats { agent } => cmd_stats(&config, &tracker, agent, cli.output).await,
        Commands::List {
            agent,
            status,
            limit,
        } => cmd_list(&tracker, agent, status, limit, cli.output).await,
        Commands::Inspect { job_id } => cmd_inspect(&tracker, &job_id).await,
        Commands::Retry { job_id } => cmd_retry(&tracker, &job_id).await,
        Commands::Drain { agent, confirm } => cmd_drain(&tracker, &agent, confirm).await,
    }
}

async fn cmd_stats(
    config: &ForemanConfig,
    tracker: &JobTracker,
    agent: Option<String>,
    output: OutputFormat,
) -> Result<()> {
    let agents: Vec<String> = match agent {
        Some(agent) => vec![agent],
        None => {
            let mut ids: Vec<String> = config.agents.keys().cloned().collect();
            ids.sort();
            ids
        }
    };

    let mut rows = Vec::new();
    for agent_id in agents {
        let counts = tracker.queue_counts(&agent_id).await?;
        rows.push(serde_json::json!({
            "agent": agent_id,
            "waiting": counts.waiting,
            "delayed": counts.delayed,
            "active": counts.active,
            "completed": counts.completed,
            "failed": counts.failed,
            "paused": 0,
            "waitingChildren": counts.waiting_children,
        }));
    }

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            println!(
                "{:<16} {:>8} {:>8} {:>7} {:>10} {:>7} {:>9}",
                "AGENT", "WAITING", "DELAYED", "ACTIVE", "COMPLETED", "FAILED", "GATED"
            );
            for row in rows {
                println!(
                    "{:<16} {:>8} {:>8} {:>7} {:>10} {:>7} {:>9}",
                    row["agent"].as_str().unwrap_or("?"),
                    row["waiting"],
                    row["delayed"],
                    row["active"],
                    row["completed"],
                    row["failed"],
                    row["waitingChildren"],
                );
            }
        }
    }
    Ok(())
}

async fn cmd_list(
    tracker: &JobTracker,
    agent: Option<String>,
    status: Option<StatusArg>,
    limit: usize,
    output: OutputFormat,
) -> Result<()> {
    let status: Option<JobStatus> = status.map(Into::into);
    let mut records = tracker.all_records().await?;
    records.retain(|r| {
        agent.as_ref().is_none_or(|a| &r.target == a)
            && status.is_none_or(|s| r.status == s)
    });
    records.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
    records.truncate(limit.clamp(1, 100));

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No jobs match.");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  {:<16} {:<10} {} -> {}  {}",
                    record.job_id,
                    record.status,
                    format_relative(record.queued_at),
                    record.dispatched_by,
                    record.target,
                    record.label.as_deref().unwrap_or(""),
                );
            }
        }
    }
    Ok(())
}

async fn cmd_inspect(tracker: &JobTracker, job_id: &str) -> Result<()> {
    let record = tracker
        .find_by_job_id(job_id)
        .await?
        .ok_or_else(|| ForemanError::JobNotFound(job_id.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Re-dispatch a failed job as a fresh record chained onto the original.
async fn cmd_retry(tracker: &JobTracker, job_id: &str) -> Result<()> {
    let record = tracker
        .find_by_job_id(job_id)
        .await?
        .ok_or_else(|| ForemanError::JobNotFound(job_id.to_string()))?;
    if record.status != JobStatus::Failed {
        return Err(ForemanError::Validation(format!(
            "Job {} is {}, only failed jobs can be retried",
            job_id, record.status
        )));
    }

    let new_job_id = Uuid::new_v4().to_string();
    tracker
        .create_job(record.retry_successor(new_job_id.as_str()))
        .await?;
    tracker
        .update_job_status(
            job_id,
            JobStatus::Retrying,
            &RecordPatch {
                retried_by_job_id: Some(new_job_id.clone()),
                ..Default::default()
            },
        )
        .await?;
    println!("Retrying {} as {}", job_id, new_job_id);
    Ok(())
}

async fn cmd_drain(tracker: &JobTracker, agent: &str, confirm: bool) -> Result<()> {
    if !confirm {
        return Err(ForemanError::Validation(format!(
            "Draining removes all pending jobs for {}; re-run with --confirm",
            agent
        )));
    }
    let drained = tracker.agent_queue(agent).drain().await?;
    println!("Drained {} job(s) from agent-{}", drained, agent);
    Ok(())
}
