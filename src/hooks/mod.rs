//! Session lifecycle hooks.
//!
//! The session host raises two events the orchestrator consumes:
//! `after_tool_call` (tracks spawns made through the direct spawn tool)
//! and `agent_end` (translates child completion into record status,
//! captures results, and drives the agent-level retry chain). Hooks
//! never propagate errors to the host; every failure is logged and
//! swallowed.

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::alerts::redact_failure;
use crate::record::{JobRecord, JobStatus, RecordPatch};
use crate::service::ServiceHandle;
use crate::utils::truncate_chars;

/// Tool name the backward-compatibility path watches for.
pub const SPAWN_TOOL: &str = "sessions_spawn";

const HISTORY_FETCH_LIMIT: usize = 50;

/// Observed invocation of the direct spawn tool.
#[derive(Debug, Clone)]
pub struct SpawnObservedEvent {
    pub tool_name: String,
    pub caller_agent_id: String,
    pub caller_session_key: Option<String>,
    pub target: String,
    pub task: String,
    pub run_id: String,
    pub session_key: String,
}

/// Child session completion.
#[derive(Debug, Clone)]
pub struct AgentEndEvent {
    pub session_key: String,
    pub success: bool,
    pub error: Option<String>,
}

pub struct LifecycleHooks {
    handle: ServiceHandle,
}

impl LifecycleHooks {
    pub fn new(handle: ServiceHandle) -> Self {
        Self { handle }
    }

    /// Track a spawn made outside dispatch so it still shows up in the
    /// queue views and the session index.
    pub async fn after_tool_call(&self, event: SpawnObservedEvent) {
        if event.tool_name != SPAWN_TOOL {
            return;
        }
        let Some(components) = self.handle.resolve() else {
            return;
        };
        let Some(tracker) = components.tracker.clone() else {
            return;
        };

        let mut record = JobRecord::new(
            event.run_id.clone(),
            event.target.clone(),
            event.task.clone(),
            event.caller_agent_id.clone(),
        );
        record.status = JobStatus::Active;
        record.started_at = Some(Utc::now());
        record.run_id = Some(event.run_id.clone());
        record.session_key = Some(event.session_key.clone());
        record.dispatcher_session_key = event.caller_session_key.clone();
        record.dispatcher_agent_id = Some(event.caller_agent_id.clone());

        if let Err(e) = tracker.track_external(record).await {
            warn!(run_id = %event.run_id, error = %e, "Failed to track direct spawn");
        }
    }

    /// Translate a child session ending into record state, run result
    /// capture, and decide the retry path.
    pub async fn agent_end(&self, event: AgentEndEvent) {
        let Some(components) = self.handle.resolve() else {
            debug!("Agent end before service start, ignoring");
            return;
        };
        let Some(tracker) = components.tracker.clone() else {
            return;
        };

        let record = match tracker.find_by_session_key(&event.session_key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(session_key = %event.session_key, "Agent end for untracked session");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Job lookup failed in agent_end");
                return;
            }
        };
        if record.status.is_terminal() {
            debug!(job_id = %record.job_id, "Agent end for terminal job, ignoring");
            return;
        }

        let now = Utc::now();
        if event.success {
            let mut patch = RecordPatch {
                completed_at: Some(now),
                ..Default::default()
            };
            if record.store_result {
                patch.result = self
                    .capture_result(
                        &components,
                        &event.session_key,
                        components.config.dispatch.max_result_chars,
                    )
                    .await;
            }
            if let Err(e) = tracker
                .update_job_status(&record.job_id, JobStatus::Completed, &patch)
                .await
            {
                warn!(job_id = %record.job_id, error = %e, "Completion update failed");
            }
            return;
        }

        // Execution failure path.
        let error = event.error.unwrap_or_else(|| "child session failed".to_string());
        if let Err(e) = tracker
            .update_job_status(
                &record.job_id,
                JobStatus::Failed,
                &RecordPatch {
                    completed_at: Some(now),
                    error: Some(error.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(job_id = %record.job_id, error = %e, "Failure update failed");
            return;
        }

        let attempts = components.config.retry.agent_failure_attempts;
        if record.retry_count + 1 < attempts {
            self.schedule_retry(&components, &tracker, &record).await;
        } else {
            self.finalize_permanent_failure(&components, &tracker, &record, &error)
                .await;
        }
    }

    async fn capture_result(
        &self,
        components: &crate::service::Components,
        session_key: &str,
        max_chars: usize,
    ) -> Option<String> {
        match components
            .host
            .fetch_session_history(session_key, HISTORY_FETCH_LIMIT)
            .await
        {
            Ok(history) => history
                .iter()
                .rev()
                .find(|m| m.is_assistant())
                .map(|m| truncate_chars(&m.content, max_chars)),
            Err(e) => {
                warn!(session_key, error = %e, "Result capture failed");
                None
            }
        }
    }

    /// Enqueue the retry successor with exponential backoff and chain the
    /// failed record onto it.
    async fn schedule_retry(
        &self,
        components: &crate::service::Components,
        tracker: &crate::tracker::JobTracker,
        record: &JobRecord,
    ) {
        let new_job_id = Uuid::new_v4().to_string();
        let base = components.config.retry.agent_failure_base_delay_ms;
        let delay_ms = base.saturating_mul(1u64 << record.retry_count.min(16));

        let successor = record.retry_successor(new_job_id.as_str());
        if let Err(e) = tracker.create_job_delayed(successor, Some(delay_ms)).await {
            warn!(job_id = %record.job_id, error = %e, "Retry enqueue failed");
            return;
        }
        if let Err(e) = tracker
            .update_job_status(
                &record.job_id,
                JobStatus::Retrying,
                &RecordPatch {
                    retried_by_job_id: Some(new_job_id.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(job_id = %record.job_id, error = %e, "Retrying-status update failed");
        }
        debug!(job_id = %record.job_id, retry_job_id = %new_job_id, delay_ms,
            "Scheduled execution retry");
    }

    /// Out of retries: pin the terminal status and tell the humans.
    /// Intermediate retry records never notify; only the end of the
    /// chain does.
    async fn finalize_permanent_failure(
        &self,
        components: &crate::service::Components,
        tracker: &crate::tracker::JobTracker,
        record: &JobRecord,
        error: &str,
    ) {
        if let Err(e) = tracker
            .update_job_status(&record.job_id, JobStatus::FailedPermanent, &RecordPatch::default())
            .await
        {
            warn!(job_id = %record.job_id, error = %e, "Permanent-failure update failed");
        }

        let notice = format!(
            "Job {} ({} -> {}) failed permanently after {} attempt(s): {}",
            record.job_id,
            record.dispatched_by,
            record.target,
            record.retry_count + 1,
            redact_failure(error)
        );

        if let Some(dispatcher_key) = &record.dispatcher_session_key
            && let Err(e) = components.host.send_to_session(dispatcher_key, &notice).await
        {
            warn!(job_id = %record.job_id, error = %e, "Dispatcher failure notice undeliverable");
        }

        let channel = &components.config.approval.discord_channel_id;
        if !channel.is_empty()
            && let Err(e) = components
                .sender
                .send(channel, "", &notice, &format!("permfail-{}", record.job_id))
                .await
        {
            warn!(job_id = %record.job_id, error = %e, "DLQ alert undeliverable");
        }
    }
}
