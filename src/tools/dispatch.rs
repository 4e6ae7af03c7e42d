//! The dispatch tool: validation, limits, approval routing, and the
//! breaker-guarded create-or-fallback.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::{CallerIdentity, ToolFailure, ToolReply, Tools};
use crate::approval::ApprovalRequest;
use crate::error::Result;
use crate::host::{SessionHost, StartSessionRequest, SubagentRegistration};
use crate::record::{Cleanup, JobRecord};
use crate::service::Components;
use crate::store::keys;

/// Marker the breaker fallback path threads through the primary result
/// type.
const FALLBACK_SENTINEL: &str = "__fallback__:";

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchInput {
    pub target: String,
    pub task: String,
    pub label: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub run_timeout_seconds: Option<u64>,
    pub cleanup: Option<Cleanup>,
    pub depends_on: Vec<String>,
    /// System agents only.
    pub system_prompt_addition: Option<String>,
    pub depth: Option<u32>,
    pub store_result: bool,
    pub requires_approval: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Queued,
    PendingApproval,
    Dispatched,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReply {
    pub job_id: String,
    pub status: DispatchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl Tools {
    pub async fn dispatch(
        &self,
        caller: &CallerIdentity,
        input: DispatchInput,
    ) -> ToolReply<DispatchReply> {
        self.dispatch_inner(caller, input).await.into()
    }

    async fn dispatch_inner(
        &self,
        caller: &CallerIdentity,
        input: DispatchInput,
    ) -> Result<DispatchReply, ToolFailure> {
        let Some(components) = self.handle().resolve() else {
            return Err(ToolFailure::error("orchestrator is not running"));
        };

        // Store down: skip straight to the direct-spawn fallback so
        // dispatch keeps working without tracking.
        let Some(tracker) = components.tracker.clone() else {
            return direct_fallback(&components, caller, &input, "job store unavailable").await;
        };

        validate(&components, caller, &input)?;

        // Approval routing comes before the resource limits: a gated
        // dispatch consumes no queue budget until a human approves.
        if input.requires_approval || !components.config.is_orchestrator(&caller.agent_id) {
            let Some(approvals) = components.approvals.clone() else {
                return Err(ToolFailure::error("approval subsystem unavailable"));
            };
            if components.config.approval.discord_channel_id.is_empty() {
                return Err(ToolFailure::error(
                    "approval required but no approval channel is configured",
                ));
            }
            let record = approvals
                .create(ApprovalRequest {
                    caller: caller.agent_id.clone(),
                    target: input.target.clone(),
                    task: input.task.clone(),
                    label: input.label.clone(),
                    project: input.project.clone(),
                    model: input.model.clone(),
                    thinking_level: input.thinking.clone(),
                    timeout_seconds: input.run_timeout_seconds,
                    cleanup: input.cleanup.unwrap_or_default(),
                    reason: input.reason.clone(),
                    dispatcher_session_key: caller.session_key.clone(),
                    origin: caller.origin.clone(),
                })
                .await
                .map_err(|e| ToolFailure::error(format!("approval creation failed: {}", e)))?;
            return Ok(DispatchReply {
                job_id: record.id,
                status: DispatchStatus::PendingApproval,
                target: Some(input.target),
                fallback: None,
                fallback_reason: None,
            });
        }

        // Per-caller rate limit; the atomic increment is the
        // serialization point.
        let limit = components.config.rate_limit.dispatches_per_minute;
        if limit > 0 {
            let count = tracker
                .store()
                .incr_with_window(&keys::rate_limit_dispatch(&caller.agent_id), RATE_WINDOW)
                .await
                .map_err(|e| ToolFailure::error(format!("rate limit check failed: {}", e)))?;
            if count > u64::from(limit) {
                return Err(ToolFailure::rate_limited(format!(
                    "Rate limit exceeded: {}/{} dispatches this minute",
                    count, limit
                )));
            }
        }

        // Per-target queue-depth cap.
        let max_depth = components.config.rate_limit.max_queue_depth;
        let counts = tracker
            .queue_counts(&input.target)
            .await
            .map_err(|e| ToolFailure::error(format!("queue depth check failed: {}", e)))?;
        if counts.depth() >= max_depth {
            return Err(ToolFailure::queue_full(format!(
                "Queue for {} is full: {}/{} jobs",
                input.target,
                counts.depth(),
                max_depth
            )));
        }

        let record = build_record(caller, &input);
        let job_id = record.job_id.clone();
        let target = input.target.clone();

        let breaker = Arc::clone(&components.breaker);
        let host = Arc::clone(&components.host);
        let fallback_input = input.clone();
        let fallback_caller = caller.clone();
        let result = breaker
            .run(
                || {
                    let tracker = Arc::clone(&tracker);
                    async move { tracker.create_job(record).await }
                },
                |_reason| async move {
                    let run_id = direct_spawn(&host, &fallback_caller, &fallback_input).await?;
                    Ok(format!("{}{}", FALLBACK_SENTINEL, run_id))
                },
            )
            .await
            .map_err(|e| ToolFailure::error(format!("dispatch failed: {}", e)))?;

        if result.from_fallback || result.value.starts_with(FALLBACK_SENTINEL) {
            return Ok(DispatchReply {
                job_id: format!("fallback-{}", Utc::now().timestamp_millis()),
                status: DispatchStatus::Dispatched,
                target: Some(target),
                fallback: Some(true),
                fallback_reason: result.fallback_reason,
            });
        }

        Ok(DispatchReply {
            job_id,
            status: DispatchStatus::Queued,
            target: Some(target),
            fallback: None,
            fallback_reason: None,
        })
    }
}

fn validate(
    components: &Components,
    caller: &CallerIdentity,
    input: &DispatchInput,
) -> Result<(), ToolFailure> {
    let limits = &components.config.dispatch;
    if input.target.is_empty() {
        return Err(ToolFailure::error("target is required"));
    }
    if input.task.is_empty() {
        return Err(ToolFailure::error("task is required"));
    }
    if input.task.chars().count() > limits.max_task_chars {
        return Err(ToolFailure::error(format!(
            "task exceeds {} characters",
            limits.max_task_chars
        )));
    }
    if input.depends_on.len() > limits.max_depends_on {
        return Err(ToolFailure::error(format!(
            "dependsOn accepts at most {} jobs (single level)",
            limits.max_depends_on
        )));
    }
    if components.config.agent(&input.target).is_none() {
        return Err(ToolFailure::error(format!(
            "Unknown agent: {}",
            input.target
        )));
    }
    if !components
        .config
        .can_dispatch_to(&caller.agent_id, &input.target)
    {
        return Err(ToolFailure::forbidden(format!(
            "Agent {} is not allowed to dispatch to {}",
            caller.agent_id, input.target
        )));
    }
    if input.system_prompt_addition.is_some()
        && !components.config.is_system_agent(&caller.agent_id)
    {
        return Err(ToolFailure::forbidden(
            "systemPromptAddition is restricted to system agents",
        ));
    }
    Ok(())
}

fn build_record(caller: &CallerIdentity, input: &DispatchInput) -> JobRecord {
    let mut record = JobRecord::new(
        Uuid::new_v4().to_string(),
        input.target.clone(),
        input.task.clone(),
        caller.agent_id.clone(),
    );
    record.label = input.label.clone();
    record.project = input.project.clone();
    record.model = input.model.clone();
    record.thinking_level = input.thinking.clone();
    record.system_prompt_addition = input.system_prompt_addition.clone();
    record.cleanup = input.cleanup.unwrap_or_default();
    record.depth = input.depth;
    record.depends_on = input.depends_on.clone();
    record.timeout_ms = input.run_timeout_seconds.map(|s| s * 1_000);
    record.store_result = input.store_result;
    record.dispatcher_session_key = caller.session_key.clone();
    record.dispatcher_agent_id = Some(caller.agent_id.clone());
    record.dispatcher_depth = caller.depth;
    record.dispatcher_origin = caller.origin.clone();
    record
}

/// Direct-spawn path used when the store (or the tracker path) is out:
/// the session host is called directly and the dispatch is untracked.
async fn direct_spawn(
    host: &Arc<dyn SessionHost>,
    caller: &CallerIdentity,
    input: &DispatchInput,
) -> Result<String> {
    let session_key = format!("agent:{}:subagent:{}", input.target, Uuid::new_v4());
    let started = host
        .start_session(StartSessionRequest {
            session_key: session_key.clone(),
            task: input.task.clone(),
            system_prompt: None,
            deliver: false,
            timeout_ms: input.run_timeout_seconds.map(|s| s * 1_000),
        })
        .await?;
    // Best-effort announce registration; the spawn stands even if this
    // fails.
    if let Err(e) = host
        .register_subagent_run(SubagentRegistration {
            run_id: started.run_id.clone(),
            child_session_key: session_key,
            requester_session_key: caller.session_key.clone(),
            origin: caller.origin.clone(),
            label: input.label.clone(),
            cleanup: input.cleanup.unwrap_or_default(),
        })
        .await
    {
        warn!(run_id = %started.run_id, error = %e, "Fallback spawn announce registration failed");
    }
    Ok(started.run_id)
}

async fn direct_fallback(
    components: &Components,
    caller: &CallerIdentity,
    input: &DispatchInput,
    reason: &str,
) -> Result<DispatchReply, ToolFailure> {
    let run_id = direct_spawn(&components.host, caller, input)
        .await
        .map_err(|e| ToolFailure::error(format!("fallback dispatch failed: {}", e)))?;
    warn!(target = %input.target, run_id, reason, "Dispatched via direct fallback");
    Ok(DispatchReply {
        job_id: format!("fallback-{}", Utc::now().timestamp_millis()),
        status: DispatchStatus::Dispatched,
        target: Some(input.target.clone()),
        fallback: Some(true),
        fallback_reason: Some(reason.to_string()),
    })
}
