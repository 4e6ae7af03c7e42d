//! Read-side tools: `status`, `list`, and `activity`.
//!
//! Authorization is enforced on every read: a non-system caller only
//! sees jobs it dispatched or is the target of, and the child session
//! key never leaves the crate for unprivileged callers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{CallerIdentity, ToolFailure, ToolReply, Tools};
use crate::record::{JobRecord, JobStatus};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

/// Job record projected to the fields a caller may see.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: String,
    pub status: String,
    pub target: String,
    pub dispatched_by: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retried_by_job_id: Option<String>,
    /// Present for system callers only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_for_dependencies: Option<bool>,
}

impl JobView {
    fn project_record(
        record: &JobRecord,
        include_session_key: bool,
        waiting_for_dependencies: Option<bool>,
    ) -> Self {
        Self {
            job_id: record.job_id.clone(),
            status: record.status.to_string(),
            target: record.target.clone(),
            dispatched_by: record.dispatched_by.clone(),
            task: record.task.clone(),
            label: record.label.clone(),
            project: record.project.clone(),
            queued_at: record.queued_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            result: record.result.clone(),
            error: record.error.clone(),
            retry_count: record.retry_count,
            original_job_id: record.original_job_id.clone(),
            retried_by_job_id: record.retried_by_job_id.clone(),
            session_key: if include_session_key {
                record.session_key.clone()
            } else {
                None
            },
            waiting_for_dependencies,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    Queued,
    Active,
    Completed,
    Failed,
    PendingApproval,
}

impl StatusFilter {
    fn matches(&self, status: JobStatus) -> bool {
        match self {
            Self::Queued => matches!(status, JobStatus::Queued | JobStatus::Stalled),
            Self::Active => matches!(status, JobStatus::Active | JobStatus::Announcing),
            Self::Completed => status == JobStatus::Completed,
            Self::Failed => matches!(
                status,
                JobStatus::Failed | JobStatus::FailedPermanent | JobStatus::Retrying
            ),
            Self::PendingApproval => false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ListInput {
    pub agent: Option<String>,
    pub status: Option<StatusFilter>,
    pub project: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListReply {
    pub jobs: Vec<JobView>,
    pub count: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    pub status: String,
    pub pending: u64,
    pub active: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityReply {
    pub agents: BTreeMap<String, AgentActivity>,
    pub summary: String,
}

impl Tools {
    /// Single-job status with authorization. Unauthorized lookups report
    /// not-found so existence does not leak.
    pub async fn status(&self, caller: &CallerIdentity, job_id: &str) -> ToolReply<JobView> {
        self.status_inner(caller, job_id).await.into()
    }

    async fn status_inner(
        &self,
        caller: &CallerIdentity,
        job_id: &str,
    ) -> Result<JobView, ToolFailure> {
        let Some(components) = self.handle().resolve() else {
            return Err(ToolFailure::error("orchestrator is not running"));
        };
        let Some(tracker) = components.tracker.clone() else {
            return Err(ToolFailure::error("job store unavailable"));
        };

        let record = tracker
            .find_by_job_id(job_id)
            .await
            .map_err(|e| ToolFailure::error(e.to_string()))?
            .ok_or_else(|| ToolFailure::not_found(format!("Job {} not found", job_id)))?;

        let is_system = components.config.is_system_agent(&caller.agent_id);
        if !is_system
            && record.dispatched_by != caller.agent_id
            && record.target != caller.agent_id
        {
            return Err(ToolFailure::not_found(format!("Job {} not found", job_id)));
        }

        let waiting = if record.depends_on.is_empty() {
            None
        } else {
            Some(
                tracker
                    .waiting_for_dependencies(job_id)
                    .await
                    .map_err(|e| ToolFailure::error(e.to_string()))?,
            )
        };

        Ok(JobView::project_record(&record, is_system, waiting))
    }

    /// Filtered listing, newest first.
    pub async fn list(&self, caller: &CallerIdentity, input: ListInput) -> ToolReply<ListReply> {
        self.list_inner(caller, input).await.into()
    }

    async fn list_inner(
        &self,
        caller: &CallerIdentity,
        input: ListInput,
    ) -> Result<ListReply, ToolFailure> {
        let Some(components) = self.handle().resolve() else {
            return Err(ToolFailure::error("orchestrator is not running"));
        };
        let Some(tracker) = components.tracker.clone() else {
            return Err(ToolFailure::error("job store unavailable"));
        };
        let limit = input
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let is_system = components.config.is_system_agent(&caller.agent_id);

        // Pending approvals are their own entity; project them into the
        // same reply shape.
        if input.status == Some(StatusFilter::PendingApproval) {
            let Some(approvals) = components.approvals.clone() else {
                return Err(ToolFailure::error("approval subsystem unavailable"));
            };
            let records = approvals
                .pending(limit)
                .await
                .map_err(|e| ToolFailure::error(e.to_string()))?;
            let jobs: Vec<JobView> = records
                .iter()
                .filter(|r| {
                    is_system || r.caller == caller.agent_id || r.target == caller.agent_id
                })
                .filter(|r| {
                    input
                        .project
                        .as_ref()
                        .is_none_or(|p| r.project.as_ref() == Some(p))
                })
                .map(|r| JobView {
                    job_id: r.id.clone(),
                    status: "pending_approval".to_string(),
                    target: r.target.clone(),
                    dispatched_by: r.caller.clone(),
                    task: r.task.clone(),
                    label: r.label.clone(),
                    project: r.project.clone(),
                    queued_at: r.created_at,
                    started_at: None,
                    completed_at: None,
                    result: None,
                    error: None,
                    retry_count: 0,
                    original_job_id: None,
                    retried_by_job_id: None,
                    session_key: None,
                    waiting_for_dependencies: None,
                })
                .collect();
            let count = jobs.len();
            return Ok(ListReply { jobs, count, limit });
        }

        let mut records = tracker
            .all_records()
            .await
            .map_err(|e| ToolFailure::error(e.to_string()))?;
        records.retain(|r| {
            (is_system || r.dispatched_by == caller.agent_id || r.target == caller.agent_id)
                && input.agent.as_ref().is_none_or(|a| &r.target == a)
                && input.status.is_none_or(|s| s.matches(r.status))
                && input
                    .project
                    .as_ref()
                    .is_none_or(|p| r.project.as_ref() == Some(p))
        });
        records.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        records.truncate(limit);

        let jobs: Vec<JobView> = records
            .iter()
            .map(|r| JobView::project_record(r, is_system, None))
            .collect();
        let count = jobs.len();
        Ok(ListReply { jobs, count, limit })
    }

    /// Fleet overview across configured agents.
    pub async fn activity(&self, _caller: &CallerIdentity) -> ToolReply<ActivityReply> {
        self.activity_inner().await.into()
    }

    async fn activity_inner(&self) -> Result<ActivityReply, ToolFailure> {
        let Some(components) = self.handle().resolve() else {
            return Err(ToolFailure::error("orchestrator is not running"));
        };

        let mut agents = BTreeMap::new();
        let mut working = 0usize;
        let mut idle = 0usize;
        let mut offline = 0usize;

        match components.tracker.clone() {
            Some(tracker) => {
                let records = tracker
                    .all_records()
                    .await
                    .map_err(|e| ToolFailure::error(e.to_string()))?;
                for agent_id in components.config.agents.keys() {
                    let counts = tracker
                        .queue_counts(agent_id)
                        .await
                        .map_err(|e| ToolFailure::error(e.to_string()))?;
                    let current = records
                        .iter()
                        .filter(|r| &r.target == agent_id && r.status == JobStatus::Active)
                        .max_by_key(|r| r.started_at);
                    let status = if current.is_some() {
                        working += 1;
                        "working"
                    } else {
                        idle += 1;
                        "idle"
                    };
                    agents.insert(
                        agent_id.clone(),
                        AgentActivity {
                            status: status.to_string(),
                            pending: counts.waiting + counts.delayed + counts.waiting_children,
                            active: counts.active,
                            completed_total: counts.completed,
                            failed_total: counts.failed,
                            job: current.map(|r| {
                                r.label
                                    .clone()
                                    .unwrap_or_else(|| crate::utils::truncate_chars(&r.task, 80))
                            }),
                            since: current.and_then(|r| r.started_at),
                        },
                    );
                }
            }
            None => {
                // Store down: every agent reads as offline.
                for agent_id in components.config.agents.keys() {
                    offline += 1;
                    agents.insert(
                        agent_id.clone(),
                        AgentActivity {
                            status: "offline".to_string(),
                            pending: 0,
                            active: 0,
                            completed_total: 0,
                            failed_total: 0,
                            job: None,
                            since: None,
                        },
                    );
                }
            }
        }

        let summary = format!(
            "{} agents: {} working, {} idle, {} offline",
            agents.len(),
            working,
            idle,
            offline
        );
        Ok(ActivityReply { agents, summary })
    }
}
