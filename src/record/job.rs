use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobStatus;

/// Disposition of the child session once the job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Cleanup {
    #[default]
    Delete,
    Keep,
}

/// Where the dispatching conversation lives, for routing announcements
/// and failure notices back to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherOrigin {
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub to: Option<String>,
    pub thread_id: Option<String>,
}

/// Persistent job record. Serialized camelCase to match the keyspace
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobRecord {
    // Identity.
    pub job_id: String,
    /// Root of a retry chain; absent on the first attempt.
    pub original_job_id: Option<String>,
    /// Forward pointer set when this record was superseded by a retry.
    pub retried_by_job_id: Option<String>,

    // Dispatch parameters.
    pub target: String,
    pub task: String,
    pub dispatched_by: String,
    pub project: Option<String>,
    pub label: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub system_prompt_addition: Option<String>,
    pub cleanup: Cleanup,
    pub depth: Option<u32>,
    pub depends_on: Vec<String>,

    // Lifecycle.
    pub status: JobStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // Result.
    pub result: Option<String>,
    pub error: Option<String>,

    // Dispatcher context.
    pub dispatcher_session_key: Option<String>,
    pub dispatcher_agent_id: Option<String>,
    pub dispatcher_depth: Option<u32>,
    pub dispatcher_origin: Option<DispatcherOrigin>,

    // Session-host linkage, written once the child launches.
    pub run_id: Option<String>,
    pub session_key: Option<String>,

    // Timeouts and retry accounting.
    pub timeout_ms: Option<u64>,
    pub retry_count: u32,
    pub store_result: bool,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            original_job_id: None,
            retried_by_job_id: None,
            target: String::new(),
            task: String::new(),
            dispatched_by: String::new(),
            project: None,
            label: None,
            model: None,
            thinking_level: None,
            system_prompt_addition: None,
            cleanup: Cleanup::default(),
            depth: None,
            depends_on: Vec::new(),
            status: JobStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            dispatcher_session_key: None,
            dispatcher_agent_id: None,
            dispatcher_depth: None,
            dispatcher_origin: None,
            run_id: None,
            session_key: None,
            timeout_ms: None,
            retry_count: 0,
            store_result: false,
        }
    }
}

impl JobRecord {
    pub fn new(
        job_id: impl Into<String>,
        target: impl Into<String>,
        task: impl Into<String>,
        dispatched_by: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            target: target.into(),
            task: task.into(),
            dispatched_by: dispatched_by.into(),
            queued_at: Utc::now(),
            ..Default::default()
        }
    }

    /// Root of this record's retry chain.
    pub fn chain_root(&self) -> &str {
        self.original_job_id.as_deref().unwrap_or(&self.job_id)
    }

    /// Build the follow-up record for an agent-level retry: a fresh job
    /// on the same queue with the attempt counter advanced and the chain
    /// root carried over.
    pub fn retry_successor(&self, new_job_id: impl Into<String>) -> Self {
        Self {
            job_id: new_job_id.into(),
            original_job_id: Some(self.chain_root().to_string()),
            retried_by_job_id: None,
            status: JobStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            run_id: None,
            session_key: None,
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

/// Fields a status update may set alongside the new status.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<String>,
    pub run_id: Option<String>,
    pub session_key: Option<String>,
    pub retried_by_job_id: Option<String>,
}

impl RecordPatch {
    pub fn apply_to(&self, record: &mut JobRecord) {
        if let Some(at) = self.started_at {
            record.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            record.completed_at = Some(at);
        }
        if let Some(error) = &self.error {
            record.error = Some(error.clone());
        }
        if let Some(result) = &self.result {
            record.result = Some(result.clone());
        }
        if let Some(run_id) = &self.run_id {
            record.run_id = Some(run_id.clone());
        }
        if let Some(session_key) = &self.session_key {
            record.session_key = Some(session_key.clone());
        }
        if let Some(retried_by) = &self.retried_by_job_id {
            record.retried_by_job_id = Some(retried_by.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_round_trip() {
        let mut record = JobRecord::new("j1", "jarvis", "echo hello", "main");
        record.run_id = Some("r1".to_string());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"jobId\":\"j1\""));
        assert!(json.contains("\"dispatchedBy\":\"main\""));
        assert!(json.contains("\"runId\":\"r1\""));
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.job_id, record.job_id);
        assert_eq!(back.status, JobStatus::Queued);
    }

    #[test]
    fn test_retry_successor_keeps_chain_root() {
        let mut first = JobRecord::new("j1", "jarvis", "task", "main");
        first.status = JobStatus::Failed;
        first.error = Some("exec failed".to_string());

        let second = first.retry_successor("j2");
        assert_eq!(second.original_job_id.as_deref(), Some("j1"));
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.status, JobStatus::Queued);
        assert!(second.error.is_none());
        assert!(second.run_id.is_none());

        let third = second.retry_successor("j3");
        assert_eq!(third.original_job_id.as_deref(), Some("j1"));
        assert_eq!(third.retry_count, 2);
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let mut record = JobRecord::new("j1", "jarvis", "task", "main");
        record.error = Some("old".to_string());
        let patch = RecordPatch {
            result: Some("output".to_string()),
            ..Default::default()
        };
        patch.apply_to(&mut record);
        assert_eq!(record.result.as_deref(), Some("output"));
        assert_eq!(record.error.as_deref(), Some("old"));
    }
}
