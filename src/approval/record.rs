use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Cleanup, DispatcherOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    ApprovedSpawnFailed,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::ApprovedSpawnFailed => "approved_spawn_failed",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch parameters captured while a human decides.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub caller: String,
    pub target: String,
    pub task: String,
    pub label: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub cleanup: Cleanup,
    pub reason: Option<String>,
    pub dispatcher_session_key: Option<String>,
    pub origin: Option<DispatcherOrigin>,
}

/// Durable approval record. The `status` field is the CAS target; the
/// full untruncated task rides along so an approved spawn needs no other
/// source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: String,
    pub status: ApprovalStatus,

    pub caller: String,
    pub target: String,
    pub task: String,
    pub label: Option<String>,
    pub project: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub cleanup: Cleanup,
    pub reason: Option<String>,
    pub dispatcher_session_key: Option<String>,
    pub origin: Option<DispatcherOrigin>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub notification_message_id: Option<String>,
    #[serde(default)]
    pub notification_channel_id: Option<String>,

    #[serde(default)]
    pub spawn_run_id: Option<String>,
    #[serde(default)]
    pub spawn_session_key: Option<String>,
}

impl ApprovalRecord {
    pub fn new(id: impl Into<String>, request: ApprovalRequest, ttl_days: u32) -> Self {
        let created_at = Utc::now();
        Self {
            id: id.into(),
            status: ApprovalStatus::Pending,
            caller: request.caller,
            target: request.target,
            task: request.task,
            label: request.label,
            project: request.project,
            model: request.model,
            thinking_level: request.thinking_level,
            timeout_seconds: request.timeout_seconds,
            cleanup: request.cleanup,
            reason: request.reason,
            dispatcher_session_key: request.dispatcher_session_key,
            origin: request.origin,
            created_at,
            expires_at: created_at + Duration::days(i64::from(ttl_days)),
            approved_at: None,
            rejected_at: None,
            expired_at: None,
            notification_message_id: None,
            notification_channel_id: None,
            spawn_run_id: None,
            spawn_session_key: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
