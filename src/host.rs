//! External collaborator interfaces.
//!
//! The session host runs the actual agent sessions and the announce
//! pipeline; the message sender delivers approval notifications and DLQ
//! alerts. The orchestrator consumes these seams and never executes
//! model calls or chat-platform traffic itself.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ForemanError, HostError};
use crate::record::{Cleanup, DispatcherOrigin};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub session_key: String,
    pub task: String,
    pub system_prompt: Option<String>,
    /// Announce-pipeline delivery is registered separately; direct
    /// delivery stays off for tracked spawns.
    pub deliver: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StartedSession {
    pub run_id: String,
}

/// Combined session patch, applied in a single round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    pub depth: Option<u32>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

impl HistoryMessage {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}

/// Announce-pipeline registration so child results route back to the
/// dispatcher.
#[derive(Debug, Clone)]
pub struct SubagentRegistration {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: Option<String>,
    pub origin: Option<DispatcherOrigin>,
    pub label: Option<String>,
    pub cleanup: Cleanup,
}

#[async_trait]
pub trait SessionHost: Send + Sync {
    async fn start_session(
        &self,
        request: StartSessionRequest,
    ) -> std::result::Result<StartedSession, HostError>;

    async fn patch_session(
        &self,
        session_key: &str,
        patch: SessionPatch,
    ) -> std::result::Result<(), HostError>;

    async fn send_to_session(
        &self,
        session_key: &str,
        message: &str,
    ) -> std::result::Result<(), HostError>;

    async fn fetch_session_history(
        &self,
        session_key: &str,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryMessage>, HostError>;

    async fn register_subagent_run(
        &self,
        registration: SubagentRegistration,
    ) -> std::result::Result<(), HostError>;

    /// Depth recorded for an existing session, when the dispatcher did
    /// not carry one.
    async fn session_depth(
        &self,
        session_key: &str,
    ) -> std::result::Result<Option<u32>, HostError>;
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: String,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        channel: &str,
        target: &str,
        content: &str,
        idempotency_key: &str,
    ) -> std::result::Result<SentMessage, ForemanError>;

    async fn remove_reaction(
        &self,
        channel: &str,
        message_id: &str,
        emoji: &str,
        reactor: Option<&str>,
    ) -> std::result::Result<(), ForemanError>;
}
