//! Dispatcher-facing operations.
//!
//! Every operation takes structured input and returns a structured
//! reply; none of them ever throw to the host. Failures are encoded in
//! the reply's `status` field.

mod dispatch;
mod learning;
mod queries;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::service::ServiceHandle;

pub use dispatch::{DispatchInput, DispatchReply, DispatchStatus};
pub use learning::{AddLearningInput, AddLearningReply, LearningsInput};
pub use queries::{ActivityReply, AgentActivity, JobView, ListInput, ListReply, StatusFilter};

/// Identity the host resolved for the calling agent. Opaque to the
/// orchestrator beyond the agent id.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub agent_id: String,
    pub session_key: Option<String>,
    pub depth: Option<u32>,
    pub origin: Option<crate::record::DispatcherOrigin>,
}

impl CallerIdentity {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_key: None,
            depth: None,
            origin: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    Error,
    Forbidden,
    NotFound,
    RateLimited,
    QueueFull,
    Unauthorized,
}

/// Reply-encoded failure; the caller never sees a thrown error.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ToolFailure {
    pub status: FailureStatus,
    pub error: String,
}

impl ToolFailure {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: FailureStatus::Error,
            error: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: FailureStatus::Forbidden,
            error: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: FailureStatus::NotFound,
            error: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: FailureStatus::RateLimited,
            error: message.into(),
        }
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self {
            status: FailureStatus::QueueFull,
            error: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: FailureStatus::Unauthorized,
            error: message.into(),
        }
    }
}

/// Structured tool reply: success payload or encoded failure.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ToolReply<T> {
    Ok(T),
    Failure(ToolFailure),
}

impl<T> ToolReply<T> {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn failure(&self) -> Option<&ToolFailure> {
        match self {
            Self::Failure(f) => Some(f),
            Self::Ok(_) => None,
        }
    }

    pub fn ok(&self) -> Option<&T> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Failure(_) => None,
        }
    }
}

impl<T> From<Result<T, ToolFailure>> for ToolReply<T> {
    fn from(result: Result<T, ToolFailure>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(failure) => Self::Failure(failure),
        }
    }
}

/// The tool surface. Holds the service handle and resolves components
/// per call, so tools keep working (in fallback mode) when the service
/// is degraded or not yet started.
pub struct Tools {
    handle: ServiceHandle,
}

impl Tools {
    pub fn new(handle: ServiceHandle) -> Self {
        Self { handle }
    }

    pub(crate) fn handle(&self) -> &ServiceHandle {
        &self.handle
    }
}
