use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ForemanConfig;
use crate::error::HostError;
use crate::host::{SessionHost, SessionPatch, StartSessionRequest, SubagentRegistration};
use crate::queue::WorkerError;
use crate::record::{Cleanup, DispatcherOrigin};

/// Child session run-timeout clamp, in seconds.
pub const MIN_TIMEOUT_SECONDS: u64 = 30;
pub const MAX_TIMEOUT_SECONDS: u64 = 24 * 60 * 60;

/// Everything a launch needs, independent of where the request came
/// from.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub target: String,
    pub task: String,
    pub label: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub system_prompt_addition: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub cleanup: Cleanup,
    pub dispatcher_agent_id: String,
    pub dispatcher_session_key: Option<String>,
    pub dispatcher_depth: Option<u32>,
    pub origin: Option<DispatcherOrigin>,
}

/// Safety posture for a launch.
#[derive(Debug, Clone, Copy)]
pub enum LaunchChecks {
    /// Queue-worker path: depth, fan-out, and allowlist all enforced.
    /// Carries the dispatcher's current active-children count.
    Enforced { active_children: u64 },
    /// Post-approval path: a human signed off, so the checks are skipped
    /// and the caller depth is pinned to the top level.
    Approved,
}

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub run_id: String,
    pub session_key: String,
    pub child_depth: u32,
    pub model: Option<String>,
}

/// Display form of an opaque session key, for prompts and logs.
fn display_session_key(session_key: &str) -> String {
    session_key.replace(':', "/")
}

/// Subagent system prompt assembled for the child.
fn build_subagent_prompt(spec: &LaunchSpec, dispatcher_display: &str) -> String {
    let mut prompt = format!(
        "You are a subagent of {} working as {}.",
        dispatcher_display, spec.target
    );
    if let Some(label) = &spec.label {
        prompt.push_str(&format!(" Task label: {}.", label));
    }
    prompt.push_str(" Report your result when done; it will be announced to the dispatcher.");
    if let Some(addition) = &spec.system_prompt_addition {
        prompt.push_str("\n\n");
        prompt.push_str(addition);
    }
    prompt
}

pub struct SessionLauncher {
    host: Arc<dyn SessionHost>,
    config: Arc<ForemanConfig>,
}

impl SessionLauncher {
    pub fn new(host: Arc<dyn SessionHost>, config: Arc<ForemanConfig>) -> Self {
        Self { host, config }
    }

    pub fn host(&self) -> &Arc<dyn SessionHost> {
        &self.host
    }

    /// Run the launch sequence and return the child linkage. Errors are
    /// already classified for the queue's retry policy.
    pub async fn launch(
        &self,
        spec: &LaunchSpec,
        checks: LaunchChecks,
    ) -> Result<LaunchOutcome, WorkerError> {
        let timeout_seconds = spec
            .timeout_seconds
            .map(|t| t.clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS));

        let dispatcher_display = spec
            .dispatcher_session_key
            .as_deref()
            .map(display_session_key)
            .unwrap_or_else(|| spec.dispatcher_agent_id.clone());

        let caller_depth = self.resolve_caller_depth(spec, checks).await?;

        if let LaunchChecks::Enforced { active_children } = checks {
            if caller_depth >= self.config.spawn.max_depth {
                return Err(WorkerError::Unrecoverable(format!(
                    "Spawn depth limit reached: {} >= {}",
                    caller_depth, self.config.spawn.max_depth
                )));
            }
            if active_children >= self.config.spawn.max_children_per_agent {
                return Err(WorkerError::Recoverable(format!(
                    "Active children limit reached: {}/{}",
                    active_children, self.config.spawn.max_children_per_agent
                )));
            }
            if !self
                .config
                .can_dispatch_to(&spec.dispatcher_agent_id, &spec.target)
            {
                return Err(WorkerError::Unrecoverable(format!(
                    "Agent {} is not allowed to dispatch to {}",
                    spec.dispatcher_agent_id, spec.target
                )));
            }
        }

        let session_key = format!("agent:{}:subagent:{}", spec.target, Uuid::new_v4());
        let child_depth = caller_depth + 1;
        let model = self
            .config
            .resolve_model(spec.model.as_deref(), &spec.target);
        let thinking_level = self
            .config
            .resolve_thinking(spec.thinking_level.as_deref(), &spec.target);

        self.patch_child(&session_key, child_depth, model.clone(), thinking_level)
            .await?;

        let prompt = build_subagent_prompt(spec, &dispatcher_display);

        let started = self
            .host
            .start_session(StartSessionRequest {
                session_key: session_key.clone(),
                task: spec.task.clone(),
                system_prompt: Some(prompt),
                deliver: false,
                timeout_ms: timeout_seconds.map(|t| t * 1_000),
            })
            .await
            .map_err(classify_host_error)?;

        self.host
            .register_subagent_run(SubagentRegistration {
                run_id: started.run_id.clone(),
                child_session_key: session_key.clone(),
                requester_session_key: spec.dispatcher_session_key.clone(),
                origin: spec.origin.clone(),
                label: spec.label.clone(),
                cleanup: spec.cleanup,
            })
            .await
            .map_err(classify_host_error)?;

        debug!(target = %spec.target, run_id = %started.run_id, child_depth,
            "Child session launched");

        Ok(LaunchOutcome {
            run_id: started.run_id,
            session_key,
            child_depth,
            model,
        })
    }

    async fn resolve_caller_depth(
        &self,
        spec: &LaunchSpec,
        checks: LaunchChecks,
    ) -> Result<u32, WorkerError> {
        if matches!(checks, LaunchChecks::Approved) {
            return Ok(0);
        }
        if let Some(depth) = spec.dispatcher_depth {
            return Ok(depth);
        }
        match &spec.dispatcher_session_key {
            Some(session_key) => self
                .host
                .session_depth(session_key)
                .await
                .map(|d| d.unwrap_or(0))
                .map_err(classify_host_error),
            None => Ok(0),
        }
    }

    /// Combined patch in one round-trip; a model error retries once
    /// without the model field so a bad override does not strand the
    /// launch.
    async fn patch_child(
        &self,
        session_key: &str,
        depth: u32,
        model: Option<String>,
        thinking_level: Option<String>,
    ) -> Result<(), WorkerError> {
        let had_model = model.is_some();
        let patch = SessionPatch {
            depth: Some(depth),
            model,
            thinking_level: thinking_level.clone(),
            system_prompt: None,
        };
        match self.host.patch_session(session_key, patch).await {
            Ok(()) => Ok(()),
            Err(e) if had_model && e.is_model_error() => {
                warn!(session_key, error = %e, "Model patch rejected, retrying without model");
                self.host
                    .patch_session(
                        session_key,
                        SessionPatch {
                            depth: Some(depth),
                            model: None,
                            thinking_level,
                            system_prompt: None,
                        },
                    )
                    .await
                    .map_err(classify_host_error)
            }
            Err(e) => Err(classify_host_error(e)),
        }
    }
}

fn classify_host_error(e: HostError) -> WorkerError {
    if e.is_transient() {
        WorkerError::Recoverable(e.to_string())
    } else {
        WorkerError::Unrecoverable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentEntry;

    fn spec(target: &str, caller: &str, depth: Option<u32>) -> LaunchSpec {
        LaunchSpec {
            target: target.to_string(),
            task: "echo hello".to_string(),
            label: Some("smoke".to_string()),
            model: None,
            thinking_level: None,
            system_prompt_addition: None,
            timeout_seconds: Some(1),
            cleanup: Cleanup::Delete,
            dispatcher_agent_id: caller.to_string(),
            dispatcher_session_key: Some(format!("agent:{}:main", caller)),
            dispatcher_depth: depth,
            origin: None,
        }
    }

    fn config() -> Arc<ForemanConfig> {
        let mut config = ForemanConfig::default();
        config.agents.insert(
            "main".to_string(),
            AgentEntry {
                allow_agents: vec!["*".to_string()],
                ..Default::default()
            },
        );
        config.agents.insert("jarvis".to_string(), AgentEntry::default());
        Arc::new(config)
    }

    #[test]
    fn test_prompt_includes_label_and_addition() {
        let mut s = spec("jarvis", "main", Some(0));
        s.system_prompt_addition = Some("Prefer terse output.".to_string());
        let prompt = build_subagent_prompt(&s, "agent/main/main");
        assert!(prompt.contains("subagent of agent/main/main"));
        assert!(prompt.contains("working as jarvis"));
        assert!(prompt.contains("Task label: smoke."));
        assert!(prompt.ends_with("Prefer terse output."));
    }

    #[test]
    fn test_display_session_key() {
        assert_eq!(display_session_key("agent:main:main"), "agent/main/main");
    }

    #[tokio::test]
    async fn test_depth_limit_is_unrecoverable() {
        let host = crate::testing::host_ok();
        let launcher = SessionLauncher::new(host, config());
        let err = launcher
            .launch(
                &spec("jarvis", "main", Some(5)),
                LaunchChecks::Enforced { active_children: 0 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Unrecoverable(_)));
        assert!(err.to_string().contains("depth limit"));
    }

    #[tokio::test]
    async fn test_fanout_cap_is_recoverable() {
        let host = crate::testing::host_ok();
        let launcher = SessionLauncher::new(host, config());
        let err = launcher
            .launch(
                &spec("jarvis", "main", Some(0)),
                LaunchChecks::Enforced { active_children: 5 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Recoverable(_)));
    }

    #[tokio::test]
    async fn test_allowlist_violation_is_unrecoverable() {
        let host = crate::testing::host_ok();
        let launcher = SessionLauncher::new(host, config());
        let err = launcher
            .launch(
                &spec("main", "jarvis", Some(0)),
                LaunchChecks::Enforced { active_children: 0 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Unrecoverable(_)));
    }

    #[tokio::test]
    async fn test_approved_path_skips_checks_and_pins_depth() {
        let host = crate::testing::host_ok();
        let launcher = SessionLauncher::new(host, config());
        // Depth 99 and a disallowed caller would both fail enforced
        // checks; the approved path ignores them.
        let outcome = launcher
            .launch(&spec("main", "jarvis", Some(99)), LaunchChecks::Approved)
            .await
            .unwrap();
        assert_eq!(outcome.child_depth, 1);
        assert!(outcome.session_key.starts_with("agent:main:subagent:"));
    }

    #[tokio::test]
    async fn test_successful_launch_links_session() {
        let host = crate::testing::host_ok();
        let launcher = SessionLauncher::new(host.clone(), config());
        let outcome = launcher
            .launch(
                &spec("jarvis", "main", Some(1)),
                LaunchChecks::Enforced { active_children: 0 },
            )
            .await
            .unwrap();
        assert_eq!(outcome.child_depth, 2);
        assert!(outcome.session_key.starts_with("agent:jarvis:subagent:"));
    }
}
