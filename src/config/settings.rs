use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ForemanError, Result};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DISPATCHES_PER_MINUTE: u32 = 10;
pub const DEFAULT_MAX_QUEUE_DEPTH: u64 = 50;
pub const DEFAULT_AGENT_FAILURE_ATTEMPTS: u32 = 3;
pub const DEFAULT_AGENT_FAILURE_BASE_DELAY_MS: u64 = 300_000;
pub const DEFAULT_APPROVAL_TTL_DAYS: u32 = 7;
pub const DEFAULT_LEARNINGS_TTL_DAYS: u32 = 365;
pub const DEFAULT_MAX_SPAWN_DEPTH: u32 = 5;
pub const DEFAULT_MAX_CHILDREN_PER_AGENT: u64 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub redis: RedisConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub approval: ApprovalConfig,
    pub learnings: LearningsConfig,
    pub monitor: MonitorConfig,
    pub spawn: SpawnConfig,
    pub dispatch: DispatchLimits,
    pub defaults: ModelDefaults,
    /// Registered agents. One queue per entry.
    pub agents: HashMap<String, AgentEntry>,
    /// Agents allowed to use elevated features (system prompt additions,
    /// cross-agent visibility, learning writes).
    pub system_agents: Vec<String>,
}

impl ForemanConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| ForemanError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be greater than 0");
        }
        if self.circuit_breaker.reset_timeout_ms == 0 {
            errors.push("circuit_breaker.reset_timeout_ms must be greater than 0");
        }

        if self.retry.agent_failure_attempts == 0 {
            errors.push("retry.agent_failure_attempts must be greater than 0");
        }

        if self.approval.ttl_days == 0 {
            errors.push("approval.ttl_days must be greater than 0");
        }
        if self.learnings.ttl_days == 0 {
            errors.push("learnings.ttl_days must be greater than 0");
        }

        if self.spawn.max_depth == 0 {
            errors.push("spawn.max_depth must be greater than 0");
        }
        if self.spawn.max_children_per_agent == 0 {
            errors.push("spawn.max_children_per_agent must be greater than 0");
        }

        for (id, entry) in &self.agents {
            if id.is_empty() {
                errors.push("agent ids must not be empty");
            }
            if entry.allow_agents.iter().any(|a| a.is_empty()) {
                errors.push("agent allowlist entries must not be empty");
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ForemanError::Config(errors.join("; ")))
        }
    }

    pub fn is_system_agent(&self, agent_id: &str) -> bool {
        self.system_agents.iter().any(|a| a == agent_id)
    }

    pub fn is_orchestrator(&self, agent_id: &str) -> bool {
        self.approval.orchestrators.iter().any(|a| a == agent_id)
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentEntry> {
        self.agents.get(agent_id)
    }

    /// Whether `caller` may dispatch to `target`. Self-dispatch is always
    /// allowed; otherwise the caller needs the target in its allowlist or
    /// a wildcard entry.
    pub fn can_dispatch_to(&self, caller: &str, target: &str) -> bool {
        if caller == target {
            return true;
        }
        match self.agents.get(caller) {
            Some(entry) => entry
                .allow_agents
                .iter()
                .any(|a| a == "*" || a == target),
            None => false,
        }
    }

    /// Model resolution: job override, then the target agent's subagent
    /// override, then the default subagent model, then the default primary
    /// model. A final `None` means the platform default applies.
    pub fn resolve_model(&self, job_model: Option<&str>, target: &str) -> Option<String> {
        job_model
            .map(str::to_string)
            .or_else(|| self.agents.get(target).and_then(|a| a.subagent_model.clone()))
            .or_else(|| self.defaults.subagent_model.clone())
            .or_else(|| self.defaults.primary_model.clone())
    }

    /// Thinking-level resolution, same layering as `resolve_model`.
    pub fn resolve_thinking(&self, job_thinking: Option<&str>, target: &str) -> Option<String> {
        job_thinking
            .map(str::to_string)
            .or_else(|| {
                self.agents
                    .get(target)
                    .and_then(|a| a.subagent_thinking.clone())
            })
            .or_else(|| self.defaults.subagent_thinking.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub tls: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            tls: false,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        match &self.password {
            Some(password) => format!("{}://:{}@{}:{}", scheme, password, self.host, self.port),
            None => format!("{}://{}:{}", scheme, self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Milliseconds until the open breaker allows a half-open probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Per-caller dispatch cap per rolling minute. 0 disables the limit.
    pub dispatches_per_minute: u32,
    /// Per-target cap on waiting + delayed + active jobs.
    pub max_queue_depth: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            dispatches_per_minute: DEFAULT_DISPATCHES_PER_MINUTE,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Agent-level execution retry attempts (distinct from launch retries).
    pub agent_failure_attempts: u32,
    /// Base delay for agent-level exponential backoff.
    pub agent_failure_base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            agent_failure_attempts: DEFAULT_AGENT_FAILURE_ATTEMPTS,
            agent_failure_base_delay_ms: DEFAULT_AGENT_FAILURE_BASE_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Callers exempt from the approval gate.
    pub orchestrators: Vec<String>,
    /// Identities allowed to approve or reject. Empty means nobody.
    pub authorized_approvers: Vec<String>,
    /// Channel where approval notifications are posted. Empty means the
    /// approval path is unavailable and gated dispatches are rejected.
    pub discord_channel_id: String,
    pub ttl_days: u32,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            orchestrators: Vec::new(),
            authorized_approvers: Vec::new(),
            discord_channel_id: String::new(),
            ttl_days: DEFAULT_APPROVAL_TTL_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningsConfig {
    pub ttl_days: u32,
}

impl Default for LearningsConfig {
    fn default() -> Self {
        Self {
            ttl_days: DEFAULT_LEARNINGS_TTL_DAYS,
        }
    }
}

/// Monitoring endpoint token. Empty disables the endpoint entirely; the
/// dashboard itself lives outside this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Maximum dispatcher depth allowed to spawn further children.
    pub max_depth: u32,
    /// Cap on a caller's concurrently active children.
    pub max_children_per_agent: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_SPAWN_DEPTH,
            max_children_per_agent: DEFAULT_MAX_CHILDREN_PER_AGENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchLimits {
    pub max_task_chars: usize,
    pub max_depends_on: usize,
    pub max_result_chars: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_task_chars: 50_000,
            max_depends_on: 20,
            max_result_chars: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDefaults {
    pub subagent_model: Option<String>,
    pub primary_model: Option<String>,
    pub subagent_thinking: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentEntry {
    /// Targets this agent may dispatch to. `"*"` is a wildcard.
    pub allow_agents: Vec<String>,
    pub subagent_model: Option<String>,
    pub subagent_thinking: Option<String>,
}
