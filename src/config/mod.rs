//! Configuration loading and validation.
//!
//! - `ForemanConfig`: top-level configuration with serde defaults
//! - `AgentEntry`: per-agent registry entry (allowlist, model overrides)
//! - All sections validate together; violations are collected into a
//!   single configuration error

mod settings;

pub use settings::{
    AgentEntry, ApprovalConfig, CircuitBreakerConfig, DispatchLimits, ForemanConfig,
    LearningsConfig, ModelDefaults, MonitorConfig, RateLimitConfig, RedisConfig, RetryConfig,
    SpawnConfig,
};
