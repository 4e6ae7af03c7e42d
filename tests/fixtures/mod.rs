//! Shared test doubles and helpers for the integration suite.
#![allow(dead_code)]

pub mod mock_host;

use std::sync::Arc;

use foreman::config::{AgentEntry, ForemanConfig};

pub use mock_host::{MockSender, MockSessionHost};

/// Config with a small fleet: `main` (orchestrator, wildcard allowlist),
/// `iris` (orchestrator, may reach jarvis), `visitor` (gated), and
/// `jarvis` (worker).
pub fn fleet_config() -> ForemanConfig {
    let mut config = ForemanConfig::default();
    config.agents.insert(
        "main".to_string(),
        AgentEntry {
            allow_agents: vec!["*".to_string()],
            ..Default::default()
        },
    );
    config.agents.insert(
        "iris".to_string(),
        AgentEntry {
            allow_agents: vec!["jarvis".to_string()],
            ..Default::default()
        },
    );
    config.agents.insert(
        "visitor".to_string(),
        AgentEntry {
            allow_agents: vec!["jarvis".to_string()],
            ..Default::default()
        },
    );
    config
        .agents
        .insert("jarvis".to_string(), AgentEntry::default());
    config.approval.orchestrators = vec!["main".to_string(), "iris".to_string()];
    config
}

pub fn mocks() -> (Arc<MockSessionHost>, Arc<MockSender>) {
    (
        Arc::new(MockSessionHost::new()),
        Arc::new(MockSender::new()),
    )
}

/// Poll until `check` passes or the deadline hits.
pub async fn wait_for<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
