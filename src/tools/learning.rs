//! Learning tools: `add_learning` (system agents only) and `learnings`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{CallerIdentity, ToolFailure, ToolReply, Tools};
use crate::learning::{LearningEntry, MAX_LEARNING_CHARS, MAX_TAGS, NewLearning};

const DEFAULT_QUERY_LIMIT: usize = 20;
const MAX_QUERY_LIMIT: usize = 100;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddLearningInput {
    pub project_id: String,
    pub job_id: String,
    pub learning: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub previous_job_id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddLearningReply {
    pub status: &'static str,
    pub id: String,
    pub project_id: String,
    pub job_id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct LearningsInput {
    pub project_id: Option<String>,
    pub job_id: Option<String>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

impl Tools {
    pub async fn add_learning(
        &self,
        caller: &CallerIdentity,
        input: AddLearningInput,
    ) -> ToolReply<AddLearningReply> {
        self.add_learning_inner(caller, input).await.into()
    }

    async fn add_learning_inner(
        &self,
        caller: &CallerIdentity,
        input: AddLearningInput,
    ) -> Result<AddLearningReply, ToolFailure> {
        let Some(components) = self.handle().resolve() else {
            return Err(ToolFailure::error("orchestrator is not running"));
        };
        if !components.config.is_system_agent(&caller.agent_id) {
            return Err(ToolFailure::unauthorized(
                "add_learning is restricted to system agents",
            ));
        }
        let Some(learnings) = components.learnings.clone() else {
            return Err(ToolFailure::error("learning index unavailable"));
        };
        if input.project_id.is_empty() || input.job_id.is_empty() {
            return Err(ToolFailure::error("projectId and jobId are required"));
        }
        if input.learning.chars().count() > MAX_LEARNING_CHARS {
            return Err(ToolFailure::error(format!(
                "learning exceeds {} characters",
                MAX_LEARNING_CHARS
            )));
        }
        if input.tags.len() > MAX_TAGS {
            return Err(ToolFailure::error(format!(
                "at most {} tags are allowed",
                MAX_TAGS
            )));
        }

        let entry = learnings
            .add(NewLearning {
                project_id: input.project_id,
                job_id: input.job_id,
                previous_job_id: input.previous_job_id,
                phase: input.phase,
                agent_id: caller.agent_id.clone(),
                learning: input.learning,
                tags: input.tags,
            })
            .await
            .map_err(|e| ToolFailure::error(e.to_string()))?;

        Ok(AddLearningReply {
            status: "ok",
            id: entry.id,
            project_id: entry.project_id,
            job_id: entry.job_id,
            tags: entry.tags,
        })
    }

    pub async fn learnings(
        &self,
        _caller: &CallerIdentity,
        input: LearningsInput,
    ) -> ToolReply<Vec<LearningEntry>> {
        self.learnings_inner(input).await.into()
    }

    async fn learnings_inner(
        &self,
        input: LearningsInput,
    ) -> Result<Vec<LearningEntry>, ToolFailure> {
        let Some(components) = self.handle().resolve() else {
            return Err(ToolFailure::error("orchestrator is not running"));
        };
        let Some(learnings) = components.learnings.clone() else {
            return Err(ToolFailure::error("learning index unavailable"));
        };
        let limit = input
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);

        match (&input.project_id, &input.job_id) {
            (Some(project_id), None) => learnings
                .by_project(project_id, &input.tags, limit)
                .await
                .map_err(|e| ToolFailure::error(e.to_string())),
            (None, Some(job_id)) => learnings
                .by_job(job_id, &input.tags, limit)
                .await
                .map_err(|e| ToolFailure::error(e.to_string())),
            _ => Err(ToolFailure::error(
                "exactly one of projectId or jobId is required",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::breaker::CircuitBreaker;
    use crate::config::ForemanConfig;
    use crate::learning::LearningIndex;
    use crate::service::{Components, ServiceHandle};
    use crate::spawn::SessionLauncher;
    use crate::store::MemoryStore;
    use crate::testing::{host_ok, sender_ok};

    fn tools() -> Tools {
        let mut config = ForemanConfig::default();
        config.system_agents = vec!["main".to_string()];
        let config = Arc::new(config);
        let host = host_ok();
        let handle = ServiceHandle::new();
        handle.install(Arc::new(Components {
            config: Arc::clone(&config),
            breaker: Arc::new(CircuitBreaker::new(&config.circuit_breaker)),
            host: host.clone(),
            sender: sender_ok(),
            launcher: Arc::new(SessionLauncher::new(host, Arc::clone(&config))),
            tracker: None,
            approvals: None,
            learnings: Some(Arc::new(LearningIndex::new(
                Arc::new(MemoryStore::new()),
                365,
            ))),
        }));
        Tools::new(handle)
    }

    fn add_input(learning: &str, tags: Vec<String>) -> AddLearningInput {
        AddLearningInput {
            project_id: "proj".to_string(),
            job_id: "j1".to_string(),
            learning: learning.to_string(),
            tags,
            previous_job_id: None,
            phase: None,
        }
    }

    #[tokio::test]
    async fn test_add_learning_requires_system_agent() {
        let tools = tools();
        let denied = tools
            .add_learning(&CallerIdentity::new("visitor"), add_input("x", vec![]))
            .await;
        assert_eq!(
            denied.failure().unwrap().status,
            super::super::FailureStatus::Unauthorized
        );

        let ok = tools
            .add_learning(&CallerIdentity::new("main"), add_input("x", vec![]))
            .await;
        assert_eq!(ok.ok().unwrap().status, "ok");
    }

    #[tokio::test]
    async fn test_add_learning_bounds() {
        let tools = tools();
        let caller = CallerIdentity::new("main");

        let too_long = tools
            .add_learning(&caller, add_input(&"x".repeat(1_025), vec![]))
            .await;
        assert!(too_long.is_failure());

        let too_many_tags = tools
            .add_learning(
                &caller,
                add_input("ok", (0..11).map(|i| format!("t{}", i)).collect()),
            )
            .await;
        assert!(too_many_tags.is_failure());
    }

    #[tokio::test]
    async fn test_learnings_requires_exactly_one_scope() {
        let tools = tools();
        let caller = CallerIdentity::new("main");
        tools
            .add_learning(&caller, add_input("fact", vec![]))
            .await;

        let neither = tools.learnings(&caller, LearningsInput::default()).await;
        assert!(neither.is_failure());

        let both = tools
            .learnings(
                &caller,
                LearningsInput {
                    project_id: Some("proj".to_string()),
                    job_id: Some("j1".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(both.is_failure());

        let by_project = tools
            .learnings(
                &caller,
                LearningsInput {
                    project_id: Some("proj".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(by_project.ok().unwrap().len(), 1);

        let by_job = tools
            .learnings(
                &caller,
                LearningsInput {
                    job_id: Some("j1".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(by_job.ok().unwrap().len(), 1);
    }
}
