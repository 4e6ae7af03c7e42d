use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{LaunchChecks, LaunchSpec, SessionLauncher};
use crate::queue::{JobEnvelope, JobHandler, WorkerError};
use crate::record::{JobRecord, JobStatus, RecordPatch};
use crate::store::keys;
use crate::tracker::JobTracker;

/// Agent-queue handler: runs the launch sequence for one claimed job,
/// then records the dispatch-completed linkage (the execution lifecycle
/// continues under the hooks).
pub struct LaunchHandler {
    tracker: Arc<JobTracker>,
    launcher: Arc<SessionLauncher>,
}

impl LaunchHandler {
    pub fn new(tracker: Arc<JobTracker>, launcher: Arc<SessionLauncher>) -> Self {
        Self { tracker, launcher }
    }
}

#[async_trait]
impl JobHandler<JobRecord> for LaunchHandler {
    async fn process(&self, job: &JobEnvelope<JobRecord>) -> Result<(), WorkerError> {
        let record = &job.payload;

        let active_children = self
            .tracker
            .count_active_children(&record.dispatched_by)
            .await
            .map_err(|e| WorkerError::Recoverable(e.to_string()))?;

        let spec = LaunchSpec {
            target: record.target.clone(),
            task: record.task.clone(),
            label: record.label.clone(),
            model: record.model.clone(),
            thinking_level: record.thinking_level.clone(),
            system_prompt_addition: record.system_prompt_addition.clone(),
            timeout_seconds: record.timeout_ms.map(|ms| ms / 1_000),
            cleanup: record.cleanup,
            dispatcher_agent_id: record
                .dispatcher_agent_id
                .clone()
                .unwrap_or_else(|| record.dispatched_by.clone()),
            dispatcher_session_key: record.dispatcher_session_key.clone(),
            dispatcher_depth: record.dispatcher_depth.or(record.depth),
            origin: record.dispatcher_origin.clone(),
        };

        let outcome = self
            .launcher
            .launch(&spec, LaunchChecks::Enforced { active_children })
            .await?;

        self.tracker
            .update_job_status(
                &job.id,
                JobStatus::Active,
                &RecordPatch {
                    started_at: Some(Utc::now()),
                    run_id: Some(outcome.run_id.clone()),
                    session_key: Some(outcome.session_key.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| WorkerError::Recoverable(e.to_string()))?;

        self.tracker
            .index_session_key(
                &outcome.session_key,
                &job.id,
                &keys::agent_queue(&record.target),
            )
            .await
            .map_err(|e| WorkerError::Recoverable(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentEntry, ForemanConfig};
    use crate::queue::{QueueEvents, QueueTuning};
    use crate::testing::host_ok;
    use crate::store::MemoryStore;

    fn setup() -> (Arc<JobTracker>, LaunchHandler) {
        let tracker = Arc::new(JobTracker::new(
            Arc::new(MemoryStore::new()),
            QueueTuning::default(),
            QueueEvents::default(),
        ));
        let mut config = ForemanConfig::default();
        config.agents.insert(
            "main".to_string(),
            AgentEntry {
                allow_agents: vec!["*".to_string()],
                ..Default::default()
            },
        );
        config.agents.insert("jarvis".to_string(), AgentEntry::default());
        let launcher = Arc::new(SessionLauncher::new(host_ok(), Arc::new(config)));
        let handler = LaunchHandler::new(Arc::clone(&tracker), launcher);
        (tracker, handler)
    }

    #[tokio::test]
    async fn test_launch_marks_active_and_indexes_session() {
        let (tracker, handler) = setup();
        let mut record = JobRecord::new("j1", "jarvis", "echo hello", "main");
        record.dispatcher_depth = Some(0);
        tracker.create_job(record).await.unwrap();
        let envelope = tracker.locate("j1").await.unwrap().unwrap().envelope;

        handler.process(&envelope).await.unwrap();

        let updated = tracker.find_by_job_id("j1").await.unwrap().unwrap();
        assert_eq!(updated.status, JobStatus::Active);
        assert!(updated.started_at.is_some());
        let session_key = updated.session_key.clone().unwrap();
        assert!(session_key.starts_with("agent:jarvis:subagent:"));

        let by_session = tracker
            .find_by_session_key(&session_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_session.job_id, "j1");
    }

    #[tokio::test]
    async fn test_depth_violation_propagates_unrecoverable() {
        let (tracker, handler) = setup();
        let mut record = JobRecord::new("j1", "jarvis", "task", "main");
        record.dispatcher_depth = Some(10);
        tracker.create_job(record).await.unwrap();
        let envelope = tracker.locate("j1").await.unwrap().unwrap().envelope;

        let err = handler.process(&envelope).await.unwrap_err();
        assert!(matches!(err, WorkerError::Unrecoverable(_)));
    }
}
