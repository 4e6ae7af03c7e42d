//! Dependency-gate worker handler.
//!
//! Each gate job watches one dependency. A completed dependency completes
//! the gate (releasing the parent once every gate is done); a failed
//! dependency fails the gate unrecoverably, leaving the parent parked
//! permanently. Timing out is recoverable so transient store trouble does
//! not poison a healthy chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::queue::{GatePayload, JobEnvelope, JobHandler, WorkerError};
use crate::record::JobStatus;
use crate::tracker::JobTracker;

pub const GATE_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Hard cap on how long one gate attempt waits for its dependency.
pub const GATE_POLL_CAP: Duration = Duration::from_secs(30 * 60);

pub struct GateHandler {
    tracker: Arc<JobTracker>,
    poll_interval: Duration,
    poll_cap: Duration,
}

impl GateHandler {
    pub fn new(tracker: Arc<JobTracker>) -> Self {
        Self {
            tracker,
            poll_interval: GATE_POLL_INTERVAL,
            poll_cap: GATE_POLL_CAP,
        }
    }

    /// Shrink the polling cadence. Test hook; production keeps the
    /// defaults.
    pub fn with_polling(mut self, interval: Duration, cap: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_cap = cap;
        self
    }
}

#[async_trait]
impl JobHandler<GatePayload> for GateHandler {
    async fn process(&self, job: &JobEnvelope<GatePayload>) -> Result<(), WorkerError> {
        let dependency = &job.payload.dependency_job_id;
        let deadline = Instant::now() + self.poll_cap;

        loop {
            let record = self
                .tracker
                .find_by_job_id(dependency)
                .await
                .map_err(|e| WorkerError::Recoverable(e.to_string()))?;

            match record.map(|r| r.status) {
                Some(JobStatus::Completed) => {
                    debug!(dependency, gate = %job.id, "Dependency completed, gate open");
                    return Ok(());
                }
                Some(JobStatus::Failed) | Some(JobStatus::FailedPermanent) => {
                    return Err(WorkerError::Unrecoverable(format!(
                        "Dependency {} failed; parent stays blocked",
                        dependency
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(WorkerError::Unrecoverable(format!(
                        "Dependency {} no longer exists",
                        dependency
                    )));
                }
            }

            if Instant::now() >= deadline {
                return Err(WorkerError::Recoverable(format!(
                    "Timed out waiting for dependency {}",
                    dependency
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueEvents, QueueTuning};
    use crate::record::{JobRecord, RecordPatch};
    use crate::store::MemoryStore;

    fn fast_handler(tracker: Arc<JobTracker>) -> GateHandler {
        GateHandler::new(tracker)
            .with_polling(Duration::from_millis(5), Duration::from_millis(100))
    }

    fn gate_envelope(dependency: &str) -> JobEnvelope<GatePayload> {
        JobEnvelope::new(
            "gate-1",
            GatePayload {
                dependency_job_id: dependency.to_string(),
                parent_target: "jarvis".to_string(),
            },
            &QueueTuning::gate(),
        )
    }

    async fn tracker_with_job(job_id: &str) -> Arc<JobTracker> {
        let tracker = Arc::new(JobTracker::new(
            Arc::new(MemoryStore::new()),
            QueueTuning::default(),
            QueueEvents::default(),
        ));
        tracker
            .create_job(JobRecord::new(job_id, "jarvis", "step 1", "main"))
            .await
            .unwrap();
        tracker
    }

    #[tokio::test]
    async fn test_gate_opens_when_dependency_completes() {
        let tracker = tracker_with_job("d1").await;
        let handler = fast_handler(Arc::clone(&tracker));

        let waiter = tokio::spawn(async move { handler.process(&gate_envelope("d1")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker
            .update_job_status("d1", JobStatus::Active, &RecordPatch::default())
            .await
            .unwrap();
        tracker
            .update_job_status("d1", JobStatus::Completed, &RecordPatch::default())
            .await
            .unwrap();

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_dependency_is_unrecoverable() {
        let tracker = tracker_with_job("d1").await;
        tracker
            .update_job_status("d1", JobStatus::Failed, &RecordPatch::default())
            .await
            .unwrap();
        let handler = fast_handler(tracker);

        let err = handler.process(&gate_envelope("d1")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Unrecoverable(_)));
    }

    #[tokio::test]
    async fn test_missing_dependency_is_unrecoverable() {
        let tracker = tracker_with_job("other").await;
        let handler = fast_handler(tracker);
        let err = handler.process(&gate_envelope("ghost")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Unrecoverable(_)));
    }

    #[tokio::test]
    async fn test_pending_dependency_times_out_recoverable() {
        let tracker = tracker_with_job("d1").await;
        let handler = fast_handler(tracker);
        let err = handler.process(&gate_envelope("d1")).await.unwrap_err();
        assert!(matches!(err, WorkerError::Recoverable(_)));
    }
}
