//! Dependency flows.
//!
//! A job with dependencies becomes a parent parked behind one gate job
//! per dependency on the `dep-gates` queue. Gates complete when their
//! dependency completes; the last gate releases the parent to waiting.
//! A failed gate never decrements the counter, so the parent stays
//! parked permanently (fail-fast, single level).

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::job::{JobEnvelope, ParentRef};
use super::queue::Queue;
use crate::error::Result;
use crate::store::{Store, keys};

/// Payload of one gate job.
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePayload {
    pub dependency_job_id: String,
    pub parent_target: String,
}

pub struct FlowProducer {
    gate_queue: Queue<GatePayload>,
}

impl FlowProducer {
    pub fn new(gate_queue: Queue<GatePayload>) -> Self {
        Self { gate_queue }
    }

    pub fn gate_queue(&self) -> &Queue<GatePayload> {
        &self.gate_queue
    }

    /// Park `parent` on its queue and enqueue one gate per dependency.
    pub async fn create_flow<T>(
        &self,
        parent_queue: &Queue<T>,
        parent: &JobEnvelope<T>,
        dependencies: &[String],
        parent_target: &str,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        parent_queue
            .add_gated(parent, dependencies.len() as u64)
            .await?;
        for dependency_job_id in dependencies {
            let gate = JobEnvelope::new(
                format!("gate-{}", Uuid::new_v4()),
                GatePayload {
                    dependency_job_id: dependency_job_id.clone(),
                    parent_target: parent_target.to_string(),
                },
                self.gate_queue.tuning(),
            )
            .with_parent(ParentRef {
                queue: parent_queue.name().to_string(),
                job_id: parent.id.clone(),
            });
            self.gate_queue.add(&gate).await?;
        }
        Ok(())
    }
}

/// Record one gate completion against the parent. The decrement and the
/// release to waiting happen in a single atomic store operation, so two
/// gates finishing together cannot release the parent twice or strand
/// it. Returns whether the parent was released.
pub(super) async fn release_gate(store: &dyn Store, parent: &ParentRef) -> Result<bool> {
    let remaining = store
        .complete_gate(
            &keys::queue_gate_counts(&parent.queue),
            &keys::queue_waiting_children(&parent.queue),
            &keys::queue_waiting(&parent.queue),
            &parent.job_id,
        )
        .await?;
    Ok(remaining <= 0)
}
