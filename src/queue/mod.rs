//! Store-backed queue engine.
//!
//! One logical queue per agent plus the dependency-gate queue, all built
//! on the `Store` trait:
//! - `Queue<T>`: key-family handle (waiting list, delayed/active zsets,
//!   envelope hash, completed/failed zsets with retention)
//! - `Worker<T>`: polling loop with lock-based claims, stall detection,
//!   and launch-retry backoff
//! - `FlowProducer`: parent jobs gated on dependency completion
//! - `QueueEvents`: broadcast stream of completed/failed/stalled events
//!
//! Queue completion here means the unit of work handed to the handler
//! finished (for agent queues: the launch). Record-level completion is
//! tracked separately on the job record.

mod config;
mod events;
mod flow;
mod job;
#[allow(clippy::module_inception)]
mod queue;
mod worker;

use thiserror::Error;

pub use config::{GATE_CONCURRENCY, GATE_LOCK_DURATION_MS, MIN_LOCK_DURATION_MS, QueueTuning, Retention};
pub use events::{QueueEvent, QueueEventKind, QueueEvents};
pub use flow::{FlowProducer, GatePayload};
pub use job::{JobEnvelope, ParentRef};
pub use queue::{Queue, QueueCounts};
pub use worker::{JobHandler, Worker, WorkerHandle};

/// Handler failure, classified for the retry policy. Unrecoverable
/// failures (bad configuration, depth or allowlist violations) go
/// straight to the failed set; recoverable ones re-enter the delayed set
/// with exponential backoff until attempts run out.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Recoverable(String),
    #[error("{0}")]
    Unrecoverable(String),
}

impl WorkerError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}
