use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::WorkerError;
use super::job::JobEnvelope;
use super::queue::Queue;
use crate::error::Result;

/// Processes one claimed job. The return value is discarded by the queue;
/// side effects (record updates, index writes) belong to the handler.
#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn process(&self, job: &JobEnvelope<T>) -> std::result::Result<(), WorkerError>;
}

/// Polling consumer for one queue.
///
/// Each concurrency slot runs its own claim loop; a separate sweeper task
/// requeues stalled jobs on the stall-check cadence. Shutdown is
/// cooperative: slots finish their in-flight job, anything they cannot
/// finish is recovered by stall detection after restart.
pub struct Worker<T> {
    queue: Queue<T>,
    handler: Arc<dyn JobHandler<T>>,
    concurrency: usize,
}

pub struct WorkerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Wait for every loop to drain. Call after flipping the shutdown
    /// signal.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task panicked during shutdown");
            }
        }
    }

    /// Drain with a grace window; anything still in flight past it (a
    /// gate mid-poll, a hung launch) is aborted and left for stall
    /// recovery after restart.
    pub async fn join_timeout(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for mut task in self.tasks {
            tokio::select! {
                _ = &mut task => {}
                _ = tokio::time::sleep_until(deadline) => {
                    task.abort();
                    let _ = task.await;
                }
            }
        }
    }
}

impl<T> Worker<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(queue: Queue<T>, handler: Arc<dyn JobHandler<T>>, concurrency: usize) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> WorkerHandle {
        let mut tasks = Vec::with_capacity(self.concurrency + 1);
        for slot in 0..self.concurrency {
            let queue = self.queue.clone();
            let handler = Arc::clone(&self.handler);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                claim_loop(queue, handler, shutdown, slot).await;
            }));
        }
        let queue = self.queue.clone();
        tasks.push(tokio::spawn(async move {
            stall_loop(queue, shutdown).await;
        }));
        WorkerHandle { tasks }
    }
}

async fn claim_loop<T>(
    queue: Queue<T>,
    handler: Arc<dyn JobHandler<T>>,
    mut shutdown: watch::Receiver<bool>,
    slot: usize,
) where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    let poll = Duration::from_millis(queue.tuning().poll_interval_ms);
    debug!(queue = %queue.name(), slot, "Worker loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let claimed = match next_job(&queue).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(queue = %queue.name(), error = %e, "Claim failed, backing off");
                None
            }
        };
        match claimed {
            Some(envelope) => {
                process_one(&queue, handler.as_ref(), envelope).await;
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    debug!(queue = %queue.name(), slot, "Worker loop stopped");
}

async fn next_job<T>(queue: &Queue<T>) -> Result<Option<JobEnvelope<T>>>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    queue.promote_due().await?;
    queue.claim().await
}

async fn process_one<T>(queue: &Queue<T>, handler: &dyn JobHandler<T>, mut envelope: JobEnvelope<T>)
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    envelope.attempts_made += 1;
    if let Err(e) = queue.save(&envelope).await {
        warn!(queue = %queue.name(), job_id = %envelope.id, error = %e,
            "Failed to persist attempt count");
    }

    let outcome = handler.process(&envelope).await;
    let finish = match outcome {
        Ok(()) => queue.complete(&mut envelope).await,
        Err(WorkerError::Unrecoverable(reason)) => {
            warn!(queue = %queue.name(), job_id = %envelope.id, %reason,
                "Unrecoverable launch failure");
            queue.fail(&mut envelope, &reason).await
        }
        Err(WorkerError::Recoverable(reason)) => {
            if envelope.attempts_exhausted() {
                warn!(queue = %queue.name(), job_id = %envelope.id, %reason,
                    attempts = envelope.attempts_made, "Launch attempts exhausted");
                queue.fail(&mut envelope, &reason).await
            } else {
                let delay_ms = envelope.next_backoff_ms();
                debug!(queue = %queue.name(), job_id = %envelope.id, %reason, delay_ms,
                    "Recoverable launch failure, retrying");
                queue.retry_later(&mut envelope, delay_ms).await
            }
        }
    };
    if let Err(e) = finish {
        error!(queue = %queue.name(), job_id = %envelope.id, error = %e,
            "Failed to finalize job state");
    }
}

async fn stall_loop<T>(queue: Queue<T>, mut shutdown: watch::Receiver<bool>)
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    let interval = Duration::from_millis(queue.tuning().stall_interval_ms);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return;
        }
        match queue.requeue_stalled().await {
            Ok(0) => {}
            Ok(n) => warn!(queue = %queue.name(), stalled = n, "Requeued stalled jobs"),
            Err(e) => warn!(queue = %queue.name(), error = %e, "Stall sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueEvents, QueueTuning};
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    struct ScriptedHandler {
        // One planned outcome per attempt, consumed in order.
        outcomes: Mutex<Vec<std::result::Result<(), WorkerError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(outcomes: Vec<std::result::Result<(), WorkerError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobHandler<serde_json::Value> for ScriptedHandler {
        async fn process(
            &self,
            job: &JobEnvelope<serde_json::Value>,
        ) -> std::result::Result<(), WorkerError> {
            self.seen.lock().push(job.id.clone());
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                Ok(())
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn fast_tuning() -> QueueTuning {
        QueueTuning {
            launch_backoff_base_ms: 10,
            poll_interval_ms: 10,
            stall_interval_ms: 60_000,
            ..Default::default()
        }
    }

    async fn run_until<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_worker_processes_to_completion() {
        let store = Arc::new(MemoryStore::new());
        let queue: Queue<serde_json::Value> = Queue::new(
            "agent-jarvis",
            store,
            fast_tuning(),
            QueueEvents::default(),
        );
        let handler = Arc::new(ScriptedHandler::new(vec![Ok(())]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let envelope = JobEnvelope::new("j1", serde_json::json!({}), queue.tuning());
        queue.add(&envelope).await.unwrap();

        let handle = Worker::new(queue.clone(), handler.clone(), 1).spawn(shutdown_rx);
        run_until(|| async { queue.counts().await.unwrap().completed == 1 }).await;

        shutdown_tx.send(true).unwrap();
        handle.join().await;
        assert_eq!(handler.seen.lock().as_slice(), ["j1"]);
    }

    #[tokio::test]
    async fn test_recoverable_failure_retries_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let queue: Queue<serde_json::Value> = Queue::new(
            "agent-jarvis",
            store,
            fast_tuning(),
            QueueEvents::default(),
        );
        let handler = Arc::new(ScriptedHandler::new(vec![
            Err(WorkerError::Recoverable("host timeout".into())),
            Ok(()),
        ]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue
            .add(&JobEnvelope::new("j1", serde_json::json!({}), queue.tuning()))
            .await
            .unwrap();
        let handle = Worker::new(queue.clone(), handler.clone(), 1).spawn(shutdown_rx);
        run_until(|| async { queue.counts().await.unwrap().completed == 1 }).await;

        shutdown_tx.send(true).unwrap();
        handle.join().await;
        assert_eq!(handler.seen.lock().len(), 2);
        let envelope = queue.get("j1").await.unwrap().unwrap();
        assert_eq!(envelope.attempts_made, 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_failure_skips_retries() {
        let store = Arc::new(MemoryStore::new());
        let queue: Queue<serde_json::Value> = Queue::new(
            "agent-jarvis",
            store,
            fast_tuning(),
            QueueEvents::default(),
        );
        let handler = Arc::new(ScriptedHandler::new(vec![Err(WorkerError::Unrecoverable(
            "depth limit".into(),
        ))]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue
            .add(&JobEnvelope::new("j1", serde_json::json!({}), queue.tuning()))
            .await
            .unwrap();
        let handle = Worker::new(queue.clone(), handler.clone(), 1).spawn(shutdown_rx);
        run_until(|| async { queue.counts().await.unwrap().failed == 1 }).await;

        shutdown_tx.send(true).unwrap();
        handle.join().await;
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhaust_to_dead_letter() {
        let store = Arc::new(MemoryStore::new());
        let queue: Queue<serde_json::Value> = Queue::new(
            "agent-jarvis",
            store,
            fast_tuning(),
            QueueEvents::default(),
        );
        let handler = Arc::new(ScriptedHandler::new(vec![
            Err(WorkerError::Recoverable("busy".into())),
            Err(WorkerError::Recoverable("busy".into())),
            Err(WorkerError::Recoverable("busy".into())),
        ]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        queue
            .add(&JobEnvelope::new("j1", serde_json::json!({}), queue.tuning()))
            .await
            .unwrap();
        let handle = Worker::new(queue.clone(), handler.clone(), 1).spawn(shutdown_rx);
        run_until(|| async { queue.counts().await.unwrap().failed == 1 }).await;

        shutdown_tx.send(true).unwrap();
        handle.join().await;
        assert_eq!(handler.seen.lock().len(), 3);
    }
}
