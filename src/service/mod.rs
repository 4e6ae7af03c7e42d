//! Orchestrator service lifecycle.
//!
//! Wires the components, runs restart recovery, owns the worker fleet
//! and background tasks, and exposes a `ServiceHandle` that hooks and
//! tools resolve at call time. The handle holds either a fully
//! initialized component set or nothing; readers never observe a partial
//! service.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::DlqAlerter;
use crate::approval::ApprovalService;
use crate::breaker::CircuitBreaker;
use crate::config::ForemanConfig;
use crate::error::Result;
use crate::gate::GateHandler;
use crate::host::{MessageSender, SessionHost};
use crate::learning::LearningIndex;
use crate::queue::{GATE_CONCURRENCY, QueueEvents, QueueTuning, Worker, WorkerHandle};
use crate::spawn::{LaunchHandler, SessionLauncher};
use crate::store::{RedisStore, Store};
use crate::tracker::JobTracker;

/// Store readiness bound at startup. Past it the service starts without
/// a tracker and the dispatch tool runs in direct-fallback mode.
pub const STORE_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the stale-index sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Grace window for worker drain at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything the tools and hooks reach for. Store-dependent components
/// are absent when the store was unreachable at startup.
pub struct Components {
    pub config: Arc<ForemanConfig>,
    pub breaker: Arc<CircuitBreaker>,
    pub host: Arc<dyn SessionHost>,
    pub sender: Arc<dyn MessageSender>,
    pub launcher: Arc<SessionLauncher>,
    pub tracker: Option<Arc<JobTracker>>,
    pub approvals: Option<Arc<ApprovalService>>,
    pub learnings: Option<Arc<LearningIndex>>,
}

/// Stable handle passed to hooks and tools. Components resolve lazily so
/// registration can precede service start; readers see the installed set
/// or none.
#[derive(Clone, Default)]
pub struct ServiceHandle {
    inner: Arc<RwLock<Option<Arc<Components>>>>,
}

impl ServiceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self) -> Option<Arc<Components>> {
        self.inner.read().clone()
    }

    pub(crate) fn install(&self, components: Arc<Components>) {
        *self.inner.write() = Some(components);
    }

    pub(crate) fn clear(&self) {
        *self.inner.write() = None;
    }
}

pub struct OrchestratorService {
    handle: ServiceHandle,
    shutdown: watch::Sender<bool>,
    workers: Vec<WorkerHandle>,
    background: Vec<JoinHandle<()>>,
}

impl OrchestratorService {
    /// Connect to the configured store and start. A store that fails the
    /// readiness timeout is treated as absent, not fatal.
    pub async fn start(
        config: ForemanConfig,
        host: Arc<dyn SessionHost>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Self> {
        let url = config.redis.url();
        let store: Option<Arc<dyn Store>> =
            match tokio::time::timeout(STORE_READY_TIMEOUT, RedisStore::connect(&url)).await {
                Ok(Ok(store)) => Some(Arc::new(store)),
                Ok(Err(e)) => {
                    warn!(error = %e, "Store connection failed, dispatch will run in fallback mode");
                    None
                }
                Err(_) => {
                    warn!(
                        timeout_secs = STORE_READY_TIMEOUT.as_secs(),
                        "Store not ready in time, dispatch will run in fallback mode"
                    );
                    None
                }
            };
        Self::start_with_store(config, host, sender, store).await
    }

    /// Start against an already-selected store backend. Tests and
    /// embedders inject a `MemoryStore` here.
    pub async fn start_with_store(
        config: ForemanConfig,
        host: Arc<dyn SessionHost>,
        sender: Arc<dyn MessageSender>,
        store: Option<Arc<dyn Store>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));
        let launcher = Arc::new(SessionLauncher::new(Arc::clone(&host), Arc::clone(&config)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();
        let mut background = Vec::new();

        let (tracker, approvals, learnings) = match store {
            Some(store) => {
                let events = QueueEvents::default();
                let tracker = Arc::new(JobTracker::new(
                    Arc::clone(&store),
                    QueueTuning::default(),
                    events.clone(),
                ));

                // Register every configured queue before recovery so the
                // scan sees them.
                for agent_id in config.agents.keys() {
                    tracker.agent_queue(agent_id);
                }

                match tracker.recover_interrupted().await {
                    Ok(recovered) if !recovered.is_empty() => {
                        info!(count = recovered.len(), "Recovered interrupted jobs as failed");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Restart recovery failed"),
                }

                // One worker per configured agent, single-file within a
                // queue; parallelism is across queues.
                for agent_id in config.agents.keys() {
                    let queue = tracker.agent_queue(agent_id);
                    let handler = Arc::new(LaunchHandler::new(
                        Arc::clone(&tracker),
                        Arc::clone(&launcher),
                    ));
                    workers.push(Worker::new(queue, handler, 1).spawn(shutdown_rx.clone()));
                }
                let gate_handler = Arc::new(GateHandler::new(Arc::clone(&tracker)));
                workers.push(
                    Worker::new(
                        tracker.flow().gate_queue().clone(),
                        gate_handler,
                        GATE_CONCURRENCY,
                    )
                    .spawn(shutdown_rx.clone()),
                );

                if let Some(alerter) =
                    DlqAlerter::new(Arc::clone(&tracker), Arc::clone(&sender), &config)
                {
                    let events = events.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    background.push(tokio::spawn(async move {
                        alerter.run(events, shutdown_rx).await;
                    }));
                }

                background.push(spawn_cleanup_loop(Arc::clone(&tracker), shutdown_rx.clone()));
                background.push(spawn_keepalive(
                    Arc::clone(&store),
                    Arc::clone(&breaker),
                    shutdown_rx.clone(),
                ));

                let approvals = Arc::new(ApprovalService::new(
                    Arc::clone(&store),
                    Arc::clone(&config),
                    Arc::clone(&sender),
                    Arc::clone(&launcher),
                ));
                let learnings = Arc::new(LearningIndex::new(
                    Arc::clone(&store),
                    config.learnings.ttl_days,
                ));
                (Some(tracker), Some(approvals), Some(learnings))
            }
            None => (None, None, None),
        };

        let handle = ServiceHandle::new();
        handle.install(Arc::new(Components {
            config,
            breaker,
            host,
            sender,
            launcher,
            tracker,
            approvals,
            learnings,
        }));

        info!(workers = workers.len(), "Orchestrator service started");
        Ok(Self {
            handle,
            shutdown,
            workers,
            background,
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Stop in dependency order: workers first (they hold queue locks),
    /// then event subscriptions and background loops, then the
    /// components themselves.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            worker.join_timeout(SHUTDOWN_GRACE).await;
        }
        for task in self.background {
            task.abort();
            let _ = task.await;
        }
        self.handle.clear();
        info!("Orchestrator service stopped");
    }
}

fn spawn_cleanup_loop(
    tracker: Arc<JobTracker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            // Periodic housekeeping never takes the service down.
            if let Err(e) = tracker.cleanup_stale_index_entries().await {
                warn!(error = %e, "Stale-index cleanup failed");
            }
        }
    })
}

fn spawn_keepalive(
    store: Arc<dyn Store>,
    breaker: Arc<CircuitBreaker>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        crate::store::keepalive_loop(store, shutdown, move |reason| {
            breaker.force_open(reason);
        })
        .await;
    })
}
