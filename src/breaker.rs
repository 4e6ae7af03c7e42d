//! Circuit breaker between the dispatch tool and the job tracker.
//!
//! Three states: closed (primary path), open (straight to fallback),
//! half-open (single probe after the reset timeout). All transitions go
//! through one process-local instance, so they are linearizable without
//! cross-process coordination.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    open_reason: Option<String>,
}

/// Value returned by `run`, tagged with the path that produced it.
#[derive(Debug)]
pub struct BreakerResult<T> {
    pub value: T,
    pub from_fallback: bool,
    pub fallback_reason: Option<String>,
}

pub struct CircuitBreaker {
    fail_max: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

enum Route {
    Primary { probe: bool },
    Fallback { reason: String },
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            fail_max: config.failure_threshold,
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                open_reason: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Force the breaker open immediately. Idempotent; used on store auth
    /// failures where counting to the threshold would only repeat the
    /// same rejection.
    pub fn force_open(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Open {
            warn!(reason, "Circuit breaker forced open");
        }
        inner.state = BreakerState::Open;
        inner.last_failure = Some(Instant::now());
        inner.open_reason = Some(reason.to_string());
    }

    /// Run `primary` subject to the breaker state; on an open circuit or
    /// primary failure past the threshold, run `fallback` with the reason.
    pub async fn run<T, P, PF, F, FF>(&self, primary: P, fallback: F) -> Result<BreakerResult<T>>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T>>,
        F: FnOnce(String) -> FF,
        FF: Future<Output = Result<T>>,
    {
        match self.route() {
            Route::Fallback { reason } => {
                let value = fallback(reason.clone()).await?;
                Ok(BreakerResult {
                    value,
                    from_fallback: true,
                    fallback_reason: Some(reason),
                })
            }
            Route::Primary { probe } => match primary().await {
                Ok(value) => {
                    self.record_success(probe);
                    Ok(BreakerResult {
                        value,
                        from_fallback: false,
                        fallback_reason: None,
                    })
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.record_failure(probe, &reason);
                    let value = fallback(reason.clone()).await?;
                    Ok(BreakerResult {
                        value,
                        from_fallback: true,
                        fallback_reason: Some(reason),
                    })
                }
            },
        }
    }

    fn route(&self) -> Route {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Route::Primary { probe: false },
            BreakerState::HalfOpen => Route::Primary { probe: true },
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    debug!("Circuit breaker half-open, probing primary path");
                    Route::Primary { probe: true }
                } else {
                    Route::Fallback {
                        reason: inner
                            .open_reason
                            .clone()
                            .unwrap_or_else(|| "circuit open".to_string()),
                    }
                }
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        if probe && inner.state == BreakerState::HalfOpen {
            info!("Circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.open_reason = None;
    }

    fn record_failure(&self, probe: bool, reason: &str) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        if probe {
            inner.state = BreakerState::Open;
            inner.open_reason = Some(reason.to_string());
            warn!(reason, "Circuit breaker re-opened after failed probe");
            return;
        }
        inner.failures += 1;
        if inner.failures >= self.fail_max && inner.state == BreakerState::Closed {
            inner.state = BreakerState::Open;
            inner.open_reason = Some(reason.to_string());
            warn!(
                failures = inner.failures,
                reason, "Circuit breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForemanError;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
        })
    }

    async fn fail_once(b: &CircuitBreaker) -> BreakerResult<&'static str> {
        b.run(
            || async { Err::<&'static str, _>(ForemanError::Store("boom".into())) },
            |_| async { Ok("fallback") },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_closed_passes_primary_through() {
        let b = breaker(5, 30_000);
        let result = b
            .run(|| async { Ok("primary") }, |_| async { Ok("fallback") })
            .await
            .unwrap();
        assert_eq!(result.value, "primary");
        assert!(!result.from_fallback);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let b = breaker(3, 30_000);
        for _ in 0..2 {
            let result = fail_once(&b).await;
            assert!(result.from_fallback);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        fail_once(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        // Open circuit skips the primary entirely.
        let result = b
            .run(
                || async { panic!("primary must not run while open") },
                |reason| async move {
                    assert!(reason.contains("boom"));
                    Ok("fallback")
                },
            )
            .await
            .unwrap();
        assert!(result.from_fallback);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker(3, 30_000);
        fail_once(&b).await;
        fail_once(&b).await;
        b.run(|| async { Ok(()) }, |_| async { Ok(()) })
            .await
            .unwrap();
        fail_once(&b).await;
        fail_once(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let b = breaker(1, 0);
        fail_once(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        // Zero reset timeout: next call probes immediately.
        let result = b
            .run(|| async { Ok("recovered") }, |_| async { Ok("fallback") })
            .await
            .unwrap();
        assert!(!result.from_fallback);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_reopens_on_failure() {
        let b = breaker(1, 0);
        fail_once(&b).await;
        fail_once(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_force_open_is_idempotent() {
        let b = breaker(5, 30_000);
        b.force_open("NOAUTH Authentication required.");
        b.force_open("NOAUTH Authentication required.");
        assert_eq!(b.state(), BreakerState::Open);

        let result = b
            .run(
                || async { panic!("primary must not run after force_open") },
                |_| async { Ok(()) },
            )
            .await
            .unwrap();
        assert!(result.from_fallback);
    }
}
