//! Circuit breaker - fail fast after a run of errors, probe for recovery.
//!
//! One implementation guards every unreliable call in the runtime: outbound
//! asks and state saves alike. State transitions:
//!
//! ```text
//! closed ──(failure_threshold consecutive failures)──► open
//! open ──(reset_timeout elapsed)──► half-open
//! half-open ──(any failure)──► open
//! half-open ──(half_open_requests successes)──► closed
//! ```
//!
//! While open, every call fails with `CIRCUIT_OPEN` without invoking the
//! underlying operation.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::FabricError;

/// Tunables for a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` before tripping.
    pub failure_threshold: u32,
    /// How long `open` lasts before the first probe.
    pub reset_timeout: Duration,
    /// Successful probes required to close again.
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 3,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_attempts: u32,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_attempts: u32,
    last_failure: Option<Instant>,
    next_attempt: Option<Instant>,
}

/// An adaptive guard around an unreliable async operation.
///
/// The lock protects only the transition bookkeeping; it is never held across
/// the guarded operation itself.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

enum Admission {
    Allowed,
    Rejected,
}

impl CircuitBreaker {
    /// Create a breaker with the default thresholds.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, BreakerConfig::default())
    }

    /// Create a breaker with explicit thresholds.
    pub fn with_config(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_attempts: 0,
                last_failure: None,
                next_attempt: None,
            }),
        }
    }

    /// The breaker's name (used in `CIRCUIT_OPEN` error context).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the operation under the breaker.
    ///
    /// Returns `CIRCUIT_OPEN` without calling the operation when tripped.
    pub async fn execute<T, Fut>(&self, op: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match self.admit() {
            Admission::Rejected => Err(FabricError::circuit_open(&self.name).into()),
            Admission::Allowed => match op.await {
                Ok(value) => {
                    self.record_success();
                    Ok(value)
                }
                Err(e) => {
                    self.record_failure();
                    Err(e)
                }
            },
        }
    }

    /// Current counters and state.
    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Self::maybe_enter_half_open(&mut inner);
        BreakerStatus {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_attempts: inner.half_open_attempts,
        }
    }

    fn maybe_enter_half_open(inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            if let Some(next) = inner.next_attempt {
                if Instant::now() >= next {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_attempts = 0;
                    inner.success_count = 0;
                }
            }
        }
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Self::maybe_enter_half_open(&mut inner);
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => Admission::Rejected,
            BreakerState::HalfOpen => {
                if inner.half_open_attempts < self.config.half_open_requests {
                    inner.half_open_attempts += 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = 0;
                inner.success_count = inner.success_count.saturating_add(1);
            }
            BreakerState::HalfOpen => {
                inner.success_count = inner.success_count.saturating_add(1);
                if inner.success_count >= self.config.half_open_requests {
                    tracing::info!(breaker = %self.name, "circuit closed after recovery");
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_attempts = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened");
                inner.state = BreakerState::Open;
                inner.next_attempt = Some(Instant::now() + self.config.reset_timeout);
                inner.success_count = 0;
            }
            BreakerState::Open => {}
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &status.state)
            .field("failure_count", &status.failure_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn small_breaker() -> CircuitBreaker {
        CircuitBreaker::with_config(
            "test",
            BreakerConfig {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(60),
                half_open_requests: 3,
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> anyhow::Result<()> {
        breaker
            .execute(async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> anyhow::Result<()> {
        breaker.execute(async { Ok(()) }).await
    }

    fn code_of(err: &anyhow::Error) -> Option<ErrorCode> {
        err.downcast_ref::<FabricError>().map(|e| e.code)
    }

    #[tokio::test]
    async fn test_opens_after_exactly_threshold_failures() {
        let breaker = small_breaker();

        for _ in 0..4 {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.status().state, BreakerState::Closed);
        }
        let _ = fail(&breaker).await;
        assert_eq!(breaker.status().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking_operation() {
        let breaker = small_breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = breaker
            .execute(async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(code_of(&result.unwrap_err()), Some(ErrorCode::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout_then_closes() {
        let breaker = small_breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.status().state, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.status().state, BreakerState::HalfOpen);

        for _ in 0..3 {
            succeed(&breaker).await.unwrap();
        }
        assert_eq!(breaker.status().state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = small_breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.status().state, BreakerState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.status().state, BreakerState::Open);

        // Rejected again until the next reset window.
        let result = succeed(&breaker).await;
        assert_eq!(code_of(&result.unwrap_err()), Some(ErrorCode::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_caps_probe_count() {
        let breaker = small_breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        // Two successful probes, not yet closed.
        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.status().state, BreakerState::HalfOpen);

        // Third probe closes it.
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.status().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let breaker = small_breaker();
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.status().failure_count, 0);

        // Four more failures still below threshold.
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.status().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_underlying_error_passes_through_when_closed() {
        let breaker = small_breaker();
        let err = fail(&breaker).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
