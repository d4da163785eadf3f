//! Rate limiters: token bucket and keyed window.
//!
//! Two shapes, used at different altitudes:
//!
//! - [`TokenBucket`] - a single bucket with capacity and steady refill.
//!   `acquire(n)` waits until `n` tokens exist; bursts up to capacity are
//!   admitted immediately; sustained throughput equals the refill rate.
//! - [`WindowLimiter`] - per-key fixed windows (`windowMs`, `maxRequests`).
//!   `allow(key)` answers immediately. Actors key it with a payload-derived
//!   identifier (email, user id) to throttle callers instead of the world.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

// =============================================================================
// Token Bucket
// =============================================================================

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with capacity `max_tokens`, refilling `refill_rate` tokens
/// every `refill_interval`.
pub struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    refill_interval: Duration,
    inner: Mutex<BucketInner>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(max_tokens: u32, refill_rate: u32, refill_interval: Duration) -> Self {
        Self {
            max_tokens: f64::from(max_tokens),
            refill_rate: f64::from(refill_rate),
            refill_interval,
            inner: Mutex::new(BucketInner {
                tokens: f64::from(max_tokens),
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, inner: &mut BucketInner) {
        let elapsed = inner.last_refill.elapsed();
        if elapsed.is_zero() {
            return;
        }
        let intervals = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
        inner.tokens = (inner.tokens + intervals * self.refill_rate).min(self.max_tokens);
        inner.last_refill = Instant::now();
    }

    /// Take `n` tokens, waiting for refill if the bucket is short.
    ///
    /// The lock is released while sleeping so concurrent acquirers interleave.
    pub async fn acquire(&self, n: u32) {
        let needed = f64::from(n).min(self.max_tokens);
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                self.refill(&mut inner);
                if inner.tokens >= needed {
                    inner.tokens -= needed;
                    return;
                }
                let deficit = needed - inner.tokens;
                let seconds =
                    deficit / self.refill_rate * self.refill_interval.as_secs_f64();
                Duration::from_secs_f64(seconds.max(0.001))
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take `n` tokens if immediately available.
    pub async fn try_acquire(&self, n: u32) -> bool {
        let needed = f64::from(n);
        let mut inner = self.inner.lock().await;
        self.refill(&mut inner);
        if inner.tokens >= needed {
            inner.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Refill, then report the current token count.
    pub async fn available_tokens(&self) -> f64 {
        let mut inner = self.inner.lock().await;
        self.refill(&mut inner);
        inner.tokens
    }
}

// =============================================================================
// Keyed Window Limiter
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Configuration for a [`WindowLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub window: Duration,
    pub max_requests: u32,
}

/// Per-key fixed-window limiter.
///
/// Within any window, at most `max_requests` calls per key are admitted.
/// Counts are tracked per key; idle keys are pruned opportunistically.
pub struct WindowLimiter {
    config: WindowConfig,
    windows: DashMap<String, Window>,
}

impl WindowLimiter {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Admit or deny one call for `key`, atomically bumping the window count.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });
        if now.duration_since(entry.started) >= self.config.window {
            entry.count = 0;
            entry.started = now;
        }
        if entry.count < self.config.max_requests {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Remaining budget for `key` in the current window.
    pub fn remaining(&self, key: &str) -> u32 {
        match self.windows.get(key) {
            Some(w) if w.started.elapsed() < self.config.window => {
                self.config.max_requests.saturating_sub(w.count)
            }
            _ => self.config.max_requests,
        }
    }

    /// Drop windows that expired, bounding memory for high-cardinality keys.
    pub fn prune(&self) {
        let window = self.config.window;
        self.windows.retain(|_, w| w.started.elapsed() < window);
    }

    /// Number of live keys (for monitoring).
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
