//! Security events - capture, buffer, detect, export.
//!
//! Security-flavored failures (keyword-matched in the error transformer) land
//! here as `command_security_error` events. The buffer is bounded (FIFO
//! eviction at 10 000) so a flood cannot exhaust memory. A simple anomaly
//! detector escalates repeated failures from the same principal.
//!
//! Details stay sanitized: the buffer stores categories and identifiers, not
//! raw error strings with credentials in them.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default buffer bound.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// How severe an incident is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One recorded incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_name: Option<String>,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// Build an event stamped now.
    pub fn new(event_type: impl Into<String>, severity: Severity, details: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            severity,
            user_id: None,
            actor_id: None,
            actor_name: None,
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_actor(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.actor_name = Some(name.into());
        self.actor_id = Some(id.into());
        self
    }
}

/// Anomaly detection thresholds.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Failures from one principal within `window` that trigger escalation.
    pub failure_threshold: u32,
    pub window: Duration,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(300),
        }
    }
}

struct MonitorInner {
    buffer: VecDeque<SecurityEvent>,
    // (principal, count, window start) for repeated-failure detection
    failures: Vec<(String, u32, Instant)>,
}

/// Bounded security-event buffer with repeated-failure detection.
pub struct SecurityMonitor {
    capacity: usize,
    anomaly: AnomalyConfig,
    inner: Mutex<MonitorInner>,
}

impl SecurityMonitor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY, AnomalyConfig::default())
    }

    pub fn with_capacity(capacity: usize, anomaly: AnomalyConfig) -> Self {
        Self {
            capacity: capacity.max(1),
            anomaly,
            inner: Mutex::new(MonitorInner {
                buffer: VecDeque::new(),
                failures: Vec::new(),
            }),
        }
    }

    /// Record an event, evicting the oldest when full.
    ///
    /// Repeated failures from the same principal inside the anomaly window
    /// additionally record a critical `repeated_security_failures` event.
    pub fn record(&self, event: SecurityEvent) {
        let principal = event
            .user_id
            .clone()
            .or_else(|| event.actor_id.clone())
            .unwrap_or_else(|| "anonymous".to_string());

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        push_bounded(&mut inner.buffer, event, self.capacity);

        let now = Instant::now();
        let window = self.anomaly.window;
        inner
            .failures
            .retain(|(_, _, started)| now.duration_since(*started) < window);

        let count = match inner
            .failures
            .iter_mut()
            .find(|(p, _, _)| *p == principal)
        {
            Some(entry) => {
                entry.1 += 1;
                entry.1
            }
            None => {
                inner.failures.push((principal.clone(), 1, now));
                1
            }
        };

        if count == self.anomaly.failure_threshold {
            tracing::warn!(principal = %principal, count, "repeated security failures");
            let escalation = SecurityEvent::new(
                "repeated_security_failures",
                Severity::Critical,
                serde_json::json!({ "principal": principal, "count": count }),
            );
            push_bounded(&mut inner.buffer, escalation, self.capacity);
        }
    }

    /// Snapshot of the buffered events, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .buffer
            .iter()
            .cloned()
            .collect()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the buffer, returning everything recorded so far.
    pub fn drain(&self) -> Vec<SecurityEvent> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .buffer
            .drain(..)
            .collect()
    }
}

fn push_bounded(buffer: &mut VecDeque<SecurityEvent>, event: SecurityEvent, capacity: usize) {
    if buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(event);
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Webhook Export
// =============================================================================

/// Destination for shutdown export of buffered events.
#[derive(Debug, Clone)]
pub struct SecurityWebhook {
    pub url: String,
    pub token: Option<String>,
}

impl SecurityWebhook {
    /// POST the events as JSON. Failures are logged, never propagated - the
    /// export is best-effort and runs during shutdown.
    pub async fn export(&self, events: &[SecurityEvent]) {
        if events.is_empty() {
            return;
        }
        let client = reqwest::Client::new();
        let mut request = client.post(&self.url).json(&events);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(count = events.len(), "security events exported");
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "security export rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "security export failed");
            }
        }
    }
}
