//! Event bus - ask, tell, publish.
//!
//! Carries [`Envelope`]s between actors over a pluggable [`Transport`] under
//! three delivery patterns:
//!
//! - **ask** - request/reply. Subscribe to `event:response:<cid>` before
//!   publishing (no race), await the reply with a timeout, evict the pending
//!   entry on timeout. Retries with exponential backoff are configurable.
//! - **tell** - fire-and-forget. Under at-least-once delivery a
//!   `pending:<envelopeId>` entry is written first and deleted on ack; a
//!   sweeper republishes entries still unacked after the TTL.
//! - **publish** - broadcast to every subscriber of `broadcast:<eventType>`.
//!
//! # Guarantees
//!
//! - FIFO per (target, eventType) channel within one publisher session.
//! - No cross-channel or cross-actor ordering.
//! - At-least-once tell may redeliver; the bus consults its [`Deduplicator`]
//!   before invoking local handlers, and redelivered envelopes carry
//!   `metadata.redelivered`.
//! - Closing the bus fails pending asks with `SHUTTING_DOWN`, clears handler
//!   maps, and releases the transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::dedup::Deduplicator;
use crate::envelope::{CorrelationId, Envelope};
use crate::error::{ErrorCode, FabricError};
use crate::retry::RetryPolicy;
use crate::transport::{channels, keys, Transport};

/// Default ask deadline.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Config
// =============================================================================

/// Delivery guarantee for tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryGuarantee {
    /// Best effort: a crashed target loses the envelope.
    #[default]
    AtMostOnce,
    /// Pending entries + ack + redelivery. Consumers must tolerate duplicates.
    AtLeastOnce,
}

/// Bus tunables.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub delivery: DeliveryGuarantee,
    pub default_ask_timeout: Duration,
    /// Backoff schedule for ask attempts. `RetryPolicy::none()` disables.
    pub ask_retry: RetryPolicy,
    /// How long a tell entry may sit unacked before redelivery.
    pub pending_ttl: Duration,
    /// How often the sweeper scans for unacked entries.
    pub sweep_interval: Duration,
    /// Redeliveries per envelope before the entry is dropped.
    pub max_redeliveries: u32,
    /// Persist published notifications under `event:<id>` keys.
    pub persist_events: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryGuarantee::AtMostOnce,
            default_ask_timeout: DEFAULT_ASK_TIMEOUT,
            ask_retry: RetryPolicy::none(),
            pending_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            max_redeliveries: 5,
            persist_events: false,
        }
    }
}

impl BusConfig {
    /// Set the pending TTL from its `<number>_<unit>` string form
    /// (`"90_seconds"`, `"5_minutes"`), as carried in deployment config.
    pub fn with_pending_ttl_str(mut self, ttl: &str) -> anyhow::Result<Self> {
        self.pending_ttl = crate::transport::parse_ttl(ttl)?;
        Ok(self)
    }
}

// =============================================================================
// Internals
// =============================================================================

/// A registered envelope handler.
///
/// Returning `Ok(Some(reply))` sends the reply on the caller's response
/// channel when the inbound envelope was an ask.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<Envelope>>> + Send>>;
pub type EventHandler = Arc<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Envelope>>> + Send + 'static,
{
    Arc::new(move |env| Box::pin(f(env)))
}

/// The durable record behind an unacked at-least-once tell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingDelivery {
    envelope: Envelope,
    target: String,
    stored_at: DateTime<Utc>,
    attempts: u32,
}

struct HandlerGroup {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    pump: JoinHandle<()>,
}

struct BusInner {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    /// Outstanding asks by correlation id (target kept for diagnostics).
    pending_asks: DashMap<CorrelationId, String>,
    /// One pump per subscribed channel, fanning out to local handlers.
    groups: DashMap<String, HandlerGroup>,
    dedup: Deduplicator,
    closed: AtomicBool,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Serializes handler registration so one channel gets one pump.
    registration: tokio::sync::Mutex<()>,
}

/// The bus handle. Cheap to clone; all clones share one transport.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with default config.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, BusConfig::default())
    }

    /// Create a bus with explicit config. At-least-once delivery starts the
    /// redelivery sweeper.
    pub fn with_config(transport: Arc<dyn Transport>, config: BusConfig) -> Self {
        let bus = Self {
            inner: Arc::new(BusInner {
                transport,
                config,
                pending_asks: DashMap::new(),
                groups: DashMap::new(),
                dedup: Deduplicator::new(),
                closed: AtomicBool::new(false),
                sweeper: std::sync::Mutex::new(None),
                registration: tokio::sync::Mutex::new(()),
            }),
        };
        if bus.inner.config.delivery == DeliveryGuarantee::AtLeastOnce {
            let handle = tokio::spawn(Self::sweep_loop(bus.inner.clone()));
            *bus.inner.sweeper.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        }
        bus
    }

    fn ensure_open(&self) -> Result<(), FabricError> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(FabricError::new(ErrorCode::ShuttingDown, "Bus is shutting down"))
        } else {
            Ok(())
        }
    }

    fn encode(envelope: &Envelope) -> Result<Bytes, FabricError> {
        serde_json::to_vec(envelope)
            .map(Bytes::from)
            .map_err(|e| {
                FabricError::new(ErrorCode::UnknownError, "Envelope serialization failed")
                    .with_field("detail", serde_json::json!(e.to_string()))
            })
    }

    fn decode(bytes: &Bytes) -> Option<Envelope> {
        match serde_json::from_slice(bytes) {
            Ok(env) => Some(env),
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable envelope");
                None
            }
        }
    }

    // =========================================================================
    // Ask
    // =========================================================================

    /// Request/reply. Publishes to the target's inbound channel and awaits a
    /// correlated reply, retrying per the configured policy.
    ///
    /// `timeout` of `None` uses the bus default.
    pub async fn ask(
        &self,
        target: &str,
        mut envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope, FabricError> {
        self.ensure_open()?;
        let deadline = timeout.unwrap_or(self.inner.config.default_ask_timeout);

        let cid = match envelope.correlation_id {
            Some(cid) if cid.is_some() => cid,
            _ => {
                let cid = CorrelationId::new();
                envelope.correlation_id = Some(cid);
                cid
            }
        };
        envelope.actor = Some(target.to_string());

        // Subscribe before publishing so a fast reply cannot slip past us.
        let mut replies = self
            .inner
            .transport
            .subscribe(&channels::response(cid))
            .await
            .map_err(|e| {
                FabricError::new(ErrorCode::UnknownError, "Transport subscribe failed")
                    .with_field("detail", serde_json::json!(e.to_string()))
            })?;

        self.inner.pending_asks.insert(cid, target.to_string());
        let result = self
            .ask_attempts(target, &envelope, deadline, &mut replies)
            .await;
        self.inner.pending_asks.remove(&cid);
        result
    }

    async fn ask_attempts(
        &self,
        target: &str,
        envelope: &Envelope,
        deadline: Duration,
        replies: &mut crate::transport::Subscription,
    ) -> Result<Envelope, FabricError> {
        let bytes = Self::encode(envelope)?;
        let channel = channels::direct(target, &envelope.event_type);
        let retry = &self.inner.config.ask_retry;

        for attempt in 0..=retry.max_retries {
            let delay = retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.inner.transport.publish(&channel, bytes.clone()).await {
                tracing::warn!(to = target, error = %e, "ask publish failed");
                continue;
            }
            match tokio::time::timeout(deadline, replies.next()).await {
                Ok(Some(reply_bytes)) => {
                    if let Some(reply) = Self::decode(&reply_bytes) {
                        return Ok(reply);
                    }
                }
                Ok(None) => {
                    return Err(FabricError::new(
                        ErrorCode::ShuttingDown,
                        "Bus is shutting down",
                    ));
                }
                Err(_) => {
                    tracing::debug!(to = target, attempt, "ask attempt timed out");
                }
            }
        }

        Err(FabricError::request_timeout(target, deadline.as_millis() as u64))
    }

    /// Outstanding ask count (drops to zero as calls resolve or time out).
    pub fn pending_ask_count(&self) -> usize {
        self.inner.pending_asks.len()
    }

    // =========================================================================
    // Tell
    // =========================================================================

    /// Fire-and-forget to one target.
    ///
    /// Under at-least-once delivery the pending entry is written before the
    /// publish, so a crash between the two redelivers rather than loses.
    pub async fn tell(&self, target: &str, mut envelope: Envelope) -> Result<(), FabricError> {
        self.ensure_open()?;
        envelope.actor = Some(target.to_string());

        if self.inner.config.delivery == DeliveryGuarantee::AtLeastOnce {
            let entry = PendingDelivery {
                envelope: envelope.clone(),
                target: target.to_string(),
                stored_at: Utc::now(),
                attempts: 0,
            };
            let entry_bytes = serde_json::to_vec(&entry)
                .map(Bytes::from)
                .map_err(|e| {
                    FabricError::new(ErrorCode::UnknownError, "Pending entry encode failed")
                        .with_field("detail", serde_json::json!(e.to_string()))
                })?;
            self.inner
                .transport
                .kv_put(&keys::pending(envelope.id), entry_bytes)
                .await
                .map_err(|e| {
                    FabricError::new(ErrorCode::UnknownError, "Pending entry store failed")
                        .with_field("detail", serde_json::json!(e.to_string()))
                })?;
        }

        let channel = channels::direct(target, &envelope.event_type);
        let bytes = Self::encode(&envelope)?;
        self.inner
            .transport
            .publish(&channel, bytes)
            .await
            .map_err(|e| {
                FabricError::new(ErrorCode::UnknownError, "Publish failed")
                    .with_field("detail", serde_json::json!(e.to_string()))
            })
    }

    /// Acknowledge an at-least-once delivery, stopping redelivery.
    pub async fn ack(&self, envelope_id: uuid::Uuid) {
        if let Err(e) = self
            .inner
            .transport
            .kv_delete(&keys::pending(envelope_id))
            .await
        {
            tracing::warn!(envelope_id = %envelope_id, error = %e, "ack failed");
        }
    }

    async fn sweep_loop(inner: Arc<BusInner>) {
        let mut ticker = tokio::time::interval(inner.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if inner.closed.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = Self::sweep_once(&inner).await {
                tracing::warn!(error = %e, "redelivery sweep failed");
            }
        }
    }

    async fn sweep_once(inner: &Arc<BusInner>) -> anyhow::Result<()> {
        let ttl = chrono::Duration::from_std(inner.config.pending_ttl)?;
        let now = Utc::now();
        for key in inner.transport.kv_list(keys::PENDING_PREFIX).await? {
            let Some(bytes) = inner.transport.kv_get(&key).await? else {
                continue;
            };
            let Ok(mut entry) = serde_json::from_slice::<PendingDelivery>(&bytes) else {
                tracing::warn!(key = %key, "dropping undecodable pending entry");
                inner.transport.kv_delete(&key).await?;
                continue;
            };
            if now - entry.stored_at < ttl {
                continue;
            }
            if entry.attempts >= inner.config.max_redeliveries {
                tracing::warn!(
                    key = %key,
                    attempts = entry.attempts,
                    "dropping envelope after redelivery budget"
                );
                inner.transport.kv_delete(&key).await?;
                continue;
            }
            entry.attempts += 1;
            entry.stored_at = now;
            entry.envelope.metadata.redelivered = true;
            tracing::info!(
                envelope_id = %entry.envelope.id,
                to = %entry.target,
                attempt = entry.attempts,
                "redelivering unacked envelope"
            );
            inner
                .transport
                .kv_put(&key, Bytes::from(serde_json::to_vec(&entry)?))
                .await?;
            let channel = channels::direct(&entry.target, &entry.envelope.event_type);
            inner
                .transport
                .publish(&channel, Bytes::from(serde_json::to_vec(&entry.envelope)?))
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Broadcast to every subscriber of the envelope's event type.
    pub async fn publish(&self, envelope: Envelope) -> Result<(), FabricError> {
        self.ensure_open()?;
        let bytes = Self::encode(&envelope)?;
        if self.inner.config.persist_events {
            if let Err(e) = self
                .inner
                .transport
                .kv_put(&keys::event(envelope.id), bytes.clone())
                .await
            {
                tracing::warn!(error = %e, "event persistence failed");
            }
        }
        self.inner
            .transport
            .publish(&channels::broadcast(&envelope.event_type), bytes)
            .await
            .map_err(|e| {
                FabricError::new(ErrorCode::UnknownError, "Broadcast failed")
                    .with_field("detail", serde_json::json!(e.to_string()))
            })
    }

    // =========================================================================
    // Handler registration
    // =========================================================================

    /// Register a handler for envelopes sent directly to `target`.
    ///
    /// One transport subscription per channel is multiplexed to every local
    /// handler; handlers run serially per channel, preserving FIFO.
    pub async fn on<F, Fut>(
        &self,
        target: &str,
        event_type: &str,
        f: F,
    ) -> Result<(), FabricError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Envelope>>> + Send + 'static,
    {
        self.register(channels::direct(target, event_type), handler(f), true)
            .await
    }

    /// Register a handler for broadcast envelopes of `event_type`.
    pub async fn subscribe<F, Fut>(&self, event_type: &str, f: F) -> Result<(), FabricError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Envelope>>> + Send + 'static,
    {
        self.register(channels::broadcast(event_type), handler(f), false)
            .await
    }

    async fn register(
        &self,
        channel: String,
        handler: EventHandler,
        direct: bool,
    ) -> Result<(), FabricError> {
        self.ensure_open()?;
        let _guard = self.inner.registration.lock().await;

        if let Some(group) = self.inner.groups.get(&channel) {
            group.handlers.write().await.push(handler);
            return Ok(());
        }

        let handlers = Arc::new(RwLock::new(vec![handler]));
        let mut sub = self
            .inner
            .transport
            .subscribe(&channel)
            .await
            .map_err(|e| {
                FabricError::new(ErrorCode::UnknownError, "Transport subscribe failed")
                    .with_field("detail", serde_json::json!(e.to_string()))
            })?;

        let inner = self.inner.clone();
        let pump_handlers = handlers.clone();
        let pump_channel = channel.clone();
        let pump = tokio::spawn(async move {
            while let Some(bytes) = sub.next().await {
                let Some(envelope) = EventBus::decode(&bytes) else {
                    continue;
                };
                let at_least_once =
                    direct && inner.config.delivery == DeliveryGuarantee::AtLeastOnce;
                if at_least_once && inner.dedup.is_duplicate(envelope.id) {
                    tracing::debug!(envelope_id = %envelope.id, "duplicate suppressed");
                    let _ = inner.transport.kv_delete(&keys::pending(envelope.id)).await;
                    continue;
                }
                let cid = envelope.correlation();
                let current = pump_handlers.read().await.clone();
                for h in current {
                    match h(envelope.clone()).await {
                        Ok(Some(mut reply)) if direct && cid.is_some() => {
                            reply.correlation_id = Some(cid);
                            match serde_json::to_vec(&reply) {
                                Ok(body) => {
                                    if let Err(e) = inner
                                        .transport
                                        .publish(&channels::response(cid), Bytes::from(body))
                                        .await
                                    {
                                        tracing::warn!(%cid, error = %e, "reply publish failed");
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!(%cid, error = %e, "reply encode failed");
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(
                                channel = %pump_channel,
                                envelope_id = %envelope.id,
                                error = %e,
                                "handler failed"
                            );
                        }
                    }
                }
                if at_least_once {
                    let _ = inner.transport.kv_delete(&keys::pending(envelope.id)).await;
                }
            }
        });

        self.inner
            .groups
            .insert(channel, HandlerGroup { handlers, pump });
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Close the bus: pending asks fail with `SHUTTING_DOWN`, handler maps
    /// clear, the transport releases its resources.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            sweeper.abort();
        }
        if let Err(e) = self.inner.transport.close().await {
            tracing::warn!(error = %e, "transport close failed");
        }
        for entry in self.inner.groups.iter() {
            entry.pump.abort();
        }
        self.inner.groups.clear();
        self.inner.pending_asks.clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("pending_asks", &self.inner.pending_asks.len())
            .field("channels", &self.inner.groups.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(InMemoryTransport::new()))
    }

    fn bus_with(config: BusConfig) -> (EventBus, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        (EventBus::with_config(transport.clone(), config), transport)
    }

    #[tokio::test]
    async fn test_ask_round_trip() {
        let bus = bus();
        bus.on("calculator", "GET_DOUBLE", |env: Envelope| async move {
            let n = env.payload["n"].as_i64().unwrap_or(0);
            Ok(Some(env.derive("DOUBLE_RESULT", json!({ "n": n * 2 }))))
        })
        .await
        .unwrap();

        let reply = bus
            .ask(
                "calculator",
                Envelope::new("GET_DOUBLE", json!({"n": 21})),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(reply.event_type, "DOUBLE_RESULT");
        assert_eq!(reply.payload["n"], 42);
        assert_eq!(bus.pending_ask_count(), 0);
    }

    #[tokio::test]
    async fn test_ask_timeout_evicts_pending() {
        let bus = bus();
        // No handler registered; nothing will reply.
        let err = bus
            .ask(
                "silent",
                Envelope::new("GET_X", json!({})),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::RequestTimeout);
        assert_eq!(err.context["target"], "silent");
        assert_eq!(bus.pending_ask_count(), 0);
    }

    #[tokio::test]
    async fn test_ask_reply_carries_correlation() {
        let bus = bus();
        bus.on("echo", "GET_ECHO", |env: Envelope| async move {
            Ok(Some(Envelope::new("ECHO_RESULT", env.payload.clone())))
        })
        .await
        .unwrap();

        let cid = CorrelationId::new();
        let reply = bus
            .ask(
                "echo",
                Envelope::new("GET_ECHO", json!({"v": 1})).with_correlation(cid),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(reply.correlation_id, Some(cid));
    }

    #[tokio::test]
    async fn test_ask_retries_until_reply() {
        let (bus, _transport) = bus_with(BusConfig {
            ask_retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                backoff_multiplier: 2.0,
            },
            ..BusConfig::default()
        });

        // Handler that ignores the first two deliveries.
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        bus.on("flaky", "GET_X", move |env: Envelope| {
            let seen = seen2.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(None)
                } else {
                    Ok(Some(env.derive("X_RESULT", json!({"ok": true}))))
                }
            }
        })
        .await
        .unwrap();

        let reply = bus
            .ask(
                "flaky",
                Envelope::new("GET_X", json!({})),
                Some(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert_eq!(reply.event_type, "X_RESULT");
        assert!(seen.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_tell_delivers() {
        let bus = bus();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Envelope>(8);
        bus.on("notification", "MAGIC_LINK_SENT", move |env: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(env).await.ok();
                Ok(None)
            }
        })
        .await
        .unwrap();

        bus.tell("notification", Envelope::new("MAGIC_LINK_SENT", json!({"email": "u@x"})))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "MAGIC_LINK_SENT");
        assert_eq!(received.actor.as_deref(), Some("notification"));
    }

    #[tokio::test]
    async fn test_at_least_once_records_and_acks_pending() {
        let (bus, transport) = bus_with(BusConfig {
            delivery: DeliveryGuarantee::AtLeastOnce,
            sweep_interval: Duration::from_secs(3600),
            ..BusConfig::default()
        });

        // No handler: the pending entry must remain.
        let env = Envelope::new("DO_THING", json!({}));
        let id = env.id;
        bus.tell("worker", env).await.unwrap();
        assert!(transport.kv_get(&keys::pending(id)).await.unwrap().is_some());

        bus.ack(id).await;
        assert!(transport.kv_get(&keys::pending(id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_at_least_once_handler_acks_automatically() {
        let (bus, transport) = bus_with(BusConfig {
            delivery: DeliveryGuarantee::AtLeastOnce,
            sweep_interval: Duration::from_secs(3600),
            ..BusConfig::default()
        });

        let (tx, mut rx) = tokio::sync::mpsc::channel::<uuid::Uuid>(8);
        bus.on("worker", "DO_THING", move |env: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(env.id).await.ok();
                Ok(None)
            }
        })
        .await
        .unwrap();

        let env = Envelope::new("DO_THING", json!({}));
        let id = env.id;
        bus.tell("worker", env).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), id);
        // Give the pump a beat to delete the entry after the handler ran.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(transport.kv_get(&keys::pending(id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redelivery_after_ttl() {
        let (bus, transport) = bus_with(BusConfig {
            delivery: DeliveryGuarantee::AtLeastOnce,
            pending_ttl: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(25),
            max_redeliveries: 5,
            ..BusConfig::default()
        });

        // Publish before any handler exists: the original delivery is lost,
        // redelivery must recover it.
        let env = Envelope::new("DO_THING", json!({"k": 1}));
        let id = env.id;
        bus.tell("worker", env).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Envelope>(8);
        bus.on("worker", "DO_THING", move |env: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(env).await.ok();
                Ok(None)
            }
        })
        .await
        .unwrap();

        let redelivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("redelivery within 2s")
            .unwrap();
        assert_eq!(redelivered.id, id);
        assert!(redelivered.metadata.redelivered);

        // After the handler ran the entry is acked and stays gone.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.kv_get(&keys::pending(id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_suppression() {
        let (bus, _transport) = bus_with(BusConfig {
            delivery: DeliveryGuarantee::AtLeastOnce,
            sweep_interval: Duration::from_secs(3600),
            ..BusConfig::default()
        });

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.on("worker", "DO_THING", move |_env: Envelope| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .await
        .unwrap();

        let env = Envelope::new("DO_THING", json!({}));
        bus.tell("worker", env.clone()).await.unwrap();
        // Same envelope id again: a duplicate.
        bus.tell("worker", env).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe("MAGIC_LINK_SENT", move |_env: Envelope| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .await
            .unwrap();
        }

        bus.publish(Envelope::new("MAGIC_LINK_SENT", json!({})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_publish_does_not_reach_direct_handlers() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.on("analytics", "MAGIC_LINK_SENT", move |_env: Envelope| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .await
        .unwrap();

        bus.publish(Envelope::new("MAGIC_LINK_SENT", json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fifo_per_channel() {
        let bus = bus();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<i64>(64);
        bus.on("seq", "STEP", move |env: Envelope| {
            let tx = tx.clone();
            async move {
                tx.send(env.payload["i"].as_i64().unwrap()).await.ok();
                Ok(None)
            }
        })
        .await
        .unwrap();

        for i in 0..20 {
            bus.tell("seq", Envelope::new("STEP", json!({"i": i}))).await.unwrap();
        }
        for i in 0..20 {
            assert_eq!(rx.recv().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn test_multiple_handlers_one_channel() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let count = count.clone();
            bus.on("multi", "PING", move |_env: Envelope| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .await
            .unwrap();
        }
        bus.tell("multi", Envelope::new("PING", json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let bus = bus();
        bus.close().await;
        let err = bus
            .ask("x", Envelope::new("GET_X", json!({})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ShuttingDown);
        assert!(bus.tell("x", Envelope::new("Y", json!({}))).await.is_err());
    }

    #[tokio::test]
    async fn test_close_terminates_pending_ask() {
        let bus = bus();
        let asker = bus.clone();
        let task = tokio::spawn(async move {
            asker
                .ask(
                    "silent",
                    Envelope::new("GET_X", json!({})),
                    Some(Duration::from_secs(30)),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(bus.pending_ask_count(), 1);
        bus.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("ask resolves on close")
            .unwrap();
        assert_eq!(result.unwrap_err().code, ErrorCode::ShuttingDown);
    }

    #[test]
    fn test_config_pending_ttl_from_string() {
        let config = BusConfig::default().with_pending_ttl_str("5_minutes").unwrap();
        assert_eq!(config.pending_ttl, Duration::from_secs(300));
        assert!(BusConfig::default().with_pending_ttl_str("soon").is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = bus();
        bus.close().await;
        bus.close().await;
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_pump() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.on("grumpy", "POKE", move |_env: Envelope| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always fails")
            }
        })
        .await
        .unwrap();

        bus.tell("grumpy", Envelope::new("POKE", json!({}))).await.unwrap();
        bus.tell("grumpy", Envelope::new("POKE", json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
