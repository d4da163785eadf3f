//! Transport - the wire under the bus.
//!
//! The bus is transport-agnostic: anything that can publish to a named
//! channel, subscribe to one, and store keyed bytes can carry fabric traffic.
//! [`InMemoryTransport`] serves single-process deployments and tests; the
//! `fabric-nats` crate provides the distributed backend.
//!
//! # Channel naming
//!
//! - `actor:<target>:<eventType>` - directed delivery (ask/tell)
//! - `broadcast:<eventType>` - publish fan-out
//! - `event:response:<correlationId>` - ask replies
//!
//! # Key naming
//!
//! - `pending:<envelopeId>` - at-least-once entries awaiting ack
//! - `event:<envelopeId>` - optional event persistence

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

/// Buffered messages per channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 10_000;

// =============================================================================
// Names
// =============================================================================

/// Channel-name helpers. One format, used by every backend.
pub mod channels {
    use crate::envelope::CorrelationId;

    /// Directed delivery channel for one (target, event type) pair.
    pub fn direct(target: &str, event_type: &str) -> String {
        format!("actor:{target}:{event_type}")
    }

    /// Broadcast channel for one event type.
    pub fn broadcast(event_type: &str) -> String {
        format!("broadcast:{event_type}")
    }

    /// Reply channel for one ask call.
    pub fn response(cid: CorrelationId) -> String {
        format!("event:response:{cid}")
    }
}

/// Key-name helpers for the transport's durable storage.
pub mod keys {
    use uuid::Uuid;

    pub const PENDING_PREFIX: &str = "pending:";

    /// At-least-once entry for an unacked envelope.
    pub fn pending(envelope_id: Uuid) -> String {
        format!("{PENDING_PREFIX}{envelope_id}")
    }

    /// Persisted copy of an envelope.
    pub fn event(envelope_id: Uuid) -> String {
        format!("event:{envelope_id}")
    }
}

/// Parse a TTL string of the form `<number>_<unit>`.
///
/// Units: `seconds`, `minutes`, `hours`, `days` (singular accepted).
///
/// ```
/// use fabric::transport::parse_ttl;
/// use std::time::Duration;
///
/// assert_eq!(parse_ttl("90_seconds").unwrap(), Duration::from_secs(90));
/// assert_eq!(parse_ttl("5_minutes").unwrap(), Duration::from_secs(300));
/// assert_eq!(parse_ttl("1_day").unwrap(), Duration::from_secs(86_400));
/// ```
pub fn parse_ttl(value: &str) -> anyhow::Result<Duration> {
    let (amount, unit) = value
        .split_once('_')
        .ok_or_else(|| anyhow::anyhow!("TTL must look like <number>_<unit>: {value}"))?;
    let amount: u64 = amount
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid TTL amount: {value}"))?;
    let seconds = match unit.strip_suffix('s').unwrap_or(unit) {
        "second" => amount,
        "minute" => amount * 60,
        "hour" => amount * 3_600,
        "day" => amount * 86_400,
        _ => anyhow::bail!("invalid TTL unit: {value}"),
    };
    Ok(Duration::from_secs(seconds))
}

// =============================================================================
// Transport Trait
// =============================================================================

/// A stream of raw messages from one channel.
pub struct Subscription {
    receiver: mpsc::Receiver<Bytes>,
}

impl Subscription {
    /// Wrap a receiver; backends push decoded frames into it.
    pub fn new(receiver: mpsc::Receiver<Bytes>) -> Self {
        Self { receiver }
    }

    /// Next message, or `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}

/// The wire: topic publish, per-channel subscribe, durable keyed bytes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish a payload to a channel. No subscribers is not an error.
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Subscribe to a channel, receiving payloads published after this call.
    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription>;

    /// Store bytes under a key, replacing any previous value.
    async fn kv_put(&self, key: &str, value: Bytes) -> anyhow::Result<()>;

    /// Read a key.
    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn kv_delete(&self, key: &str) -> anyhow::Result<()>;

    /// List keys with the given prefix.
    async fn kv_list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    /// Release resources. Subscriptions end after this returns.
    async fn close(&self) -> anyhow::Result<()>;
}

// =============================================================================
// In-Memory Transport
// =============================================================================

/// Process-local transport over tokio broadcast channels.
///
/// Per channel, messages are FIFO for a single publisher; slow subscribers
/// lag and drop (at-most-once at this layer - the bus adds at-least-once on
/// top via pending entries).
pub struct InMemoryTransport {
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    kv: DashMap<String, Bytes>,
    closed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            kv: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("transport closed");
        }
        Ok(())
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()> {
        self.ensure_open()?;
        // A send error only means nobody is listening.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
        self.ensure_open()?;
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(channel = %channel_name, lagged = n, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }

    async fn kv_put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.kv.get(key).map(|v| v.value().clone()))
    }

    async fn kv_delete(&self, key: &str) -> anyhow::Result<()> {
        self.kv.remove(key);
        Ok(())
    }

    async fn kv_list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        // Dropping senders ends every forwarder task.
        self.channels.clear();
        self.kv.clear();
        Ok(())
    }
}
