//! Test utilities, compiled under the `testing` feature (and for this
//! crate's own tests).
//!
//! [`RecordingTransport`] wraps the in-memory transport and keeps every
//! published frame, so tests can assert exactly what the bus put on the wire:
//! which channel, which envelope, how many times.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::envelope::Envelope;
use crate::transport::{InMemoryTransport, Subscription, Transport};

/// A transport that records every publish.
#[derive(Default)]
pub struct RecordingTransport {
    inner: InMemoryTransport,
    published: Mutex<Vec<(String, Bytes)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(channel, frame)` published so far.
    pub fn raw_records(&self) -> Vec<(String, Bytes)> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Decoded envelopes published to channels with the given prefix.
    pub fn envelopes_on(&self, channel_prefix: &str) -> Vec<Envelope> {
        self.raw_records()
            .into_iter()
            .filter(|(channel, _)| channel.starts_with(channel_prefix))
            .filter_map(|(_, bytes)| serde_json::from_slice(&bytes).ok())
            .collect()
    }

    /// Envelopes told directly to one actor.
    pub fn tells_to(&self, target: &str) -> Vec<Envelope> {
        self.envelopes_on(&format!("actor:{target}:"))
    }

    /// Envelopes broadcast for one event type.
    pub fn broadcasts_of(&self, event_type: &str) -> Vec<Envelope> {
        self.envelopes_on(&format!("broadcast:{event_type}"))
    }

    /// Drop all recordings.
    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()> {
        self.published
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((channel.to_string(), payload.clone()));
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
        self.inner.subscribe(channel).await
    }

    async fn kv_put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        self.inner.kv_put(key, value).await
    }

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        self.inner.kv_get(key).await
    }

    async fn kv_delete(&self, key: &str) -> anyhow::Result<()> {
        self.inner.kv_delete(key).await
    }

    async fn kv_list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        self.inner.kv_list(prefix).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_publishes_by_channel() {
        let transport = RecordingTransport::new();
        let env = Envelope::new("MAGIC_LINK_SENT", json!({"email": "u@x"}));
        let bytes = Bytes::from(serde_json::to_vec(&env).unwrap());

        transport
            .publish("actor:notification:MAGIC_LINK_SENT", bytes.clone())
            .await
            .unwrap();
        transport
            .publish("broadcast:MAGIC_LINK_SENT", bytes)
            .await
            .unwrap();

        assert_eq!(transport.tells_to("notification").len(), 1);
        assert_eq!(transport.broadcasts_of("MAGIC_LINK_SENT").len(), 1);
        assert_eq!(transport.tells_to("analytics").len(), 0);

        transport.clear();
        assert!(transport.raw_records().is_empty());
    }
}
