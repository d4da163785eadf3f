//! NATS transport for the fabric event bus.
//!
//! Maps fabric channels onto NATS subjects one-to-one (channel names contain
//! no NATS-reserved characters) and keeps the bus's durable keys in a
//! JetStream key-value bucket. One [`NatsTransport`] per process; every
//! `EventBus` clone shares it.
//!
//! ```ignore
//! let transport = Arc::new(NatsTransport::connect("nats://localhost:4222", "fabric").await?);
//! let bus = EventBus::with_config(transport, BusConfig {
//!     delivery: DeliveryGuarantee::AtLeastOnce,
//!     ..Default::default()
//! });
//! ```
//!
//! JetStream KV keys may not contain `:`, so `pending:<id>` is stored as
//! `pending.<id>` and mapped back on read.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use fabric::{Subscription, Transport};

/// Buffered messages per subscription before backpressure.
const SUBSCRIPTION_BUFFER: usize = 10_000;

fn encode_key(key: &str) -> String {
    key.replace(':', ".")
}

fn decode_key(key: &str) -> String {
    key.replace('.', ":")
}

/// Transport over a NATS connection plus a JetStream KV bucket.
pub struct NatsTransport {
    client: async_nats::Client,
    kv: async_nats::jetstream::kv::Store,
}

impl NatsTransport {
    /// Connect to a NATS server and open (or create) the KV bucket.
    pub async fn connect(url: &str, bucket: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(url).await?;
        let jetstream = async_nats::jetstream::new(client.clone());
        let kv = match jetstream.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => {
                jetstream
                    .create_key_value(async_nats::jetstream::kv::Config {
                        bucket: bucket.to_string(),
                        description: "fabric bus durable keys".to_string(),
                        ..Default::default()
                    })
                    .await?
            }
        };
        Ok(Self { client, kv })
    }

    /// Wrap an existing client and bucket.
    pub fn new(client: async_nats::Client, kv: async_nats::jetstream::kv::Store) -> Self {
        Self { client, kv }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> anyhow::Result<()> {
        self.client.publish(channel.to_string(), payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<Subscription> {
        let mut subscriber = self.client.subscribe(channel.to_string()).await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let subject = channel.to_string();
        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if tx.send(message.payload).await.is_err() {
                    break;
                }
            }
            tracing::debug!(subject = %subject, "nats subscription ended");
        });
        Ok(Subscription::new(rx))
    }

    async fn kv_put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        self.kv.put(encode_key(key), value).await?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.kv.get(encode_key(key)).await?)
    }

    async fn kv_delete(&self, key: &str) -> anyhow::Result<()> {
        self.kv.delete(encode_key(key)).await?;
        Ok(())
    }

    async fn kv_list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let encoded_prefix = encode_key(prefix);
        let mut keys = self.kv.keys().await?;
        let mut out = Vec::new();
        while let Some(key) = keys.next().await {
            match key {
                Ok(key) if key.starts_with(&encoded_prefix) => out.push(decode_key(&key)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "kv key listing error");
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}
