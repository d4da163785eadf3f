//! Catalog persistence - data model, store and cache traits, in-memory impls.
//!
//! The catalog service (`catalog.rs`) is storage-agnostic. Backends implement
//! [`CatalogStore`]; `fabric-postgres` provides the relational one, and
//! [`InMemoryCatalogStore`] here serves single-process deployments and tests.
//!
//! Writes that must be atomic (definition + audit row) are single trait
//! methods so a relational backend can wrap them in one transaction.
//!
//! # Store Errors
//!
//! Store methods return `anyhow::Result`; the catalog service maps write
//! failures to `EVENT_REGISTRATION_FAILED` and fails read paths closed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{CorrelationId, EventCategory};
use crate::schema::PayloadSchema;

// =============================================================================
// Data Model
// =============================================================================

/// Immutable contract of an event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    /// Unique name, conventionally `VERB_NOUN`, `GET_NOUN`, or `NOUN_VERB_PAST`.
    pub name: String,
    pub category: EventCategory,
    pub description: String,
    pub producer_actor: String,
    /// Monotonic; bumped when the schema changes.
    pub version: i32,
    pub deprecated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
    pub payload_schema: PayloadSchema,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EventDefinition {
    /// A fresh version-1 definition stamped now.
    pub fn new(
        name: impl Into<String>,
        category: EventCategory,
        producer_actor: impl Into<String>,
        payload_schema: PayloadSchema,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            category,
            description: String::new(),
            producer_actor: producer_actor.into(),
            version: 1,
            deprecated: false,
            replaced_by: None,
            payload_schema,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// How a consumer receives an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPattern {
    Ask,
    Tell,
    Publish,
}

/// A routing edge: one actor consuming one event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventConsumer {
    pub event_name: String,
    pub consumer_actor: String,
    /// Required consumers failing to receive is an operational alert.
    pub required: bool,
    pub pattern: DeliveryPattern,
    /// Ask deadline; meaningless for tell/publish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Flat equality constraints evaluated against the payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
}

impl EventConsumer {
    pub fn new(
        event_name: impl Into<String>,
        consumer_actor: impl Into<String>,
        pattern: DeliveryPattern,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            consumer_actor: consumer_actor.into(),
            required: false,
            pattern,
            timeout_ms: None,
            filter: None,
        }
    }

    /// Whether the payload passes this consumer's filter.
    ///
    /// Filters are flat equality objects: `{"plan": "pro"}` matches payloads
    /// whose `plan` equals `"pro"`. Anything else is treated as match-all.
    pub fn matches(&self, payload: &Value) -> bool {
        match &self.filter {
            None => true,
            Some(Value::Object(constraints)) => constraints
                .iter()
                .all(|(key, expected)| payload.get(key) == Some(expected)),
            Some(other) => {
                tracing::debug!(filter = %other, "non-object consumer filter treated as match-all");
                true
            }
        }
    }
}

/// Direction of an event observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricDirection {
    Produced,
    Consumed,
}

/// One observation of an event passing an actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetric {
    pub event_name: String,
    pub actor_id: String,
    pub direction: MetricDirection,
    pub success: bool,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only schema history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub event_name: String,
    pub version: i32,
    pub payload_schema: PayloadSchema,
    /// Stored verbatim; the runtime never executes migrations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_script: Option<String>,
    pub breaking_change: bool,
    pub change_description: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// An actor's declaration of what it produces and consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorManifest {
    pub actor_name: String,
    pub description: String,
    pub version: String,
    pub produces: BTreeSet<String>,
    pub consumes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
}

impl ActorManifest {
    pub fn new(actor_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            actor_name: actor_name.into(),
            description: String::new(),
            version: version.into(),
            produces: BTreeSet::new(),
            consumes: BTreeSet::new(),
            health_endpoint: None,
        }
    }

    pub fn produces(mut self, event: impl Into<String>) -> Self {
        self.produces.insert(event.into());
        self
    }

    pub fn consumes(mut self, event: impl Into<String>) -> Self {
        self.consumes.insert(event.into());
        self
    }
}

/// Audit trail entry for a catalog write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub event_name: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub changed_by: String,
    pub changed_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        event_name: impl Into<String>,
        action: impl Into<String>,
        changed_by: impl Into<String>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            action: action.into(),
            old_value: None,
            new_value: None,
            changed_by: changed_by.into(),
            changed_at: Utc::now(),
        }
    }
}

/// Listing filter for [`CatalogStore::list_definitions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub category: Option<EventCategory>,
    pub producer: Option<String>,
    pub deprecated: Option<bool>,
}

impl EventFilter {
    pub fn is_empty(&self) -> bool {
        *self == EventFilter::default()
    }

    /// Whether a definition passes this filter.
    pub fn accepts(&self, def: &EventDefinition) -> bool {
        self.category.map_or(true, |c| def.category == c)
            && self
                .producer
                .as_ref()
                .map_or(true, |p| &def.producer_actor == p)
            && self.deprecated.map_or(true, |d| def.deprecated == d)
    }
}

/// Produced/consumed/failure tallies over a window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounts {
    pub produced: u64,
    pub consumed: u64,
    pub failures: u64,
}

// =============================================================================
// Store Trait
// =============================================================================

/// Persistence behind the catalog.
///
/// `*_with_audit` methods must be atomic: either both rows land or neither.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    async fn upsert_definition(
        &self,
        def: &EventDefinition,
        audit: &AuditEntry,
    ) -> anyhow::Result<()>;

    async fn get_definition(&self, name: &str) -> anyhow::Result<Option<EventDefinition>>;

    /// Definitions passing the filter, ordered by name.
    async fn list_definitions(&self, filter: &EventFilter)
        -> anyhow::Result<Vec<EventDefinition>>;

    async fn upsert_consumer(
        &self,
        consumer: &EventConsumer,
        audit: &AuditEntry,
    ) -> anyhow::Result<()>;

    async fn remove_consumer(
        &self,
        event_name: &str,
        consumer_actor: &str,
        audit: &AuditEntry,
    ) -> anyhow::Result<()>;

    /// Consumers of an event, ordered by consumer actor.
    async fn get_consumers(&self, event_name: &str) -> anyhow::Result<Vec<EventConsumer>>;

    /// Every consumer edge (dependency graph source).
    async fn all_consumers(&self) -> anyhow::Result<Vec<EventConsumer>>;

    async fn append_metric(&self, metric: &EventMetric) -> anyhow::Result<()>;

    async fn append_schema_version(&self, version: &SchemaVersion) -> anyhow::Result<()>;

    /// History rows for an event, ordered by version.
    async fn get_schema_history(&self, event_name: &str) -> anyhow::Result<Vec<SchemaVersion>>;

    async fn upsert_manifest(&self, manifest: &ActorManifest) -> anyhow::Result<()>;

    async fn get_manifest(&self, actor_name: &str) -> anyhow::Result<Option<ActorManifest>>;

    /// Tallies for one event since `since`.
    async fn usage_counts(
        &self,
        event_name: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<UsageCounts>;

    /// Liveness probe.
    async fn ping(&self) -> anyhow::Result<()>;
}

// =============================================================================
// Cache Trait
// =============================================================================

/// Read-through cache in front of the store.
///
/// Every error from a cache is logged and bypassed by the catalog - a broken
/// cache degrades to slower reads, never to failures.
#[async_trait]
pub trait CatalogCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> anyhow::Result<()>;
    async fn invalidate_prefix(&self, prefix: &str) -> anyhow::Result<()>;
    async fn ping(&self) -> anyhow::Result<()>;
}

// =============================================================================
// In-Memory Store
// =============================================================================

#[derive(Default)]
struct StoreTables {
    metrics: Vec<EventMetric>,
    versions: Vec<SchemaVersion>,
    audit: Vec<AuditEntry>,
}

/// Process-local catalog store.
///
/// `set_failing(true)` makes every operation error, for exercising the
/// catalog's outage semantics in tests.
#[derive(Default)]
pub struct InMemoryCatalogStore {
    definitions: DashMap<String, EventDefinition>,
    consumers: DashMap<(String, String), EventConsumer>,
    manifests: DashMap<String, ActorManifest>,
    tables: Mutex<StoreTables>,
    failing: AtomicBool,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            anyhow::bail!("catalog store unavailable")
        }
        Ok(())
    }

    /// Recorded audit entries, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .audit
            .clone()
    }

    /// Recorded metrics, oldest first.
    pub fn metrics(&self) -> Vec<EventMetric> {
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .metrics
            .clone()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn upsert_definition(
        &self,
        def: &EventDefinition,
        audit: &AuditEntry,
    ) -> anyhow::Result<()> {
        self.check()?;
        self.definitions.insert(def.name.clone(), def.clone());
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .audit
            .push(audit.clone());
        Ok(())
    }

    async fn get_definition(&self, name: &str) -> anyhow::Result<Option<EventDefinition>> {
        self.check()?;
        Ok(self.definitions.get(name).map(|d| d.value().clone()))
    }

    async fn list_definitions(
        &self,
        filter: &EventFilter,
    ) -> anyhow::Result<Vec<EventDefinition>> {
        self.check()?;
        let mut defs: Vec<EventDefinition> = self
            .definitions
            .iter()
            .filter(|e| filter.accepts(e.value()))
            .map(|e| e.value().clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }

    async fn upsert_consumer(
        &self,
        consumer: &EventConsumer,
        audit: &AuditEntry,
    ) -> anyhow::Result<()> {
        self.check()?;
        self.consumers.insert(
            (consumer.event_name.clone(), consumer.consumer_actor.clone()),
            consumer.clone(),
        );
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .audit
            .push(audit.clone());
        Ok(())
    }

    async fn remove_consumer(
        &self,
        event_name: &str,
        consumer_actor: &str,
        audit: &AuditEntry,
    ) -> anyhow::Result<()> {
        self.check()?;
        self.consumers
            .remove(&(event_name.to_string(), consumer_actor.to_string()));
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .audit
            .push(audit.clone());
        Ok(())
    }

    async fn get_consumers(&self, event_name: &str) -> anyhow::Result<Vec<EventConsumer>> {
        self.check()?;
        let mut consumers: Vec<EventConsumer> = self
            .consumers
            .iter()
            .filter(|e| e.key().0 == event_name)
            .map(|e| e.value().clone())
            .collect();
        consumers.sort_by(|a, b| a.consumer_actor.cmp(&b.consumer_actor));
        Ok(consumers)
    }

    async fn all_consumers(&self) -> anyhow::Result<Vec<EventConsumer>> {
        self.check()?;
        let mut consumers: Vec<EventConsumer> =
            self.consumers.iter().map(|e| e.value().clone()).collect();
        consumers.sort_by(|a, b| {
            (&a.event_name, &a.consumer_actor).cmp(&(&b.event_name, &b.consumer_actor))
        });
        Ok(consumers)
    }

    async fn append_metric(&self, metric: &EventMetric) -> anyhow::Result<()> {
        self.check()?;
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .metrics
            .push(metric.clone());
        Ok(())
    }

    async fn append_schema_version(&self, version: &SchemaVersion) -> anyhow::Result<()> {
        self.check()?;
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .versions
            .push(version.clone());
        Ok(())
    }

    async fn get_schema_history(&self, event_name: &str) -> anyhow::Result<Vec<SchemaVersion>> {
        self.check()?;
        let mut history: Vec<SchemaVersion> = self
            .tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .versions
            .iter()
            .filter(|v| v.event_name == event_name)
            .cloned()
            .collect();
        history.sort_by_key(|v| v.version);
        Ok(history)
    }

    async fn upsert_manifest(&self, manifest: &ActorManifest) -> anyhow::Result<()> {
        self.check()?;
        self.manifests
            .insert(manifest.actor_name.clone(), manifest.clone());
        Ok(())
    }

    async fn get_manifest(&self, actor_name: &str) -> anyhow::Result<Option<ActorManifest>> {
        self.check()?;
        Ok(self.manifests.get(actor_name).map(|m| m.value().clone()))
    }

    async fn usage_counts(
        &self,
        event_name: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<UsageCounts> {
        self.check()?;
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let mut counts = UsageCounts::default();
        for m in tables
            .metrics
            .iter()
            .filter(|m| m.event_name == event_name && m.timestamp >= since)
        {
            match m.direction {
                MetricDirection::Produced => counts.produced += 1,
                MetricDirection::Consumed => counts.consumed += 1,
            }
            if !m.success {
                counts.failures += 1;
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.check()
    }
}

// =============================================================================
// In-Memory Cache
// =============================================================================

/// TTL cache over a concurrent map.
pub struct InMemoryCache {
    entries: DashMap<String, (Value, tokio::time::Instant)>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Live entry count (expired entries are pruned on read).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogCache for InMemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expiry) = entry.value();
            if tokio::time::Instant::now() < *expiry {
                return Ok(Some(value.clone()));
            }
        }
        self.entries
            .remove_if(key, |_, (_, expiry)| tokio::time::Instant::now() >= *expiry);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> anyhow::Result<()> {
        self.entries.insert(
            key.to_string(),
            (value, tokio::time::Instant::now() + ttl),
        );
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> anyhow::Result<()> {
        self.entries.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
