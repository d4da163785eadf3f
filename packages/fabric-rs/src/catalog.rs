//! Event catalog - the single source of truth for event shape and routing.
//!
//! The catalog owns event definitions, their payload schemas, the consumer
//! routing table, schema history, actor manifests, and the metrics sink.
//! Everything an actor validates or routes passes through here.
//!
//! # Caching
//!
//! Reads go cache-first when a [`CatalogCache`] is attached (TTL 5 minutes by
//! default). Keys: `event:<name>`, `event:list`, `consumers:<name>`. Writes
//! invalidate the touched keys. A failing cache is logged and bypassed,
//! never surfaced.
//!
//! # Failure semantics
//!
//! - Writes (`register`, `update`, `add_consumer`, ...) fail with
//!   `EVENT_REGISTRATION_FAILED` when the store errors.
//! - Reads fail closed: `get_definition` returns `None`, `validate_payload`
//!   returns `{valid: false}`. They do not propagate store errors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};

use crate::envelope::EventCategory;
use crate::error::{ErrorCode, FabricError};
use crate::schema::{CompiledSchema, PayloadSchema, ValidationMode, ValidationOutcome};
use crate::store::{
    ActorManifest, AuditEntry, CatalogCache, CatalogStore, EventConsumer, EventDefinition,
    EventFilter, EventMetric, SchemaVersion,
};

/// Default cache TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

// =============================================================================
// Config & Construction
// =============================================================================

/// Catalog tunables.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub cache_ttl: Duration,
    pub validation_mode: ValidationMode,
    /// When false, `record_metric` is a silent no-op.
    pub metrics_enabled: bool,
    /// Recorded as `changed_by` on audit rows.
    pub changed_by: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            validation_mode: ValidationMode::Loose,
            metrics_enabled: true,
            changed_by: "runtime".to_string(),
        }
    }
}

/// Partial update for [`EventCatalog::update`].
#[derive(Debug, Clone, Default)]
pub struct DefinitionUpdate {
    pub description: Option<String>,
    pub payload_schema: Option<PayloadSchema>,
    pub deprecated: Option<bool>,
    pub replaced_by: Option<String>,
}

/// Options for [`EventCatalog::add_consumer`].
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub required: bool,
    pub pattern: crate::store::DeliveryPattern,
    pub timeout_ms: Option<u64>,
    pub filter: Option<Value>,
}

/// One row of [`EventCatalog::export_catalog`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogExportRow {
    #[serde(flatten)]
    pub definition: EventDefinition,
    pub consumers: Vec<String>,
    pub produced_24h: u64,
    pub consumed_24h: u64,
    pub failure_rate: f64,
}

/// Actor dependency graph derived from the consumer table.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<DependencyEdge>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    pub source: String,
    pub target: String,
    pub events: Vec<String>,
}

/// Catalog liveness report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogHealth {
    pub store_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ok: Option<bool>,
    pub healthy: bool,
}

/// The catalog service.
pub struct EventCatalog {
    store: Arc<dyn CatalogStore>,
    cache: Option<Arc<dyn CatalogCache>>,
    config: CatalogConfig,
    /// Compiled validators memoized by (event name, version).
    validators: DashMap<(String, i32), Arc<CompiledSchema>>,
}

impl EventCatalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            cache: None,
            config: CatalogConfig::default(),
            validators: DashMap::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CatalogCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: CatalogConfig) -> Self {
        self.config = config;
        self
    }

    // =========================================================================
    // Cache plumbing
    // =========================================================================

    async fn cache_get(&self, key: &str) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, bypassing");
                None
            }
        }
    }

    async fn cache_set(&self, key: &str, value: Value) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(key, value, self.config.cache_ttl).await {
                tracing::warn!(key, error = %e, "cache write failed");
            }
        }
    }

    async fn cache_invalidate(&self, prefixes: &[String]) {
        if let Some(cache) = &self.cache {
            for prefix in prefixes {
                if let Err(e) = cache.invalidate_prefix(prefix).await {
                    tracing::warn!(prefix = %prefix, error = %e, "cache invalidation failed");
                }
            }
        }
    }

    fn registration_failed(e: anyhow::Error) -> FabricError {
        tracing::error!(error = %e, "catalog write failed");
        FabricError::new(ErrorCode::EventRegistrationFailed, "Event registration failed")
            .with_field("detail", json!(e.to_string()))
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Register or re-register an event definition.
    ///
    /// The schema must compile under the configured mode; the definition name
    /// must be non-empty. Re-registering with a changed schema bumps the
    /// version and appends a schema-history row.
    pub async fn register(&self, mut def: EventDefinition) -> Result<EventDefinition, FabricError> {
        if def.name.trim().is_empty() {
            return Err(FabricError::new(
                ErrorCode::InvalidEventDefinition,
                "Event name must not be empty",
            ));
        }
        CompiledSchema::compile(&def.payload_schema, self.config.validation_mode).map_err(|e| {
            FabricError::new(ErrorCode::InvalidEventDefinition, "Payload schema is malformed")
                .with_field("eventName", json!(def.name))
                .with_field("detail", json!(e.to_string()))
        })?;

        let existing = self.load_definition(&def.name).await;
        let mut audit = AuditEntry::new(&def.name, "register", &self.config.changed_by);
        audit.old_value = existing.as_ref().map(|d| json!(d));

        let schema_changed = match &existing {
            Some(old) => {
                def.created_at = old.created_at;
                def.version = if old.payload_schema != def.payload_schema {
                    old.version + 1
                } else {
                    old.version
                };
                old.payload_schema != def.payload_schema
            }
            None => {
                def.version = def.version.max(1);
                true
            }
        };
        def.updated_at = Utc::now();
        audit.new_value = Some(json!(def));

        self.store
            .upsert_definition(&def, &audit)
            .await
            .map_err(Self::registration_failed)?;

        if schema_changed {
            let version_row = SchemaVersion {
                event_name: def.name.clone(),
                version: def.version,
                payload_schema: def.payload_schema.clone(),
                migration_script: None,
                breaking_change: false,
                change_description: if existing.is_some() {
                    "re-registered with new schema".to_string()
                } else {
                    "initial registration".to_string()
                },
                created_at: Utc::now(),
                created_by: self.config.changed_by.clone(),
            };
            if let Err(e) = self.store.append_schema_version(&version_row).await {
                tracing::warn!(event = %def.name, error = %e, "schema history append failed");
            }
        }

        self.validators.retain(|(name, _), _| name != &def.name);
        self.cache_invalidate(&[format!("event:{}", def.name), "event:list".to_string()])
            .await;
        Ok(def)
    }

    /// Apply a partial update to an existing definition.
    pub async fn update(
        &self,
        name: &str,
        update: DefinitionUpdate,
    ) -> Result<EventDefinition, FabricError> {
        let Some(old) = self.load_definition(name).await else {
            return Err(FabricError::event_not_found(name));
        };

        let mut def = old.clone();
        if let Some(description) = update.description {
            def.description = description;
        }
        if let Some(deprecated) = update.deprecated {
            def.deprecated = deprecated;
        }
        if let Some(replaced_by) = update.replaced_by {
            def.replaced_by = Some(replaced_by);
        }
        let schema_changed = match update.payload_schema {
            Some(schema) if schema != def.payload_schema => {
                CompiledSchema::compile(&schema, self.config.validation_mode).map_err(|e| {
                    FabricError::new(
                        ErrorCode::InvalidEventDefinition,
                        "Payload schema is malformed",
                    )
                    .with_field("detail", json!(e.to_string()))
                })?;
                def.payload_schema = schema;
                def.version += 1;
                true
            }
            _ => false,
        };
        def.updated_at = Utc::now();

        let mut audit = AuditEntry::new(name, "update", &self.config.changed_by);
        audit.old_value = Some(json!(old));
        audit.new_value = Some(json!(def));

        self.store
            .upsert_definition(&def, &audit)
            .await
            .map_err(Self::registration_failed)?;

        if schema_changed {
            let row = SchemaVersion {
                event_name: def.name.clone(),
                version: def.version,
                payload_schema: def.payload_schema.clone(),
                migration_script: None,
                breaking_change: false,
                change_description: "updated schema".to_string(),
                created_at: Utc::now(),
                created_by: self.config.changed_by.clone(),
            };
            if let Err(e) = self.store.append_schema_version(&row).await {
                tracing::warn!(event = name, error = %e, "schema history append failed");
            }
        }

        self.validators.retain(|(n, _), _| n != name);
        self.cache_invalidate(&[format!("event:{name}"), "event:list".to_string()])
            .await;
        Ok(def)
    }

    /// Mark a definition deprecated, optionally pointing at its successor.
    pub async fn deprecate(
        &self,
        name: &str,
        replaced_by: Option<&str>,
    ) -> Result<EventDefinition, FabricError> {
        self.update(
            name,
            DefinitionUpdate {
                deprecated: Some(true),
                replaced_by: replaced_by.map(str::to_string),
                ..Default::default()
            },
        )
        .await
    }

    async fn load_definition(&self, name: &str) -> Option<EventDefinition> {
        let key = format!("event:{name}");
        if let Some(hit) = self.cache_get(&key).await {
            if let Ok(def) = serde_json::from_value::<EventDefinition>(hit) {
                return Some(def);
            }
        }
        match self.store.get_definition(name).await {
            Ok(Some(def)) => {
                self.cache_set(&key, json!(def)).await;
                Some(def)
            }
            Ok(None) => None,
            Err(e) => {
                // Fail closed: an unreachable store reads as "not found".
                tracing::warn!(event = name, error = %e, "definition read failed");
                None
            }
        }
    }

    /// Fetch one definition, cache-first. `None` for unknown events.
    pub async fn get_definition(&self, name: &str) -> Option<EventDefinition> {
        self.load_definition(name).await
    }

    /// List definitions matching the filter, ordered by name.
    pub async fn list_events(&self, filter: EventFilter) -> Vec<EventDefinition> {
        if filter.is_empty() {
            if let Some(hit) = self.cache_get("event:list").await {
                if let Ok(defs) = serde_json::from_value::<Vec<EventDefinition>>(hit) {
                    return defs;
                }
            }
        }
        match self.store.list_definitions(&filter).await {
            Ok(defs) => {
                if filter.is_empty() {
                    self.cache_set("event:list", json!(defs)).await;
                }
                defs
            }
            Err(e) => {
                tracing::warn!(error = %e, "definition list failed");
                Vec::new()
            }
        }
    }

    /// The category of an event, from the catalog when known, by naming
    /// convention otherwise.
    pub async fn category_of(&self, event_name: &str) -> EventCategory {
        match self.get_definition(event_name).await {
            Some(def) => def.category,
            None => EventCategory::infer(event_name),
        }
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Add or update a consumer edge for an event.
    pub async fn add_consumer(
        &self,
        event_name: &str,
        consumer_actor: &str,
        spec: ConsumerSpec,
    ) -> Result<EventConsumer, FabricError> {
        if consumer_actor.trim().is_empty() {
            return Err(FabricError::new(
                ErrorCode::InvalidConsumer,
                "Consumer actor must not be empty",
            ));
        }
        if self.load_definition(event_name).await.is_none() {
            return Err(FabricError::event_not_found(event_name));
        }

        let consumer = EventConsumer {
            event_name: event_name.to_string(),
            consumer_actor: consumer_actor.to_string(),
            required: spec.required,
            pattern: spec.pattern,
            timeout_ms: spec.timeout_ms,
            filter: spec.filter,
        };
        let mut audit = AuditEntry::new(event_name, "add_consumer", &self.config.changed_by);
        audit.new_value = Some(json!(consumer));

        self.store
            .upsert_consumer(&consumer, &audit)
            .await
            .map_err(Self::registration_failed)?;
        self.cache_invalidate(&[format!("consumers:{event_name}")]).await;
        Ok(consumer)
    }

    /// Remove a consumer edge.
    pub async fn remove_consumer(
        &self,
        event_name: &str,
        consumer_actor: &str,
    ) -> Result<(), FabricError> {
        let audit = AuditEntry::new(event_name, "remove_consumer", &self.config.changed_by);
        self.store
            .remove_consumer(event_name, consumer_actor, &audit)
            .await
            .map_err(Self::registration_failed)?;
        self.cache_invalidate(&[format!("consumers:{event_name}")]).await;
        Ok(())
    }

    /// Consumers of an event, ordered, cache-backed. Empty on store outage.
    pub async fn get_consumers(&self, event_name: &str) -> Vec<EventConsumer> {
        let key = format!("consumers:{event_name}");
        if let Some(hit) = self.cache_get(&key).await {
            if let Ok(consumers) = serde_json::from_value::<Vec<EventConsumer>>(hit) {
                return consumers;
            }
        }
        match self.store.get_consumers(event_name).await {
            Ok(consumers) => {
                self.cache_set(&key, json!(consumers)).await;
                consumers
            }
            Err(e) => {
                tracing::warn!(event = event_name, error = %e, "consumer read failed");
                Vec::new()
            }
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate a payload against the event's current schema.
    ///
    /// Validators are compiled once per `(event name, version)` and memoized.
    /// Unknown events fail with a single `Event <name> not found` error.
    pub async fn validate_payload(&self, event_name: &str, payload: &Value) -> ValidationOutcome {
        let Some(def) = self.load_definition(event_name).await else {
            return ValidationOutcome::single(format!("Event {event_name} not found"));
        };

        let key = (def.name.clone(), def.version);
        let compiled = match self.validators.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                match CompiledSchema::compile(&def.payload_schema, self.config.validation_mode) {
                    Ok(compiled) => {
                        let compiled = Arc::new(compiled);
                        self.validators.insert(key, compiled.clone());
                        compiled
                    }
                    Err(e) => {
                        // A schema that registered but no longer compiles is a
                        // catalog defect; fail the payload, not the process.
                        tracing::error!(event = event_name, error = %e, "stored schema failed to compile");
                        return ValidationOutcome::single(format!(
                            "Schema for {event_name} failed to compile"
                        ));
                    }
                }
            }
        };
        compiled.validate(payload)
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Append one metric observation. Silent no-op when metrics are disabled;
    /// store failures are logged, never raised.
    pub async fn record_metric(&self, metric: EventMetric) {
        if !self.config.metrics_enabled {
            return;
        }
        if let Err(e) = self.store.append_metric(&metric).await {
            tracing::warn!(event = %metric.event_name, error = %e, "metric append failed");
        }
    }

    // =========================================================================
    // Manifests & Discovery
    // =========================================================================

    /// Register an actor's manifest.
    pub async fn register_actor(&self, manifest: ActorManifest) -> Result<(), FabricError> {
        self.store
            .upsert_manifest(&manifest)
            .await
            .map_err(Self::registration_failed)
    }

    /// Fetch an actor's manifest.
    pub async fn get_actor_manifest(&self, actor_name: &str) -> Option<ActorManifest> {
        match self.store.get_manifest(actor_name).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(actor = actor_name, error = %e, "manifest read failed");
                None
            }
        }
    }

    /// The event names an actor produces and consumes.
    pub async fn discover_events(&self, actor_name: &str) -> (BTreeSet<String>, BTreeSet<String>) {
        match self.get_actor_manifest(actor_name).await {
            Some(manifest) => (manifest.produces, manifest.consumes),
            None => (BTreeSet::new(), BTreeSet::new()),
        }
    }

    // =========================================================================
    // Schema History
    // =========================================================================

    /// Append an explicit schema version and make it current.
    pub async fn add_schema_version(
        &self,
        event_name: &str,
        version: SchemaVersion,
    ) -> Result<(), FabricError> {
        let Some(mut def) = self.load_definition(event_name).await else {
            return Err(FabricError::event_not_found(event_name));
        };
        CompiledSchema::compile(&version.payload_schema, self.config.validation_mode).map_err(
            |e| {
                FabricError::new(ErrorCode::InvalidEventDefinition, "Payload schema is malformed")
                    .with_field("detail", json!(e.to_string()))
            },
        )?;

        self.store
            .append_schema_version(&version)
            .await
            .map_err(Self::registration_failed)?;

        def.payload_schema = version.payload_schema.clone();
        def.version = version.version;
        def.updated_at = Utc::now();
        let mut audit = AuditEntry::new(event_name, "add_schema_version", &self.config.changed_by);
        audit.new_value = Some(json!({ "version": version.version }));
        self.store
            .upsert_definition(&def, &audit)
            .await
            .map_err(Self::registration_failed)?;

        self.validators.retain(|(n, _), _| n != event_name);
        self.cache_invalidate(&[format!("event:{event_name}"), "event:list".to_string()])
            .await;
        Ok(())
    }

    /// The append-only version log for an event.
    pub async fn get_schema_history(&self, event_name: &str) -> Vec<SchemaVersion> {
        match self.store.get_schema_history(event_name).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(event = event_name, error = %e, "schema history read failed");
                Vec::new()
            }
        }
    }

    // =========================================================================
    // Derived Views
    // =========================================================================

    /// Render a deterministic textual listing of the catalog, grouped by
    /// category. Purely derived; generating twice yields identical output.
    pub async fn generate_types(&self) -> String {
        let defs = self.list_events(EventFilter::default()).await;
        let mut by_category: BTreeMap<&'static str, Vec<&EventDefinition>> = BTreeMap::new();
        for def in &defs {
            by_category.entry(def.category.as_str()).or_default().push(def);
        }

        let mut out = String::from("// Event catalog. Derived file, do not edit.\n");
        for (category, defs) in by_category {
            out.push_str(&format!("\n// {category}s\n"));
            for def in defs {
                let deprecated = if def.deprecated { " [deprecated]" } else { "" };
                out.push_str(&format!(
                    "{} v{} (producer: {}){}\n",
                    def.name, def.version, def.producer_actor, deprecated
                ));
                if let Ok(schema) = serde_json::to_string(&def.payload_schema) {
                    out.push_str(&format!("  payload: {schema}\n"));
                }
            }
        }
        out
    }

    /// Flattened catalog view with 24h usage counts and failure rate.
    pub async fn export_catalog(&self) -> Vec<CatalogExportRow> {
        let since = Utc::now() - chrono::Duration::hours(24);
        let mut rows = Vec::new();
        for def in self.list_events(EventFilter::default()).await {
            let counts = match self.store.usage_counts(&def.name, since).await {
                Ok(counts) => counts,
                Err(e) => {
                    tracing::warn!(event = %def.name, error = %e, "usage counts failed");
                    Default::default()
                }
            };
            let consumers = self
                .get_consumers(&def.name)
                .await
                .into_iter()
                .map(|c| c.consumer_actor)
                .collect();
            let total = counts.produced + counts.consumed;
            rows.push(CatalogExportRow {
                definition: def,
                consumers,
                produced_24h: counts.produced,
                consumed_24h: counts.consumed,
                failure_rate: if total == 0 {
                    0.0
                } else {
                    counts.failures as f64 / total as f64
                },
            });
        }
        rows
    }

    /// Actor dependency graph: nodes are actors, edges carry event lists.
    pub async fn visualize_dependencies(&self) -> DependencyGraph {
        let defs = self.list_events(EventFilter::default()).await;
        let producers: BTreeMap<String, String> = defs
            .iter()
            .map(|d| (d.name.clone(), d.producer_actor.clone()))
            .collect();

        let consumers = match self.store.all_consumers().await {
            Ok(consumers) => consumers,
            Err(e) => {
                tracing::warn!(error = %e, "consumer scan failed");
                Vec::new()
            }
        };

        let mut nodes: BTreeSet<String> = producers.values().cloned().collect();
        let mut edges: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for consumer in consumers {
            let Some(source) = producers.get(&consumer.event_name) else {
                continue;
            };
            nodes.insert(consumer.consumer_actor.clone());
            edges
                .entry((source.clone(), consumer.consumer_actor.clone()))
                .or_default()
                .insert(consumer.event_name);
        }

        DependencyGraph {
            nodes: nodes.into_iter().collect(),
            edges: edges
                .into_iter()
                .map(|((source, target), events)| DependencyEdge {
                    source,
                    target,
                    events: events.into_iter().collect(),
                })
                .collect(),
        }
    }

    /// Ping the store and cache.
    pub async fn health_check(&self) -> CatalogHealth {
        let store_ok = self.store.ping().await.is_ok();
        let cache_ok = match &self.cache {
            Some(cache) => Some(cache.ping().await.is_ok()),
            None => None,
        };
        CatalogHealth {
            store_ok,
            cache_ok,
            healthy: store_ok && cache_ok.unwrap_or(true),
        }
    }
}

impl std::fmt::Debug for EventCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventCatalog")
            .field("cached_validators", &self.validators.len())
            .field("has_cache", &self.cache.is_some())
            .finish()
    }
}
