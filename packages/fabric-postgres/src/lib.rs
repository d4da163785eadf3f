//! PostgreSQL backends for the fabric catalog and state stores.
//!
//! [`PgCatalogStore`] implements `fabric::CatalogStore` over the relational
//! schema in `migrations/0001_catalog.sql`; [`PgStateStore`] persists actor
//! state bytes. Writes that must be atomic (definition + audit row) run in
//! one transaction.
//!
//! ```ignore
//! let pool = PgPoolOptions::new().connect(&database_url).await?;
//! ensure_schema(&pool).await?;
//! let catalog = EventCatalog::new(Arc::new(PgCatalogStore::new(pool.clone())));
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::FromRow;

use fabric::{
    ActorManifest, AuditEntry, CatalogStore, DeliveryPattern, EventCategory, EventConsumer,
    EventDefinition, EventFilter, EventMetric, MetricDirection, PayloadSchema, SchemaVersion,
    StateStore, UsageCounts,
};

/// The catalog DDL, applied by [`ensure_schema`].
pub const SCHEMA_SQL: &str = include_str!("../migrations/0001_catalog.sql");

/// Create the catalog tables and views if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, FromRow)]
struct DefinitionRow {
    name: String,
    category: String,
    description: String,
    payload_schema: Value,
    producer_actor: String,
    version: i32,
    deprecated: bool,
    replaced_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DefinitionRow {
    fn into_model(self) -> anyhow::Result<EventDefinition> {
        Ok(EventDefinition {
            category: self
                .category
                .parse::<EventCategory>()
                .map_err(|e| anyhow::anyhow!(e))?,
            payload_schema: PayloadSchema::from_value(&self.payload_schema)?,
            name: self.name,
            description: self.description,
            producer_actor: self.producer_actor,
            version: self.version,
            deprecated: self.deprecated,
            replaced_by: self.replaced_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConsumerRow {
    event_name: String,
    consumer_actor: String,
    required: bool,
    pattern: String,
    timeout_ms: Option<i64>,
    filter_expression: Option<Value>,
}

fn parse_pattern(raw: &str) -> anyhow::Result<DeliveryPattern> {
    match raw {
        "ask" => Ok(DeliveryPattern::Ask),
        "tell" => Ok(DeliveryPattern::Tell),
        "publish" => Ok(DeliveryPattern::Publish),
        other => anyhow::bail!("unknown delivery pattern: {other}"),
    }
}

fn pattern_str(pattern: DeliveryPattern) -> &'static str {
    match pattern {
        DeliveryPattern::Ask => "ask",
        DeliveryPattern::Tell => "tell",
        DeliveryPattern::Publish => "publish",
    }
}

impl ConsumerRow {
    fn into_model(self) -> anyhow::Result<EventConsumer> {
        Ok(EventConsumer {
            pattern: parse_pattern(&self.pattern)?,
            event_name: self.event_name,
            consumer_actor: self.consumer_actor,
            required: self.required,
            timeout_ms: self.timeout_ms.map(|t| t.max(0) as u64),
            filter: self.filter_expression,
        })
    }
}

#[derive(Debug, FromRow)]
struct SchemaVersionRow {
    event_name: String,
    version: i32,
    payload_schema: Value,
    migration_script: Option<String>,
    breaking_change: bool,
    change_description: String,
    created_at: DateTime<Utc>,
    created_by: String,
}

impl SchemaVersionRow {
    fn into_model(self) -> anyhow::Result<SchemaVersion> {
        Ok(SchemaVersion {
            payload_schema: PayloadSchema::from_value(&self.payload_schema)?,
            event_name: self.event_name,
            version: self.version,
            migration_script: self.migration_script,
            breaking_change: self.breaking_change,
            change_description: self.change_description,
            created_at: self.created_at,
            created_by: self.created_by,
        })
    }
}

#[derive(Debug, FromRow)]
struct ManifestRow {
    actor_name: String,
    description: String,
    version: String,
    produces: Value,
    consumes: Value,
    health_endpoint: Option<String>,
}

impl ManifestRow {
    fn into_model(self) -> anyhow::Result<ActorManifest> {
        Ok(ActorManifest {
            produces: serde_json::from_value(self.produces)?,
            consumes: serde_json::from_value(self.consumes)?,
            actor_name: self.actor_name,
            description: self.description,
            version: self.version,
            health_endpoint: self.health_endpoint,
        })
    }
}

// =============================================================================
// Catalog Store
// =============================================================================

/// Catalog persistence over a [`PgPool`].
#[derive(Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn append_audit_tx(
        tx: &mut sqlx::PgConnection,
        audit: &AuditEntry,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_audit_log (event_name, action, old_value, new_value, changed_by, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&audit.event_name)
        .bind(&audit.action)
        .bind(&audit.old_value)
        .bind(&audit.new_value)
        .bind(&audit.changed_by)
        .bind(audit.changed_at)
        .execute(tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn upsert_definition(
        &self,
        def: &EventDefinition,
        audit: &AuditEntry,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO event_definitions
                (name, category, description, payload_schema, producer_actor, version,
                 deprecated, replaced_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                category = EXCLUDED.category,
                description = EXCLUDED.description,
                payload_schema = EXCLUDED.payload_schema,
                producer_actor = EXCLUDED.producer_actor,
                version = EXCLUDED.version,
                deprecated = EXCLUDED.deprecated,
                replaced_by = EXCLUDED.replaced_by,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&def.name)
        .bind(def.category.as_str())
        .bind(&def.description)
        .bind(serde_json::to_value(&def.payload_schema)?)
        .bind(&def.producer_actor)
        .bind(def.version)
        .bind(def.deprecated)
        .bind(&def.replaced_by)
        .bind(def.created_at)
        .bind(def.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::append_audit_tx(&mut *tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_definition(&self, name: &str) -> anyhow::Result<Option<EventDefinition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            "SELECT * FROM event_definitions WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DefinitionRow::into_model).transpose()
    }

    async fn list_definitions(
        &self,
        filter: &EventFilter,
    ) -> anyhow::Result<Vec<EventDefinition>> {
        let rows = sqlx::query_as::<_, DefinitionRow>(
            r#"
            SELECT * FROM event_definitions
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR producer_actor = $2)
              AND ($3::boolean IS NULL OR deprecated = $3)
            ORDER BY name
            "#,
        )
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.producer.as_deref())
        .bind(filter.deprecated)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DefinitionRow::into_model).collect()
    }

    async fn upsert_consumer(
        &self,
        consumer: &EventConsumer,
        audit: &AuditEntry,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO event_consumers
                (event_name, consumer_actor, required, pattern, timeout_ms, filter_expression)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_name, consumer_actor) DO UPDATE SET
                required = EXCLUDED.required,
                pattern = EXCLUDED.pattern,
                timeout_ms = EXCLUDED.timeout_ms,
                filter_expression = EXCLUDED.filter_expression
            "#,
        )
        .bind(&consumer.event_name)
        .bind(&consumer.consumer_actor)
        .bind(consumer.required)
        .bind(pattern_str(consumer.pattern))
        .bind(consumer.timeout_ms.map(|t| t as i64))
        .bind(&consumer.filter)
        .execute(&mut *tx)
        .await?;
        Self::append_audit_tx(&mut *tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove_consumer(
        &self,
        event_name: &str,
        consumer_actor: &str,
        audit: &AuditEntry,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM event_consumers WHERE event_name = $1 AND consumer_actor = $2")
            .bind(event_name)
            .bind(consumer_actor)
            .execute(&mut *tx)
            .await?;
        Self::append_audit_tx(&mut *tx, audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_consumers(&self, event_name: &str) -> anyhow::Result<Vec<EventConsumer>> {
        let rows = sqlx::query_as::<_, ConsumerRow>(
            "SELECT * FROM event_consumers WHERE event_name = $1 ORDER BY consumer_actor",
        )
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ConsumerRow::into_model).collect()
    }

    async fn all_consumers(&self) -> anyhow::Result<Vec<EventConsumer>> {
        let rows = sqlx::query_as::<_, ConsumerRow>(
            "SELECT * FROM event_consumers ORDER BY event_name, consumer_actor",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ConsumerRow::into_model).collect()
    }

    async fn append_metric(&self, metric: &EventMetric) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_metrics
                (event_name, actor_id, direction, success, duration_ms, error_message,
                 correlation_id, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&metric.event_name)
        .bind(&metric.actor_id)
        .bind(match metric.direction {
            MetricDirection::Produced => "produced",
            MetricDirection::Consumed => "consumed",
        })
        .bind(metric.success)
        .bind(metric.duration_ms)
        .bind(&metric.error_message)
        .bind(metric.correlation_id.map(|c| c.into_inner()))
        .bind(metric.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_schema_version(&self, version: &SchemaVersion) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_schema_versions
                (event_name, version, payload_schema, migration_script, breaking_change,
                 change_description, created_at, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&version.event_name)
        .bind(version.version)
        .bind(serde_json::to_value(&version.payload_schema)?)
        .bind(&version.migration_script)
        .bind(version.breaking_change)
        .bind(&version.change_description)
        .bind(version.created_at)
        .bind(&version.created_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schema_history(&self, event_name: &str) -> anyhow::Result<Vec<SchemaVersion>> {
        let rows = sqlx::query_as::<_, SchemaVersionRow>(
            "SELECT * FROM event_schema_versions WHERE event_name = $1 ORDER BY version",
        )
        .bind(event_name)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SchemaVersionRow::into_model).collect()
    }

    async fn upsert_manifest(&self, manifest: &ActorManifest) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actor_manifests
                (actor_name, description, version, produces, consumes, health_endpoint, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (actor_name) DO UPDATE SET
                description = EXCLUDED.description,
                version = EXCLUDED.version,
                produces = EXCLUDED.produces,
                consumes = EXCLUDED.consumes,
                health_endpoint = EXCLUDED.health_endpoint,
                updated_at = now()
            "#,
        )
        .bind(&manifest.actor_name)
        .bind(&manifest.description)
        .bind(&manifest.version)
        .bind(serde_json::to_value(&manifest.produces)?)
        .bind(serde_json::to_value(&manifest.consumes)?)
        .bind(&manifest.health_endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_manifest(&self, actor_name: &str) -> anyhow::Result<Option<ActorManifest>> {
        let row = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM actor_manifests WHERE actor_name = $1",
        )
        .bind(actor_name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ManifestRow::into_model).transpose()
    }

    async fn usage_counts(
        &self,
        event_name: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<UsageCounts> {
        let (produced, consumed, failures): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE direction = 'produced'),
                COUNT(*) FILTER (WHERE direction = 'consumed'),
                COUNT(*) FILTER (WHERE NOT success)
            FROM event_metrics
            WHERE event_name = $1 AND timestamp >= $2
            "#,
        )
        .bind(event_name)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(UsageCounts {
            produced: produced.max(0) as u64,
            consumed: consumed.max(0) as u64,
            failures: failures.max(0) as u64,
        })
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// State Store
// =============================================================================

/// Actor-state persistence over a [`PgPool`].
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load(&self, actor_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT state FROM actor_states WHERE actor_id = $1")
                .bind(actor_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(bytes,)| bytes))
    }

    async fn save(&self, actor_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actor_states (actor_id, state, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (actor_id) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = now()
            "#,
        )
        .bind(actor_id)
        .bind(bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
