//! # Fabric
//!
//! An actor-based service runtime: independent stateful actors communicate
//! exclusively through typed events routed over a validated, observable,
//! fault-tolerant bus.
//!
//! ## Core Concepts
//!
//! - [`Envelope`] - the one thing that flows: a command, query, or
//!   notification with a JSON payload and correlation metadata.
//! - [`EventCatalog`] - the persistent registry of event definitions, payload
//!   schemas, consumers, schema history, and metrics.
//! - [`EventBus`] - ask / tell / publish delivery over a pluggable
//!   [`Transport`].
//! - [`Actor`] - the uniform runtime around a user-supplied
//!   [`ActorBehavior`]: lifecycle, validation, rate limiting, resilience,
//!   monitoring.
//!
//! ## Architecture
//!
//! ```text
//! Edge (API/worker)
//!     │ handle() / query()
//!     ▼
//! Actor<B> ── validate ──► EventCatalog ──► CatalogStore (postgres/memory)
//!     │                        ▲                  │
//!     │ onCommand (serial)     │ consumers        │ metrics, audit,
//!     ▼                        │                  │ schema history
//! CommandOutcome ── emit() ────┘
//!     │
//!     ▼ per consumer pattern
//! EventBus ── ask ──► actor:<target>:<type> ⇄ event:response:<cid>
//!     │       tell ─► actor:<target>:<type> + pending:<id> (at-least-once)
//!     │       publish ─► broadcast:<type>
//!     ▼
//! Transport (in-memory / NATS)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Envelopes are immutable** - derived envelopes get fresh ids and
//!    inherit the correlation id of their cause.
//! 2. **One actor, one lock** - command handlers run serially; the actor is
//!    its own unit of mutual exclusion over its state.
//! 3. **Validation is structural** - every payload is checked against the
//!    catalog schema before a handler sees it.
//! 4. **Emission is eventual** - event emission failures are logged, never
//!    fatal to the initiating command.
//! 5. **At-least-once is the ceiling** - tell may redeliver; consumers stay
//!    idempotent or use the [`Deduplicator`].
//!
//! ## Example
//!
//! ```ignore
//! use fabric::{Actor, ActorBehavior, Envelope, EventBus, EventCatalog};
//!
//! let transport = Arc::new(InMemoryTransport::new());
//! let bus = EventBus::new(transport);
//! let catalog = Arc::new(EventCatalog::new(Arc::new(InMemoryCatalogStore::new())));
//!
//! let actor = Actor::builder(AuthActor::default())
//!     .with_bus(bus.clone())
//!     .with_catalog(catalog.clone())
//!     .build();
//! actor.initialize().await?;
//! actor.expose().await?;
//!
//! let result = actor
//!     .handle(Envelope::new("SEND_MAGIC_LINK", json!({"email": "u@x"})))
//!     .await;
//! assert!(result.success);
//! ```
//!
//! ## What This Is Not
//!
//! Fabric does not provide exactly-once delivery, multi-master replication,
//! distributed transactions, or causal ordering across independent actors.
//! Sagas are local compensation chains; correlation ids are the only
//! cross-actor thread.

// Core modules
mod actor;
mod breaker;
mod bus;
mod catalog;
mod dedup;
mod envelope;
mod error;
mod limiter;
mod monitor;
mod retry;
mod saga;
mod schema;
mod security;
mod state;
mod store;

// Public-by-path modules
pub mod config;
pub mod transport;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export the actor runtime
pub use actor::{
    Actor, ActorBehavior, ActorBuilder, ActorConfig, ActorContext, BackgroundTask,
    BreakerRegistry, CommandOutcome, HandleResult, HealthStatus, QueryResult,
};

// Re-export resilience primitives
pub use breaker::{BreakerConfig, BreakerState, BreakerStatus, CircuitBreaker};
pub use dedup::{Deduplicator, DEFAULT_DEDUP_CAPACITY};
pub use limiter::{TokenBucket, WindowConfig, WindowLimiter};
pub use retry::RetryPolicy;
pub use saga::{Saga, SagaReport};

// Re-export the bus
pub use bus::{
    handler, BusConfig, DeliveryGuarantee, EventBus, EventHandler, HandlerFuture,
    DEFAULT_ASK_TIMEOUT,
};

// Re-export the catalog
pub use catalog::{
    CatalogConfig, CatalogExportRow, CatalogHealth, ConsumerSpec, DefinitionUpdate,
    DependencyEdge, DependencyGraph, EventCatalog, DEFAULT_CACHE_TTL,
};
pub use store::{
    ActorManifest, AuditEntry, CatalogCache, CatalogStore, DeliveryPattern, EventConsumer,
    EventDefinition, EventFilter, EventMetric, InMemoryCache, InMemoryCatalogStore,
    MetricDirection, SchemaVersion, UsageCounts,
};

// Re-export message types
pub use envelope::{CorrelationId, Envelope, EventCategory, Metadata};

// Re-export errors
pub use error::{ErrorCode, ErrorTransformer, FabricError, SECURITY_KEYWORDS};

// Re-export schema validation
pub use schema::{
    CompiledSchema, FieldError, PayloadSchema, SchemaError, SchemaType, ValidationMode,
    ValidationOutcome,
};

// Re-export state persistence
pub use state::{conversion_hints, InMemoryStateStore, KeyedMap, StateStore, TaggedSet};

// Re-export monitoring and security capabilities
pub use monitor::{Histogram, HistogramSnapshot, MetricsRegistry, MetricsSnapshot, Timer};
pub use security::{
    AnomalyConfig, SecurityEvent, SecurityMonitor, SecurityWebhook, Severity,
    DEFAULT_BUFFER_CAPACITY,
};

// Re-export runtime config
pub use config::RuntimeConfig;

// Re-export transport essentials at the crate root
pub use transport::{InMemoryTransport, Subscription, Transport};

// Re-export commonly used external types
pub use async_trait::async_trait;
