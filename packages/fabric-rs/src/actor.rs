//! Actor runtime - the uniform envelope around every actor.
//!
//! An actor plugs a [`ActorBehavior`] (state type, handlers, hooks, manifest)
//! into an [`Actor`], which supplies everything else: ordered initialization,
//! validated serial dispatch, rate limiting, emission fan-out per consumer
//! pattern, state persistence behind a circuit breaker, error transformation,
//! health checks, metrics, and a bounded security buffer.
//!
//! # Dispatch
//!
//! Commands run serially: the state lock is held across `on_command` and
//! released before bus I/O (event emission, state save). Queries take a state
//! snapshot and never write. Background tasks synchronize on the same lock.
//!
//! # Capabilities
//!
//! Monitoring, security, the bus, the catalog, and the breaker registry are
//! explicit handles composed into an [`ActorContext`] - no globals.
//!
//! # Example
//!
//! ```ignore
//! struct AuthActor;
//!
//! #[async_trait]
//! impl ActorBehavior for AuthActor {
//!     type State = AuthState;
//!
//!     fn manifest(&self) -> ActorManifest {
//!         ActorManifest::new("auth", "1.0.0")
//!             .consumes("SEND_MAGIC_LINK")
//!             .produces("MAGIC_LINK_SENT")
//!     }
//!
//!     fn create_default_state(&self) -> AuthState { AuthState::default() }
//!
//!     async fn on_command(
//!         &self,
//!         state: &mut AuthState,
//!         command: &Envelope,
//!         _ctx: &ActorContext,
//!     ) -> anyhow::Result<CommandOutcome> {
//!         match command.event_type.as_str() {
//!             "SEND_MAGIC_LINK" => {
//!                 state.links_sent += 1;
//!                 Ok(CommandOutcome::ok()
//!                     .with_event(command.derive("MAGIC_LINK_SENT", command.payload.clone())))
//!             }
//!             other => Err(FabricError::new(ErrorCode::UnknownCommand, format!("No handler for {other}")).into()),
//!         }
//!     }
//!     // on_query, hooks...
//! }
//!
//! let actor = Actor::builder(AuthActor)
//!     .with_bus(bus)
//!     .with_catalog(catalog)
//!     .build();
//! actor.initialize().await?;
//! let result = actor.handle(Envelope::new("SEND_MAGIC_LINK", json!({"email": "u@x"}))).await;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::breaker::{BreakerConfig, BreakerState, BreakerStatus, CircuitBreaker};
use crate::bus::EventBus;
use crate::catalog::EventCatalog;
use crate::config::{validate_actor_config, RuntimeConfig};
use crate::envelope::{CorrelationId, Envelope, EventCategory};
use crate::error::{ErrorCode, ErrorTransformer, FabricError};
use crate::limiter::{WindowConfig, WindowLimiter};
use crate::monitor::{MetricsRegistry, MetricsSnapshot, Timer};
use crate::schema::{CompiledSchema, PayloadSchema, ValidationMode};
use crate::security::{SecurityEvent, SecurityMonitor, Severity};
use crate::state::{conversion_hints, InMemoryStateStore, StateStore};
use crate::store::{
    ActorManifest, DeliveryPattern, EventDefinition, EventMetric, MetricDirection,
};

// =============================================================================
// Behavior Trait
// =============================================================================

/// Recurring work an actor declares; the runtime schedules it.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub name: String,
    pub interval: Duration,
}

/// What a command handler hands back: optional data plus emitted events.
#[derive(Debug, Clone, Default)]
pub struct CommandOutcome {
    pub data: Option<Value>,
    pub events: Vec<Envelope>,
}

impl CommandOutcome {
    /// Success with no data and no events.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Queue an event for emission after the handler returns.
    pub fn with_event(mut self, event: Envelope) -> Self {
        self.events.push(event);
        self
    }
}

/// The pluggable half of an actor.
#[async_trait]
pub trait ActorBehavior: Send + Sync + 'static {
    /// Private actor state; owned by one instance, persisted as JSON.
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// The actor's declaration of produced and consumed events.
    fn manifest(&self) -> ActorManifest;

    /// Fresh state for a first run.
    fn create_default_state(&self) -> Self::State;

    /// Structural schema for persisted state, checked on load.
    fn state_schema(&self) -> Option<PayloadSchema> {
        None
    }

    /// Schema for the actor's declared configuration.
    fn config_schema(&self) -> Option<PayloadSchema> {
        None
    }

    /// The actor's declared configuration.
    fn config(&self) -> Value {
        json!({})
    }

    /// Event definitions to register with the catalog on initialize. Also
    /// used as local validation fallback when the catalog is absent.
    fn event_definitions(&self) -> Vec<EventDefinition> {
        Vec::new()
    }

    /// Recurring work the runtime should schedule.
    fn background_tasks(&self) -> Vec<BackgroundTask> {
        Vec::new()
    }

    async fn on_initialize(&self, _ctx: &ActorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle one command. The state lock is held for the duration.
    async fn on_command(
        &self,
        state: &mut Self::State,
        command: &Envelope,
        ctx: &ActorContext,
    ) -> anyhow::Result<CommandOutcome>;

    /// Answer one query against a state snapshot.
    async fn on_query(
        &self,
        state: &Self::State,
        query: &Envelope,
        ctx: &ActorContext,
    ) -> anyhow::Result<Value>;

    /// Consume one notification (fan-in from other actors).
    async fn on_notification(
        &self,
        _state: &mut Self::State,
        _notification: &Envelope,
        _ctx: &ActorContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// One tick of a declared background task. Runs under the state lock.
    async fn on_background_task(
        &self,
        _name: &str,
        _state: &mut Self::State,
        _ctx: &ActorContext,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    // Lifecycle hooks. All default to no-ops.

    async fn before_state_load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_state_load(&self, _state: &Self::State) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_command(&self, _command: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_command(
        &self,
        _command: &Envelope,
        _outcome: &CommandOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn before_query(&self, _query: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_query(&self, _query: &Envelope, _result: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe a transformed error before it surfaces.
    async fn on_error(&self, _error: &FabricError) {}

    /// Custom health probe folded into [`Actor::get_health_status`].
    async fn on_health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_shutdown(&self, _state: &Self::State) -> anyhow::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Capabilities & Context
// =============================================================================

/// Get-or-create registry of named circuit breakers.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// The breaker for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_config(name, self.config.clone()))
            })
            .clone()
    }

    /// Status of every breaker.
    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().status()))
            .collect()
    }

    /// The name of an open breaker, if any.
    pub fn any_open(&self) -> Option<String> {
        self.breakers
            .iter()
            .find(|e| e.value().status().state == BreakerState::Open)
            .map(|e| e.key().clone())
    }
}

struct Capabilities {
    bus: EventBus,
    catalog: Option<Arc<EventCatalog>>,
    metrics: Arc<MetricsRegistry>,
    security: Arc<SecurityMonitor>,
    breakers: Arc<BreakerRegistry>,
    default_ask_timeout: Duration,
}

/// Handles an actor's handlers can reach: the bus (breaker-guarded asks),
/// the catalog, metrics, and the security buffer.
#[derive(Clone)]
pub struct ActorContext {
    pub actor_name: String,
    pub actor_id: String,
    caps: Arc<Capabilities>,
}

impl ActorContext {
    /// Ask another actor, guarded by the `ask:<target>` circuit breaker.
    ///
    /// While the breaker is open the call fails `CIRCUIT_OPEN` immediately,
    /// without touching the bus.
    pub async fn ask(
        &self,
        target: &str,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope, FabricError> {
        let breaker = self.caps.breakers.get(&format!("ask:{target}"));
        let bus = self.caps.bus.clone();
        let deadline = timeout.unwrap_or(self.caps.default_ask_timeout);
        let target_owned = target.to_string();
        breaker
            .execute(async move {
                bus.ask(&target_owned, envelope, Some(deadline))
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await
            .map_err(|e| match e.downcast::<FabricError>() {
                Ok(fe) => fe,
                Err(raw) => FabricError::new(ErrorCode::UnknownError, "Ask failed")
                    .with_field("detail", json!(raw.to_string())),
            })
    }

    /// Fire-and-forget to another actor.
    pub async fn tell(&self, target: &str, envelope: Envelope) -> Result<(), FabricError> {
        self.caps.bus.tell(target, envelope).await
    }

    /// Broadcast a notification.
    pub async fn publish(&self, envelope: Envelope) -> Result<(), FabricError> {
        self.caps.bus.publish(envelope).await
    }

    /// The catalog, when attached.
    pub fn catalog(&self) -> Option<&Arc<EventCatalog>> {
        self.caps.catalog.as_ref()
    }

    /// This actor's metric registry.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.caps.metrics
    }

    /// Record a security incident.
    pub fn record_security(&self, event: SecurityEvent) {
        self.caps.security.record(
            event.with_actor(self.actor_name.clone(), self.actor_id.clone()),
        );
    }
}

// =============================================================================
// Actor Config & Builder
// =============================================================================

/// Runtime tunables for one actor instance.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Instance id; defaults to the manifest name.
    pub actor_id: Option<String>,
    pub health_check_interval: Duration,
    pub validation_mode: ValidationMode,
    pub breaker: BreakerConfig,
    /// Deadline for ask-pattern consumers without an explicit `timeout_ms`.
    pub default_ask_timeout: Duration,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            actor_id: None,
            health_check_interval: Duration::from_secs(60),
            validation_mode: ValidationMode::Loose,
            breaker: BreakerConfig::default(),
            default_ask_timeout: Duration::from_secs(30),
        }
    }
}

type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// Assembles an [`Actor`] from a behavior plus capability handles.
pub struct ActorBuilder<B: ActorBehavior> {
    behavior: B,
    bus: Option<EventBus>,
    catalog: Option<Arc<EventCatalog>>,
    state_store: Option<Arc<dyn StateStore>>,
    runtime_config: RuntimeConfig,
    actor_config: ActorConfig,
    limiters: Vec<(String, WindowConfig, KeyFn)>,
    error_patterns: Vec<(String, ErrorCode, String)>,
}

impl<B: ActorBehavior> ActorBuilder<B> {
    pub fn new(behavior: B) -> Self {
        Self {
            behavior,
            bus: None,
            catalog: None,
            state_store: None,
            runtime_config: RuntimeConfig::default(),
            actor_config: ActorConfig::default(),
            limiters: Vec::new(),
            error_patterns: Vec::new(),
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<EventCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    pub fn with_actor_config(mut self, config: ActorConfig) -> Self {
        self.actor_config = config;
        self
    }

    /// Rate-limit one command type, keying the window by `key_fn(payload)`.
    pub fn with_rate_limit<F>(
        mut self,
        command_type: impl Into<String>,
        window: WindowConfig,
        key_fn: F,
    ) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        self.limiters
            .push((command_type.into(), window, Arc::new(key_fn)));
        self
    }

    /// Add an error-transformer pattern ahead of the defaults.
    pub fn with_error_pattern(
        mut self,
        pattern: impl Into<String>,
        code: ErrorCode,
        user_message: impl Into<String>,
    ) -> Self {
        self.error_patterns
            .push((pattern.into(), code, user_message.into()));
        self
    }

    pub fn build(self) -> Arc<Actor<B>> {
        let manifest = self.behavior.manifest();
        let name = manifest.actor_name.clone();
        let id = self
            .actor_config
            .actor_id
            .clone()
            .unwrap_or_else(|| name.clone());

        let bus = self.bus.unwrap_or_else(|| {
            EventBus::new(Arc::new(crate::transport::InMemoryTransport::new()))
        });

        let mut transformer = ErrorTransformer::new();
        for (pattern, code, message) in self.error_patterns {
            transformer.register(pattern, code, message);
        }
        for (pattern, code, message) in [
            (
                "connection refused",
                ErrorCode::DbConnectionFailed,
                "A backing service is unavailable",
            ),
            ("validation", ErrorCode::ValidationError, "Invalid input"),
            ("not found", ErrorCode::NotFound, "Resource not found"),
        ] {
            transformer.register(pattern, code, message);
        }

        let caps = Arc::new(Capabilities {
            bus,
            catalog: self.catalog,
            metrics: Arc::new(MetricsRegistry::new()),
            security: Arc::new(SecurityMonitor::new()),
            breakers: Arc::new(BreakerRegistry::new(self.actor_config.breaker.clone())),
            default_ask_timeout: self.actor_config.default_ask_timeout,
        });

        let limiters = DashMap::new();
        for (command_type, window, key_fn) in self.limiters {
            limiters.insert(command_type, (Arc::new(WindowLimiter::new(window)), key_fn));
        }

        Arc::new(Actor {
            behavior: Arc::new(self.behavior),
            manifest,
            name,
            id,
            caps,
            state_store: self
                .state_store
                .unwrap_or_else(|| Arc::new(InMemoryStateStore::new())),
            state: tokio::sync::Mutex::new(None),
            limiters,
            transformer,
            runtime_config: self.runtime_config,
            config: self.actor_config,
            local_validators: DashMap::new(),
            initialized: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }
}

// =============================================================================
// Actor Runtime
// =============================================================================

/// Outcome of [`Actor::handle`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Envelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FabricError>,
}

impl HandleResult {
    fn failure(error: FabricError) -> Self {
        Self {
            success: false,
            data: None,
            events: Vec::new(),
            error: Some(error),
        }
    }
}

/// Outcome of [`Actor::query`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FabricError>,
}

/// Aggregate health report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub actor: String,
    pub healthy: bool,
    pub state_loaded: bool,
    pub custom_ok: bool,
    pub breakers: BTreeMap<String, BreakerStatus>,
}

/// A behavior wrapped in the uniform runtime.
pub struct Actor<B: ActorBehavior> {
    behavior: Arc<B>,
    manifest: ActorManifest,
    name: String,
    id: String,
    caps: Arc<Capabilities>,
    state_store: Arc<dyn StateStore>,
    /// The actor's unit of mutual exclusion. Held across `on_command`.
    state: tokio::sync::Mutex<Option<B::State>>,
    limiters: DashMap<String, (Arc<WindowLimiter>, KeyFn)>,
    transformer: ErrorTransformer,
    runtime_config: RuntimeConfig,
    config: ActorConfig,
    /// Fallback validators compiled from the behavior's event definitions.
    local_validators: DashMap<String, Arc<CompiledSchema>>,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<B: ActorBehavior> Actor<B> {
    pub fn builder(behavior: B) -> ActorBuilder<B> {
        ActorBuilder::new(behavior)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The context handed to handlers.
    pub fn context(&self) -> ActorContext {
        ActorContext {
            actor_name: self.name.clone(),
            actor_id: self.id.clone(),
            caps: self.caps.clone(),
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Bring the actor up. Ordered steps:
    ///
    /// 1. validate declared config (`CONFIG_VALIDATION_FAILED`)
    /// 2. `before_state_load`
    /// 3. load + validate persisted state (`STATE_VALIDATION_FAILED`), or
    /// 4. `create_default_state`
    /// 5. `after_state_load`
    /// 6. init monitoring; register manifest + definitions with the catalog
    /// 7. `on_initialize`
    /// 8. schedule health checks and declared background tasks
    pub async fn initialize(self: &Arc<Self>) -> Result<(), FabricError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(schema) = self.behavior.config_schema() {
            validate_actor_config(
                &self.name,
                &self.behavior.config(),
                &schema,
                self.config.validation_mode,
            )?;
        }

        self.behavior
            .before_state_load()
            .await
            .map_err(|e| self.transformer.transform(&e, &self.name))?;

        let state = match self.state_store.load(&self.id).await {
            Ok(Some(bytes)) => self.restore_state(&bytes)?,
            Ok(None) => self.behavior.create_default_state(),
            Err(e) => {
                // Store outage on boot degrades to default state.
                tracing::warn!(actor = %self.name, error = %e, "state load failed, using defaults");
                self.behavior.create_default_state()
            }
        };

        self.behavior
            .after_state_load(&state)
            .await
            .map_err(|e| self.transformer.transform(&e, &self.name))?;
        *self.state.lock().await = Some(state);

        self.caps.metrics.set_gauge("actor_up", 1);
        for def in self.behavior.event_definitions() {
            if let Ok(compiled) =
                CompiledSchema::compile(&def.payload_schema, self.config.validation_mode)
            {
                self.local_validators
                    .insert(def.name.clone(), Arc::new(compiled));
            }
        }
        if let Some(catalog) = &self.caps.catalog {
            if let Err(e) = catalog.register_actor(self.manifest.clone()).await {
                tracing::warn!(actor = %self.name, error = %e, "manifest registration failed");
            }
            for def in self.behavior.event_definitions() {
                if let Err(e) = catalog.register(def).await {
                    tracing::warn!(actor = %self.name, error = %e, "definition registration failed");
                }
            }
        }

        let ctx = self.context();
        self.behavior
            .on_initialize(&ctx)
            .await
            .map_err(|e| self.transformer.transform(&e, &self.name))?;

        self.spawn_health_loop();
        self.spawn_background_tasks();
        Ok(())
    }

    fn restore_state(&self, bytes: &[u8]) -> Result<B::State, FabricError> {
        let raw: Value = serde_json::from_slice(bytes).map_err(|e| {
            FabricError::new(ErrorCode::StateValidationFailed, "Persisted state is not valid JSON")
                .with_field("actor", json!(self.name))
                .with_field("detail", json!(e.to_string()))
        })?;

        if let Some(schema) = self.behavior.state_schema() {
            if let Ok(compiled) = CompiledSchema::compile(&schema, self.config.validation_mode) {
                let outcome = compiled.validate(&raw);
                if !outcome.valid {
                    let hints = conversion_hints(&outcome.errors, &raw);
                    return Err(FabricError::new(
                        ErrorCode::StateValidationFailed,
                        "Persisted state does not match its schema",
                    )
                    .with_field("actor", json!(self.name))
                    .with_field("errors", json!(outcome.errors))
                    .with_field("suggestions", json!(hints)));
                }
            }
        }

        serde_json::from_value(raw).map_err(|e| {
            FabricError::new(ErrorCode::StateValidationFailed, "Persisted state failed to decode")
                .with_field("actor", json!(self.name))
                .with_field("detail", json!(e.to_string()))
        })
    }

    fn spawn_health_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick is uninteresting
            loop {
                ticker.tick().await;
                let Some(actor) = weak.upgrade() else { return };
                if actor.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                let status = actor.get_health_status().await;
                actor
                    .caps
                    .metrics
                    .set_gauge("healthy", i64::from(status.healthy));
                if !status.healthy {
                    tracing::warn!(actor = %actor.name, "health check failed");
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        for task in self.behavior.background_tasks() {
            let weak = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(task.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(actor) = weak.upgrade() else { return };
                    if actor.shutting_down.load(Ordering::Acquire) {
                        return;
                    }
                    actor.run_background_tick(&task.name).await;
                }
            });
            self.tasks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(handle);
        }
    }

    async fn run_background_tick(&self, name: &str) {
        let ctx = self.context();
        let bytes = {
            let mut guard = self.state.lock().await;
            let Some(state) = guard.as_mut() else { return };
            if let Err(e) = self.behavior.on_background_task(name, state, &ctx).await {
                tracing::warn!(actor = %self.name, task = name, error = %e, "background task failed");
                return;
            }
            serde_json::to_vec(state).ok()
        };
        if let Some(bytes) = bytes {
            self.persist_bytes(bytes).await;
        }
    }

    // =========================================================================
    // Command Dispatch
    // =========================================================================

    /// Handle one command end to end.
    pub async fn handle(&self, mut command: Envelope) -> HandleResult {
        let timer = Timer::start();
        if self.shutting_down.load(Ordering::Acquire) {
            return HandleResult::failure(FabricError::new(
                ErrorCode::ShuttingDown,
                "Actor is shutting down",
            ));
        }
        if command.correlation_id.is_none() {
            command.correlation_id = Some(CorrelationId::new());
        }

        match self.dispatch_command(&command).await {
            Ok(outcome) => {
                let duration = timer.elapsed_ms();
                self.caps.metrics.increment("commands_processed", 1);
                self.caps.metrics.observe("command_duration_ms", duration);
                self.record_catalog_metric(&command, MetricDirection::Consumed, true, duration, None)
                    .await;
                HandleResult {
                    success: true,
                    data: outcome.data,
                    events: outcome.events,
                    error: None,
                }
            }
            Err(raw) => {
                let error = self.transformer.transform(&raw, &self.name);
                self.note_failure(&command, &raw, &error, timer.elapsed_ms(), "commands_failed")
                    .await;
                HandleResult::failure(error)
            }
        }
    }

    async fn dispatch_command(&self, command: &Envelope) -> anyhow::Result<CommandOutcome> {
        self.behavior.before_command(command).await?;
        self.validate_inbound(command, ErrorCode::CommandValidationFailed)
            .await?;

        if let Some(entry) = self.limiters.get(&command.event_type) {
            let (limiter, key_fn) = entry.value();
            let key = key_fn(&command.payload);
            if !limiter.allow(&key) {
                self.caps.metrics.increment("rate_limited", 1);
                return Err(FabricError::rate_limited()
                    .with_field("commandType", json!(command.event_type))
                    .into());
            }
        }

        let ctx = self.context();
        let (outcome, bytes) = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or_else(|| {
                FabricError::new(ErrorCode::UnknownError, "Actor is not initialized")
            })?;
            let outcome = self.behavior.on_command(state, command, &ctx).await?;
            self.behavior.after_command(command, &outcome).await?;
            let bytes = serde_json::to_vec(state)?;
            (outcome, bytes)
        };

        // Emission failures are logged, never fatal to the command; the
        // contract downstream is eventual consistency.
        for event in &outcome.events {
            if let Err(e) = self.emit(event.clone()).await {
                tracing::warn!(
                    actor = %self.name,
                    event = %event.event_type,
                    error = %e,
                    "event emission failed"
                );
                self.caps.metrics.increment("emit_failures", 1);
            }
        }

        self.persist_bytes(bytes).await;
        Ok(outcome)
    }

    /// Validate an inbound payload, preferring the catalog over the local
    /// schema compiled from the behavior's definitions.
    async fn validate_inbound(
        &self,
        envelope: &Envelope,
        failure_code: ErrorCode,
    ) -> Result<(), FabricError> {
        let outcome = if let Some(catalog) = &self.caps.catalog {
            if catalog.get_definition(&envelope.event_type).await.is_some() {
                Some(catalog.validate_payload(&envelope.event_type, &envelope.payload).await)
            } else {
                self.validate_local(envelope)
            }
        } else {
            self.validate_local(envelope)
        };

        match outcome {
            None => Ok(()),
            Some(outcome) if outcome.valid => Ok(()),
            Some(outcome) => {
                let example = self
                    .local_example(&envelope.event_type)
                    .map(|v| serde_json::to_string_pretty(&v).unwrap_or_default());
                let mut err = FabricError::new(failure_code, "Payload validation failed")
                    .with_field("eventType", json!(envelope.event_type))
                    .with_field("errors", json!(outcome.errors));
                if let Some(example) = example {
                    err = err.with_field("example", json!(format!("```json\n{example}\n```")));
                }
                Err(err)
            }
        }
    }

    fn validate_local(&self, envelope: &Envelope) -> Option<crate::schema::ValidationOutcome> {
        self.local_validators
            .get(&envelope.event_type)
            .map(|compiled| compiled.validate(&envelope.payload))
    }

    fn local_example(&self, event_type: &str) -> Option<Value> {
        let defs = self.behavior.event_definitions();
        defs.iter()
            .find(|d| d.name == event_type)
            .map(|d| example_payload(&d.payload_schema))
    }

    async fn note_failure(
        &self,
        envelope: &Envelope,
        raw: &anyhow::Error,
        error: &FabricError,
        duration_ms: f64,
        counter: &str,
    ) {
        self.caps.metrics.increment(counter, 1);
        if ErrorTransformer::is_security_flavored(raw) {
            self.caps.security.record(
                SecurityEvent::new(
                    "command_security_error",
                    Severity::High,
                    json!({
                        "eventType": envelope.event_type,
                        "code": error.code,
                    }),
                )
                .with_actor(self.name.clone(), self.id.clone()),
            );
        }
        self.behavior.on_error(error).await;
        self.record_catalog_metric(
            envelope,
            MetricDirection::Consumed,
            false,
            duration_ms,
            Some(error.user_message.clone()),
        )
        .await;
    }

    async fn record_catalog_metric(
        &self,
        envelope: &Envelope,
        direction: MetricDirection,
        success: bool,
        duration_ms: f64,
        error_message: Option<String>,
    ) {
        if let Some(catalog) = &self.caps.catalog {
            catalog
                .record_metric(EventMetric {
                    event_name: envelope.event_type.clone(),
                    actor_id: self.id.clone(),
                    direction,
                    success,
                    duration_ms,
                    error_message,
                    correlation_id: envelope.correlation_id,
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    async fn persist_bytes(&self, bytes: Vec<u8>) {
        let breaker = self.caps.breakers.get("state_save");
        let store = self.state_store.clone();
        let id = self.id.clone();
        let result = breaker
            .execute(async move { store.save(&id, &bytes).await })
            .await;
        if let Err(e) = result {
            // Degraded persistence is a warning, not a command failure.
            tracing::warn!(actor = %self.name, error = %e, "state save failed");
            self.caps.metrics.increment("state_save_failures", 1);
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit one event: revalidate, look up consumers, dispatch per pattern.
    pub async fn emit(&self, event: Envelope) -> Result<(), FabricError> {
        let timer = Timer::start();
        if let Some(catalog) = &self.caps.catalog {
            if catalog.get_definition(&event.event_type).await.is_some() {
                let outcome = catalog
                    .validate_payload(&event.event_type, &event.payload)
                    .await;
                if !outcome.valid {
                    self.record_catalog_metric(
                        &event,
                        MetricDirection::Produced,
                        false,
                        timer.elapsed_ms(),
                        Some("emitted payload failed validation".into()),
                    )
                    .await;
                    return Err(FabricError::new(
                        ErrorCode::ValidationError,
                        "Emitted payload failed validation",
                    )
                    .with_field("eventType", json!(event.event_type))
                    .with_field("errors", json!(outcome.errors)));
                }
            }
        }

        let consumers = match &self.caps.catalog {
            Some(catalog) => catalog.get_consumers(&event.event_type).await,
            None => Vec::new(),
        };

        if consumers.is_empty() {
            // No routing table: broadcast and let subscribers decide.
            self.caps.bus.publish(event.clone()).await?;
        } else {
            let mut published = false;
            for consumer in &consumers {
                if !consumer.matches(&event.payload) {
                    continue;
                }
                let result = match consumer.pattern {
                    DeliveryPattern::Tell => {
                        self.caps.bus.tell(&consumer.consumer_actor, event.clone()).await
                    }
                    DeliveryPattern::Publish => {
                        if published {
                            Ok(())
                        } else {
                            published = true;
                            self.caps.bus.publish(event.clone()).await
                        }
                    }
                    DeliveryPattern::Ask => {
                        let timeout = consumer.timeout_ms.map(Duration::from_millis);
                        self.context()
                            .ask(&consumer.consumer_actor, event.clone(), timeout)
                            .await
                            .map(|_| ())
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(
                        actor = %self.name,
                        event = %event.event_type,
                        consumer = %consumer.consumer_actor,
                        required = consumer.required,
                        error = %e,
                        "consumer dispatch failed"
                    );
                    if consumer.required {
                        self.caps.metrics.increment("required_consumer_failures", 1);
                    }
                }
            }
        }

        self.caps.metrics.increment("events_emitted", 1);
        self.record_catalog_metric(
            &event,
            MetricDirection::Produced,
            true,
            timer.elapsed_ms(),
            None,
        )
        .await;
        Ok(())
    }

    /// Broadcast a notification produced outside command flow.
    pub async fn publish(&self, notification: Envelope) -> Result<(), FabricError> {
        self.emit(notification).await
    }

    // =========================================================================
    // Query Dispatch
    // =========================================================================

    /// Answer one query against a snapshot of the state. No emission, no
    /// state save, no rate limiting.
    pub async fn query(&self, mut query: Envelope) -> QueryResult {
        let timer = Timer::start();
        if self.shutting_down.load(Ordering::Acquire) {
            return QueryResult {
                success: false,
                data: None,
                error: Some(FabricError::new(
                    ErrorCode::ShuttingDown,
                    "Actor is shutting down",
                )),
            };
        }
        if query.correlation_id.is_none() {
            query.correlation_id = Some(CorrelationId::new());
        }

        match self.dispatch_query(&query).await {
            Ok(data) => {
                let duration = timer.elapsed_ms();
                self.caps.metrics.increment("queries_processed", 1);
                self.caps.metrics.observe("query_duration_ms", duration);
                self.record_catalog_metric(&query, MetricDirection::Consumed, true, duration, None)
                    .await;
                QueryResult {
                    success: true,
                    data: Some(data),
                    error: None,
                }
            }
            Err(raw) => {
                let error = self.transformer.transform(&raw, &self.name);
                self.note_failure(&query, &raw, &error, timer.elapsed_ms(), "queries_failed")
                    .await;
                QueryResult {
                    success: false,
                    data: None,
                    error: Some(error),
                }
            }
        }
    }

    async fn dispatch_query(&self, query: &Envelope) -> anyhow::Result<Value> {
        self.behavior.before_query(query).await?;
        self.validate_inbound(query, ErrorCode::ValidationError).await?;

        let snapshot = {
            let guard = self.state.lock().await;
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| FabricError::new(ErrorCode::UnknownError, "Actor is not initialized"))?
        };

        let ctx = self.context();
        let result = self.behavior.on_query(&snapshot, query, &ctx).await?;
        self.behavior.after_query(query, &result).await?;
        Ok(result)
    }

    // =========================================================================
    // Notifications & Bus Wiring
    // =========================================================================

    /// Consume one notification under the state lock, persisting after.
    pub async fn notify(&self, notification: Envelope) -> Result<(), FabricError> {
        let ctx = self.context();
        let bytes = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or_else(|| {
                FabricError::new(ErrorCode::UnknownError, "Actor is not initialized")
            })?;
            self.behavior
                .on_notification(state, &notification, &ctx)
                .await
                .map_err(|e| self.transformer.transform(&e, &self.name))?;
            serde_json::to_vec(state).ok()
        };
        if let Some(bytes) = bytes {
            self.persist_bytes(bytes).await;
        }
        Ok(())
    }

    /// Wire this actor to the bus: every consumed event type in the manifest
    /// gets an inbound handler, routed by category (command / query /
    /// notification). Ask callers receive a `<TYPE>_RESULT` reply either way.
    pub async fn expose(self: &Arc<Self>) -> Result<(), FabricError> {
        for event_type in self.manifest.consumes.clone() {
            let weak = Arc::downgrade(self);
            let event_type_owned = event_type.clone();
            self.caps
                .bus
                .on(&self.name, &event_type, move |envelope: Envelope| {
                    let weak = weak.clone();
                    let event_type = event_type_owned.clone();
                    async move {
                        let Some(actor) = weak.upgrade() else {
                            return Ok(None);
                        };
                        let category = match &actor.caps.catalog {
                            Some(catalog) => catalog.category_of(&event_type).await,
                            None => EventCategory::infer(&event_type),
                        };
                        let reply_type = format!("{event_type}_RESULT");
                        match category {
                            EventCategory::Command => {
                                let result = actor.handle(envelope.clone()).await;
                                Ok(Some(envelope.derive(reply_type, json!(result))))
                            }
                            EventCategory::Query => {
                                let result = actor.query(envelope.clone()).await;
                                Ok(Some(envelope.derive(reply_type, json!(result))))
                            }
                            EventCategory::Notification => {
                                actor.notify(envelope).await?;
                                Ok(None)
                            }
                        }
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Subscribe a raw handler for directed envelopes of one type.
    pub async fn on<F, Fut>(&self, event_type: &str, f: F) -> Result<(), FabricError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<Envelope>>> + Send + 'static,
    {
        self.caps.bus.on(&self.name, event_type, f).await
    }

    // =========================================================================
    // Health, Metrics, Shutdown
    // =========================================================================

    /// Aggregate health: state present, breakers not open, custom probe.
    pub async fn get_health_status(&self) -> HealthStatus {
        let state_loaded = self.state.lock().await.is_some();
        let custom_ok = self.behavior.on_health_check().await.is_ok();
        let breakers = self.caps.breakers.statuses();
        let healthy = state_loaded
            && custom_ok
            && self.caps.breakers.any_open().is_none()
            && !self.shutting_down.load(Ordering::Acquire);
        HealthStatus {
            actor: self.name.clone(),
            healthy,
            state_loaded,
            custom_ok,
            breakers,
        }
    }

    /// Snapshot of this actor's metric registry.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.caps.metrics.snapshot()
    }

    /// Buffered security events (testing and export surface).
    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.caps.security.events()
    }

    /// Stop the actor: background tasks end, `on_shutdown` runs, final state
    /// is persisted, exports honor the runtime flags.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }

        let bytes = {
            let guard = self.state.lock().await;
            if let Some(state) = guard.as_ref() {
                if let Err(e) = self.behavior.on_shutdown(state).await {
                    tracing::warn!(actor = %self.name, error = %e, "on_shutdown hook failed");
                }
                serde_json::to_vec(state).ok()
            } else {
                None
            }
        };
        if let Some(bytes) = bytes {
            self.persist_bytes(bytes).await;
        }

        if self.runtime_config.export_metrics_on_shutdown {
            self.caps.metrics.export();
        }
        if self.runtime_config.export_security_events_on_shutdown {
            let events = self.caps.security.drain();
            if let Some(webhook) = self.runtime_config.security_webhook() {
                webhook.export(&events).await;
            } else if !events.is_empty() {
                tracing::info!(actor = %self.name, count = events.len(), "security events at shutdown");
            }
        }
        self.caps.metrics.set_gauge("actor_up", 0);
    }
}

/// Minimal payload satisfying a schema's shape, for validation-error help.
fn example_payload(schema: &PayloadSchema) -> Value {
    if let Some(values) = &schema.enum_values {
        if let Some(first) = values.first() {
            return first.clone();
        }
    }
    match schema.schema_type {
        Some(crate::schema::SchemaType::String) => json!("string"),
        Some(crate::schema::SchemaType::Number) => json!(schema.minimum.unwrap_or(0.0)),
        Some(crate::schema::SchemaType::Integer) => {
            json!(schema.minimum.unwrap_or(0.0) as i64)
        }
        Some(crate::schema::SchemaType::Boolean) => json!(false),
        Some(crate::schema::SchemaType::Array) => match &schema.items {
            Some(items) => json!([example_payload(items)]),
            None => json!([]),
        },
        Some(crate::schema::SchemaType::Null) => Value::Null,
        Some(crate::schema::SchemaType::Object) | None => {
            let mut obj = serde_json::Map::new();
            if let Some(properties) = &schema.properties {
                for (name, sub) in properties {
                    obj.insert(name.clone(), example_payload(sub));
                }
            }
            Value::Object(obj)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCatalogStore;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct CounterState {
        count: i64,
    }

    struct CounterActor {
        init_calls: Arc<AtomicUsize>,
    }

    impl CounterActor {
        fn new() -> Self {
            Self {
                init_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ActorBehavior for CounterActor {
        type State = CounterState;

        fn manifest(&self) -> ActorManifest {
            ActorManifest::new("counter", "1.0.0")
                .consumes("INCREMENT_COUNTER")
                .consumes("GET_COUNT")
                .produces("COUNTER_INCREMENTED")
        }

        fn create_default_state(&self) -> CounterState {
            CounterState::default()
        }

        fn event_definitions(&self) -> Vec<EventDefinition> {
            vec![EventDefinition::new(
                "INCREMENT_COUNTER",
                EventCategory::Command,
                "counter",
                PayloadSchema::from_value(&json!({
                    "type": "object",
                    "properties": {"by": {"type": "integer", "minimum": 1}},
                    "required": ["by"]
                }))
                .unwrap(),
            )]
        }

        async fn on_initialize(&self, _ctx: &ActorContext) -> anyhow::Result<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_command(
            &self,
            state: &mut CounterState,
            command: &Envelope,
            _ctx: &ActorContext,
        ) -> anyhow::Result<CommandOutcome> {
            match command.event_type.as_str() {
                "INCREMENT_COUNTER" => {
                    state.count += command.payload["by"].as_i64().unwrap_or(1);
                    Ok(CommandOutcome::ok()
                        .with_data(json!({"count": state.count}))
                        .with_event(command.derive(
                            "COUNTER_INCREMENTED",
                            json!({"count": state.count}),
                        )))
                }
                other => Err(FabricError::new(
                    ErrorCode::UnknownCommand,
                    format!("No handler for {other}"),
                )
                .into()),
            }
        }

        async fn on_query(
            &self,
            state: &CounterState,
            query: &Envelope,
            _ctx: &ActorContext,
        ) -> anyhow::Result<Value> {
            match query.event_type.as_str() {
                "GET_COUNT" => Ok(json!({"count": state.count})),
                other => Err(FabricError::new(
                    ErrorCode::UnknownQuery,
                    format!("No handler for {other}"),
                )
                .into()),
            }
        }
    }

    fn catalog() -> Arc<EventCatalog> {
        Arc::new(EventCatalog::new(Arc::new(InMemoryCatalogStore::new())))
    }

    #[tokio::test]
    async fn test_initialize_then_handle() {
        let actor = Actor::builder(CounterActor::new()).build();
        actor.initialize().await.unwrap();

        let result = actor
            .handle(Envelope::new("INCREMENT_COUNTER", json!({"by": 2})))
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["count"], 2);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event_type, "COUNTER_INCREMENTED");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let behavior = CounterActor::new();
        let init_calls = behavior.init_calls.clone();
        let actor = Actor::builder(behavior).build();
        actor.initialize().await.unwrap();
        actor.initialize().await.unwrap();
        assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_validation_failure_no_state_change() {
        let store = Arc::new(InMemoryStateStore::new());
        let actor = Actor::builder(CounterActor::new())
            .with_state_store(store.clone())
            .build();
        actor.initialize().await.unwrap();

        // "by" must be an integer >= 1
        let result = actor
            .handle(Envelope::new("INCREMENT_COUNTER", json!({"by": "two"})))
            .await;
        assert!(!result.success);
        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::CommandValidationFailed);
        assert_eq!(err.status, 400);
        assert_eq!(err.context["errors"][0]["path"], "by");
        assert!(err.context["example"].as_str().unwrap().contains("```json"));
        assert!(result.events.is_empty());

        // No state was saved for the failed command.
        assert!(store.load("counter").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catalog_validation_preferred() {
        let catalog = catalog();
        let actor = Actor::builder(CounterActor::new())
            .with_catalog(catalog.clone())
            .build();
        actor.initialize().await.unwrap();

        // Definitions were registered with the catalog on initialize.
        assert!(catalog.get_definition("INCREMENT_COUNTER").await.is_some());

        let result = actor
            .handle(Envelope::new("INCREMENT_COUNTER", json!({})))
            .await;
        assert_eq!(
            result.error.unwrap().code,
            ErrorCode::CommandValidationFailed
        );
    }

    #[tokio::test]
    async fn test_unknown_command_maps_to_error() {
        let actor = Actor::builder(CounterActor::new()).build();
        actor.initialize().await.unwrap();

        let result = actor.handle(Envelope::new("EXPLODE", json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::UnknownCommand);
    }

    #[tokio::test]
    async fn test_query_round_trip_and_no_save() {
        let store = Arc::new(InMemoryStateStore::new());
        let actor = Actor::builder(CounterActor::new())
            .with_state_store(store.clone())
            .build();
        actor.initialize().await.unwrap();

        actor
            .handle(Envelope::new("INCREMENT_COUNTER", json!({"by": 5})))
            .await;
        let saves_after_command = store.load("counter").await.unwrap();
        assert!(saves_after_command.is_some());

        let result = actor.query(Envelope::new("GET_COUNT", json!({}))).await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["count"], 5);
    }

    #[tokio::test]
    async fn test_state_persists_across_instances() {
        let store = Arc::new(InMemoryStateStore::new());
        {
            let actor = Actor::builder(CounterActor::new())
                .with_state_store(store.clone())
                .build();
            actor.initialize().await.unwrap();
            actor
                .handle(Envelope::new("INCREMENT_COUNTER", json!({"by": 7})))
                .await;
            actor.shutdown().await;
        }

        let actor = Actor::builder(CounterActor::new())
            .with_state_store(store)
            .build();
        actor.initialize().await.unwrap();
        let result = actor.query(Envelope::new("GET_COUNT", json!({}))).await;
        assert_eq!(result.data.unwrap()["count"], 7);
    }

    #[tokio::test]
    async fn test_rate_limit_denies_fourth_call() {
        let actor = Actor::builder(CounterActor::new())
            .with_rate_limit(
                "INCREMENT_COUNTER",
                WindowConfig {
                    window: Duration::from_millis(900_000),
                    max_requests: 3,
                },
                |payload: &Value| {
                    payload["email"].as_str().unwrap_or("anonymous").to_string()
                },
            )
            .build();
        actor.initialize().await.unwrap();

        let cmd = || Envelope::new("INCREMENT_COUNTER", json!({"by": 1, "email": "u@x"}));
        let mut successes = 0;
        let mut limited = 0;
        for _ in 0..4 {
            let result = actor.handle(cmd()).await;
            if result.success {
                successes += 1;
            } else if result.error.unwrap().code == ErrorCode::RateLimitExceeded {
                limited += 1;
            }
        }
        assert_eq!(successes, 3);
        assert_eq!(limited, 1);

        // A different key is unaffected.
        let other = actor
            .handle(Envelope::new(
                "INCREMENT_COUNTER",
                json!({"by": 1, "email": "other@x"}),
            ))
            .await;
        assert!(other.success);
    }

    #[tokio::test]
    async fn test_state_save_failure_not_fatal() {
        let store = Arc::new(InMemoryStateStore::new());
        let actor = Actor::builder(CounterActor::new())
            .with_state_store(store.clone())
            .build();
        actor.initialize().await.unwrap();

        store.set_failing(true);
        let result = actor
            .handle(Envelope::new("INCREMENT_COUNTER", json!({"by": 1})))
            .await;
        assert!(result.success);
        assert_eq!(actor.get_metrics().counters["state_save_failures"], 1);
    }

    #[tokio::test]
    async fn test_security_flavored_error_buffered() {
        struct GrumpyActor;

        #[async_trait]
        impl ActorBehavior for GrumpyActor {
            type State = CounterState;

            fn manifest(&self) -> ActorManifest {
                ActorManifest::new("grumpy", "1.0.0")
            }

            fn create_default_state(&self) -> CounterState {
                CounterState::default()
            }

            async fn on_command(
                &self,
                _state: &mut CounterState,
                _command: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<CommandOutcome> {
                anyhow::bail!("request rejected: invalid token")
            }

            async fn on_query(
                &self,
                _state: &CounterState,
                _query: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<Value> {
                Ok(json!(null))
            }
        }

        let actor = Actor::builder(GrumpyActor).build();
        actor.initialize().await.unwrap();
        let result = actor.handle(Envelope::new("DO_THING", json!({}))).await;
        assert!(!result.success);

        let events = actor.security_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "command_security_error");
        assert_eq!(events[0].actor_name.as_deref(), Some("grumpy"));
    }

    #[tokio::test]
    async fn test_error_transformer_defaults_apply() {
        struct DbActor;

        #[async_trait]
        impl ActorBehavior for DbActor {
            type State = CounterState;

            fn manifest(&self) -> ActorManifest {
                ActorManifest::new("db", "1.0.0")
            }

            fn create_default_state(&self) -> CounterState {
                CounterState::default()
            }

            async fn on_command(
                &self,
                _state: &mut CounterState,
                _command: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<CommandOutcome> {
                anyhow::bail!("connect ECONNREFUSED: connection refused")
            }

            async fn on_query(
                &self,
                _state: &CounterState,
                _query: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<Value> {
                anyhow::bail!("session not found")
            }
        }

        let actor = Actor::builder(DbActor).build();
        actor.initialize().await.unwrap();

        let cmd = actor.handle(Envelope::new("DO_THING", json!({}))).await;
        let err = cmd.error.unwrap();
        assert_eq!(err.code, ErrorCode::DbConnectionFailed);
        assert_eq!(err.status, 503);

        let query = actor.query(Envelope::new("GET_THING", json!({}))).await;
        assert_eq!(query.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_health_status_reflects_breakers() {
        let actor = Actor::builder(CounterActor::new())
            .with_actor_config(ActorConfig {
                breaker: BreakerConfig {
                    failure_threshold: 1,
                    reset_timeout: Duration::from_secs(60),
                    half_open_requests: 1,
                },
                ..Default::default()
            })
            .build();
        actor.initialize().await.unwrap();

        let status = actor.get_health_status().await;
        assert!(status.healthy);
        assert!(status.state_loaded);

        // Trip the state_save breaker.
        let breaker = actor.caps.breakers.get("state_save");
        let _ = breaker
            .execute(async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await;

        let status = actor.get_health_status().await;
        assert!(!status.healthy);
        assert_eq!(
            status.breakers["state_save"].state,
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn test_config_schema_validation_fails_initialize() {
        struct Misconfigured;

        #[async_trait]
        impl ActorBehavior for Misconfigured {
            type State = CounterState;

            fn manifest(&self) -> ActorManifest {
                ActorManifest::new("misconfigured", "1.0.0")
            }

            fn create_default_state(&self) -> CounterState {
                CounterState::default()
            }

            fn config_schema(&self) -> Option<PayloadSchema> {
                PayloadSchema::from_value(&json!({
                    "type": "object",
                    "properties": {"limit": {"type": "integer"}},
                    "required": ["limit"]
                }))
                .ok()
            }

            fn config(&self) -> Value {
                json!({})
            }

            async fn on_command(
                &self,
                _state: &mut CounterState,
                _command: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<CommandOutcome> {
                Ok(CommandOutcome::ok())
            }

            async fn on_query(
                &self,
                _state: &CounterState,
                _query: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<Value> {
                Ok(json!(null))
            }
        }

        let actor = Actor::builder(Misconfigured).build();
        let err = actor.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigValidationFailed);
    }

    #[tokio::test]
    async fn test_state_schema_rejection_with_hints() {
        struct SchemaActor;

        #[async_trait]
        impl ActorBehavior for SchemaActor {
            type State = Value;

            fn manifest(&self) -> ActorManifest {
                ActorManifest::new("schema_actor", "1.0.0")
            }

            fn create_default_state(&self) -> Value {
                json!({"sessions": {"__type": "map", "entries": []}})
            }

            fn state_schema(&self) -> Option<PayloadSchema> {
                PayloadSchema::from_value(&json!({
                    "type": "object",
                    "properties": {
                        "sessions": {
                            "type": "object",
                            "properties": {
                                "__type": {"type": "string"},
                                "entries": {"type": "array"}
                            },
                            "required": ["__type", "entries"]
                        }
                    },
                    "required": ["sessions"]
                }))
                .ok()
            }

            async fn on_command(
                &self,
                _state: &mut Value,
                _command: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<CommandOutcome> {
                Ok(CommandOutcome::ok())
            }

            async fn on_query(
                &self,
                _state: &Value,
                _query: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<Value> {
                Ok(json!(null))
            }
        }

        let store = Arc::new(InMemoryStateStore::new());
        // Legacy untagged mapping: schema requires the tagged form.
        store.put(
            "schema_actor",
            serde_json::to_vec(&json!({"sessions": {"s1": {"user": "u1"}}})).unwrap(),
        );

        let actor = Actor::builder(SchemaActor).with_state_store(store).build();
        let err = actor.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::StateValidationFailed);
        let suggestions = err.context["suggestions"].as_array().unwrap();
        assert!(suggestions
            .iter()
            .any(|s| s.as_str().unwrap().contains("keyed mapping")));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let actor = Actor::builder(CounterActor::new()).build();
        actor.initialize().await.unwrap();
        actor.shutdown().await;

        let result = actor
            .handle(Envelope::new("INCREMENT_COUNTER", json!({"by": 1})))
            .await;
        assert_eq!(result.error.unwrap().code, ErrorCode::ShuttingDown);
        let query = actor.query(Envelope::new("GET_COUNT", json!({}))).await;
        assert_eq!(query.error.unwrap().code, ErrorCode::ShuttingDown);
    }

    #[tokio::test]
    async fn test_commands_serialize_on_state_lock() {
        struct SlowActor;

        #[async_trait]
        impl ActorBehavior for SlowActor {
            type State = CounterState;

            fn manifest(&self) -> ActorManifest {
                ActorManifest::new("slow", "1.0.0")
            }

            fn create_default_state(&self) -> CounterState {
                CounterState::default()
            }

            async fn on_command(
                &self,
                state: &mut CounterState,
                _command: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<CommandOutcome> {
                // Read-modify-write with a suspension in the middle; serial
                // dispatch makes it safe.
                let read = state.count;
                tokio::time::sleep(Duration::from_millis(10)).await;
                state.count = read + 1;
                Ok(CommandOutcome::ok())
            }

            async fn on_query(
                &self,
                state: &CounterState,
                _query: &Envelope,
                _ctx: &ActorContext,
            ) -> anyhow::Result<Value> {
                Ok(json!({"count": state.count}))
            }
        }

        let actor = Actor::builder(SlowActor).build();
        actor.initialize().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let actor = actor.clone();
            handles.push(tokio::spawn(async move {
                actor.handle(Envelope::new("BUMP", json!({}))).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().success);
        }

        let result = actor.query(Envelope::new("GET_ANY", json!({}))).await;
        assert_eq!(result.data.unwrap()["count"], 10);
    }

    #[tokio::test]
    async fn test_example_payload_generation() {
        let schema = PayloadSchema::from_value(&json!({
            "type": "object",
            "properties": {
                "email": {"type": "string"},
                "count": {"type": "integer", "minimum": 3},
                "tags": {"type": "array", "items": {"type": "string"}},
                "plan": {"type": "string", "enum": ["free", "pro"]},
                "nested": {"type": "object", "properties": {"on": {"type": "boolean"}}}
            }
        }))
        .unwrap();

        let example = example_payload(&schema);
        assert_eq!(example["email"], "string");
        assert_eq!(example["count"], 3);
        assert_eq!(example["tags"], json!(["string"]));
        assert_eq!(example["plan"], "free");
        assert_eq!(example["nested"]["on"], false);
    }
}
