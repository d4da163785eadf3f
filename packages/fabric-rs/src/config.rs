//! Runtime configuration loaded from environment variables.
//!
//! Global knobs (store URLs, export flags, the security webhook) come from
//! the environment once at startup; per-actor configuration is declared by
//! the actor and validated against its config schema, failing with
//! `CONFIG_VALIDATION_FAILED` before anything else initializes.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde_json::{json, Value};
use std::env;

use crate::error::{ErrorCode, FabricError};
use crate::schema::{CompiledSchema, PayloadSchema, ValidationMode};
use crate::security::SecurityWebhook;

/// Runtime-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// State-store connection string (backend-specific).
    pub state_store_url: Option<String>,
    /// Catalog cache connection string, when a shared cache is deployed.
    pub cache_url: Option<String>,
    pub enable_metrics_endpoint: bool,
    pub export_metrics_on_shutdown: bool,
    pub export_security_events_on_shutdown: bool,
    pub security_webhook_url: Option<String>,
    pub security_webhook_token: Option<String>,
}

impl RuntimeConfig {
    /// Load from environment variables (reads `.env` in development).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            state_store_url: env::var("STATE_STORE_URL").ok(),
            cache_url: env::var("CACHE_URL").ok(),
            enable_metrics_endpoint: flag("ENABLE_METRICS_ENDPOINT")?,
            export_metrics_on_shutdown: flag("EXPORT_METRICS_ON_SHUTDOWN")?,
            export_security_events_on_shutdown: flag("EXPORT_SECURITY_EVENTS_ON_SHUTDOWN")?,
            security_webhook_url: env::var("SECURITY_WEBHOOK_URL").ok(),
            security_webhook_token: env::var("SECURITY_WEBHOOK_TOKEN").ok(),
        })
    }

    /// The configured security webhook, when a URL is present.
    pub fn security_webhook(&self) -> Option<SecurityWebhook> {
        self.security_webhook_url.as_ref().map(|url| SecurityWebhook {
            url: url.clone(),
            token: self.security_webhook_token.clone(),
        })
    }
}

fn flag(name: &str) -> Result<bool> {
    match env::var(name) {
        Err(_) => Ok(false),
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(anyhow::anyhow!("{name} must be a boolean flag, got {other:?}"))
                .context("invalid environment flag"),
        },
    }
}

/// Validate an actor's declared configuration against its schema.
pub fn validate_actor_config(
    actor: &str,
    config: &Value,
    schema: &PayloadSchema,
    mode: ValidationMode,
) -> Result<(), FabricError> {
    let compiled = CompiledSchema::compile(schema, mode).map_err(|e| {
        FabricError::new(ErrorCode::ConfigValidationFailed, "Config schema is malformed")
            .with_field("actor", json!(actor))
            .with_field("detail", json!(e.to_string()))
    })?;
    let outcome = compiled.validate(config);
    if outcome.valid {
        Ok(())
    } else {
        Err(
            FabricError::new(ErrorCode::ConfigValidationFailed, "Configuration is invalid")
                .with_field("actor", json!(actor))
                .with_field("errors", json!(outcome.errors)),
        )
    }
}
