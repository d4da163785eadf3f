//! Structured errors for the fabric runtime.
//!
//! Every failure that crosses an actor boundary is a [`FabricError`]: a stable
//! machine-readable code, an HTTP-class status, a user-safe message, and a
//! structured JSON context. Raw internal errors never leave the runtime - they
//! are folded into a `FabricError` by the [`ErrorTransformer`] before anything
//! external sees them.
//!
//! # The Error Boundary Rule
//!
//! > No `anyhow::Error` ever crosses the bus boundary.
//!
//! - `anyhow` is internal transport (ergonomic for handlers)
//! - `FabricError` is the only externalized error (structured for callers)
//!
//! # Example
//!
//! ```ignore
//! let transformer = ErrorTransformer::with_defaults();
//! let err = transformer.transform(&anyhow::anyhow!("connection refused"), "billing");
//! assert_eq!(err.code, ErrorCode::DbConnectionFailed);
//! assert_eq!(err.status, 503);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

// =============================================================================
// Error Codes
// =============================================================================

/// Stable error codes surfaced by the runtime.
///
/// Codes are part of the wire contract: clients match on them, dashboards
/// group by them. Renaming one is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidEventDefinition,
    EventNotFound,
    InvalidConsumer,
    EventRegistrationFailed,
    CommandValidationFailed,
    ValidationError,
    RateLimitExceeded,
    CircuitOpen,
    RequestTimeout,
    StateValidationFailed,
    ConfigValidationFailed,
    DbConnectionFailed,
    NotFound,
    UnknownCommand,
    UnknownQuery,
    ShuttingDown,
    UnknownError,
}

impl ErrorCode {
    /// The HTTP-class status conventionally paired with this code.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::InvalidEventDefinition => 400,
            ErrorCode::EventNotFound => 404,
            ErrorCode::InvalidConsumer => 400,
            ErrorCode::EventRegistrationFailed => 500,
            ErrorCode::CommandValidationFailed => 400,
            ErrorCode::ValidationError => 400,
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::CircuitOpen => 503,
            ErrorCode::RequestTimeout => 504,
            ErrorCode::StateValidationFailed => 500,
            ErrorCode::ConfigValidationFailed => 500,
            ErrorCode::DbConnectionFailed => 503,
            ErrorCode::NotFound => 404,
            ErrorCode::UnknownCommand => 400,
            ErrorCode::UnknownQuery => 400,
            ErrorCode::ShuttingDown => 503,
            ErrorCode::UnknownError => 500,
        }
    }

    /// The wire name of this code (`SCREAMING_SNAKE_CASE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidEventDefinition => "INVALID_EVENT_DEFINITION",
            ErrorCode::EventNotFound => "EVENT_NOT_FOUND",
            ErrorCode::InvalidConsumer => "INVALID_CONSUMER",
            ErrorCode::EventRegistrationFailed => "EVENT_REGISTRATION_FAILED",
            ErrorCode::CommandValidationFailed => "COMMAND_VALIDATION_FAILED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::StateValidationFailed => "STATE_VALIDATION_FAILED",
            ErrorCode::ConfigValidationFailed => "CONFIG_VALIDATION_FAILED",
            ErrorCode::DbConnectionFailed => "DB_CONNECTION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::UnknownQuery => "UNKNOWN_QUERY",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Fabric Error
// =============================================================================

/// The structured error surfaced by every runtime operation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {user_message}")]
pub struct FabricError {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// HTTP-class status for edge adapters.
    #[serde(rename = "statusCode")]
    pub status: u16,
    /// Safe for display. Never carries stack traces, SQL, or PII.
    #[serde(rename = "userMessage")]
    pub user_message: String,
    /// Structured context: actor name, offending field paths, retry hints.
    #[serde(default)]
    pub context: Value,
}

impl FabricError {
    /// Create an error with the code's conventional status.
    pub fn new(code: ErrorCode, user_message: impl Into<String>) -> Self {
        Self {
            code,
            status: code.status(),
            user_message: user_message.into(),
            context: Value::Null,
        }
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Attach a single context field, preserving existing ones.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        match &mut self.context {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
            }
            _ => {
                self.context = json!({ key: value });
            }
        }
        self
    }

    /// Shorthand for the unknown-event catalog failure.
    pub fn event_not_found(name: &str) -> Self {
        Self::new(ErrorCode::EventNotFound, format!("Event {name} not found"))
            .with_field("eventName", json!(name))
    }

    /// Shorthand for a rejected call while a breaker is open.
    pub fn circuit_open(breaker: &str) -> Self {
        Self::new(ErrorCode::CircuitOpen, "Service temporarily unavailable")
            .with_field("breaker", json!(breaker))
    }

    /// Shorthand for an exhausted rate-limit bucket.
    pub fn rate_limited() -> Self {
        Self::new(
            ErrorCode::RateLimitExceeded,
            "Rate limit exceeded. Please try again later.",
        )
    }

    /// Shorthand for an ask that outlived its deadline.
    pub fn request_timeout(target: &str, millis: u64) -> Self {
        Self::new(ErrorCode::RequestTimeout, "Request timed out")
            .with_field("target", json!(target))
            .with_field("timeoutMs", json!(millis))
    }

    /// True when this error should never be retried (caller mistakes).
    pub fn is_validation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::CommandValidationFailed
                | ErrorCode::ValidationError
                | ErrorCode::InvalidEventDefinition
                | ErrorCode::InvalidConsumer
                | ErrorCode::UnknownCommand
                | ErrorCode::UnknownQuery
        )
    }
}

// =============================================================================
// Error Transformer
// =============================================================================

/// Keywords whose presence marks an error as security-flavored.
///
/// Matching errors additionally land in the security-event buffer as
/// `command_security_error`.
pub const SECURITY_KEYWORDS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "authentication",
    "permission",
    "access denied",
    "invalid token",
];

/// Maps raw handler errors to [`FabricError`]s by substring pattern.
///
/// Patterns are matched against the lowercased error chain, first match wins.
/// Unmatched errors become `UNKNOWN_ERROR` with the actor name in context -
/// the raw message is logged, never surfaced.
pub struct ErrorTransformer {
    patterns: Vec<(String, ErrorCode, String)>,
}

impl ErrorTransformer {
    /// An empty transformer. Everything maps to `UNKNOWN_ERROR`.
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// The default pattern set used by every actor runtime.
    pub fn with_defaults() -> Self {
        let mut t = Self::new();
        t.register(
            "connection refused",
            ErrorCode::DbConnectionFailed,
            "A backing service is unavailable",
        );
        t.register("validation", ErrorCode::ValidationError, "Invalid input");
        t.register("not found", ErrorCode::NotFound, "Resource not found");
        t
    }

    /// Register a pattern. Earlier registrations win over later ones.
    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        code: ErrorCode,
        user_message: impl Into<String>,
    ) {
        self.patterns
            .push((pattern.into().to_lowercase(), code, user_message.into()));
    }

    /// Transform a raw error into a structured one.
    ///
    /// A `FabricError` already in the chain passes through untouched so codes
    /// assigned deep in a handler survive to the edge.
    pub fn transform(&self, error: &anyhow::Error, actor: &str) -> FabricError {
        if let Some(fe) = error.downcast_ref::<FabricError>() {
            return fe.clone();
        }

        let haystack = format!("{error:#}").to_lowercase();
        for (pattern, code, user_message) in &self.patterns {
            if haystack.contains(pattern) {
                return FabricError::new(*code, user_message.clone())
                    .with_field("actor", json!(actor));
            }
        }

        tracing::error!(actor, error = %error, "unclassified handler error");
        FabricError::new(ErrorCode::UnknownError, "An internal error occurred")
            .with_field("actor", json!(actor))
    }

    /// Whether the raw error reads as a security incident.
    pub fn is_security_flavored(error: &anyhow::Error) -> bool {
        let haystack = format!("{error:#}").to_lowercase();
        SECURITY_KEYWORDS.iter().any(|kw| haystack.contains(kw))
    }
}

impl Default for ErrorTransformer {
    fn default() -> Self {
        Self::with_defaults()
    }
}
