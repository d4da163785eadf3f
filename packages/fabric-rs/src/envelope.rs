//! Envelopes - the one thing that flows.
//!
//! Every message between actors is an [`Envelope`]: a JSON payload plus
//! transport metadata. Domain payloads stay clean; correlation and routing
//! live on the envelope.
//!
//! # Categories
//!
//! An envelope is a command, query, or notification. The authoritative source
//! for the category is the catalog's definition for the envelope's `type`;
//! when the catalog is unreachable the category is inferred from the naming
//! convention (`VERB_NOUN` command, `GET_NOUN` query, `NOUN_VERB_PAST`
//! notification).
//!
//! # Correlation
//!
//! A correlation id links an initiating envelope to every envelope it causes.
//! Use [`CorrelationId::NONE`] for uncorrelated traffic.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// Correlation Id
// =============================================================================

/// Correlation ID for tracking related envelopes across actors.
///
/// Each inbound request gets a fresh id that propagates through every event
/// the request causes, enabling cross-actor tracing and ask/reply matching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel for uncorrelated envelopes (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID.
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Get the inner UUID.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Category
// =============================================================================

/// The role of an envelope in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    /// Intent to change state (`SEND_MAGIC_LINK`, `CREATE_SESSION`).
    Command,
    /// Read-only question (`GET_SESSION`, `GET_CART_TOTAL`).
    Query,
    /// A fact, already happened (`MAGIC_LINK_SENT`, `ORDER_SHIPPED`).
    Notification,
}

impl EventCategory {
    /// Infer the category from an event name.
    ///
    /// Fallback for when the catalog is unavailable. Convention:
    /// - `GET_*` is a query
    /// - a name whose last segment is past tense (`*_SENT`, `*_CREATED`) is a
    ///   notification
    /// - everything else is a command
    pub fn infer(event_name: &str) -> Self {
        if event_name.starts_with("GET_") {
            return EventCategory::Query;
        }
        if let Some(last) = event_name.rsplit('_').next() {
            if (last.len() > 2 && last.ends_with("ED"))
                || matches!(last, "SENT" | "DONE" | "BUILT" | "PAID" | "SOLD" | "HELD")
            {
                return EventCategory::Notification;
            }
        }
        EventCategory::Command
    }

    /// Wire name (`command` / `query` / `notification`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Command => "command",
            EventCategory::Query => "query",
            EventCategory::Notification => "notification",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(EventCategory::Command),
            "query" => Ok(EventCategory::Query),
            "notification" => Ok(EventCategory::Notification),
            other => Err(format!("unknown event category: {other}")),
        }
    }
}

// =============================================================================
// Metadata & Envelope
// =============================================================================

/// Transport metadata carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Set by the bus when an at-least-once entry is republished.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub redelivered: bool,
}

/// A command, query, or notification in flight.
///
/// Envelopes are immutable once created; derived envelopes get fresh ids but
/// inherit the correlation id of their cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Target or originating actor, depending on direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            actor: None,
            correlation_id: None,
            metadata: Metadata::default(),
        }
    }

    /// Set the actor field.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation(mut self, cid: CorrelationId) -> Self {
        self.correlation_id = Some(cid);
        self
    }

    /// Set the metadata block.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The correlation id, or NONE when absent.
    pub fn correlation(&self) -> CorrelationId {
        self.correlation_id.unwrap_or(CorrelationId::NONE)
    }

    /// Derive a new envelope caused by this one.
    ///
    /// Fresh id and timestamp; correlation id and user metadata carry over.
    pub fn derive(&self, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            actor: None,
            correlation_id: Some(self.correlation()),
            metadata: Metadata {
                source: self.actor.clone(),
                source_actor_id: self.metadata.source_actor_id.clone(),
                user_id: self.metadata.user_id.clone(),
                redelivered: false,
            },
        }
    }

    /// Category inferred from the event name (catalog-less fallback).
    pub fn inferred_category(&self) -> EventCategory {
        EventCategory::infer(&self.event_type)
    }
}
