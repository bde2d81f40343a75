//! Event envelope and the well-known engine event types.
//!
//! Events are immutable facts published on the [`EventBus`](crate::EventBus)
//! after a command or query settles. Domain handlers choose their own event
//! types; the engine itself only emits the constants defined here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CorrelationId;
use crate::error::{ErrorKind, HandlerError};

/// Generic success event for commands whose handler names no domain event.
pub const COMMAND_SUCCEEDED: &str = "COMMAND_SUCCEEDED";
/// A command handler failed, or its mutations could not be applied.
pub const COMMAND_FAILED: &str = "COMMAND_FAILED";
/// A command handler refused the command.
pub const COMMAND_REJECTED: &str = "COMMAND_REJECTED";
/// A query settled successfully (only when query notifications are on).
pub const QUERY_SUCCEEDED: &str = "QUERY_SUCCEEDED";
/// A query settled with an error (only when query notifications are on).
pub const QUERY_FAILED: &str = "QUERY_FAILED";

/// An immutable fact published on the event bus.
///
/// # Examples
///
/// ```
/// use dashboard_engine::Event;
/// use serde_json::json;
///
/// let event = Event::new("dashboard.renamed", json!({"title": "Sales"}))
///     .with_correlation_id("c-1");
/// assert!(event.is_type("dashboard.renamed"));
/// assert_eq!(event.correlation_id.as_deref(), Some("c-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type name.
    pub event_type: String,
    /// Correlation ID of the command or query that caused the event.
    pub correlation_id: Option<CorrelationId>,
    /// Correlation ID of the command that queued the command behind this
    /// event (set for child commands and undo inverses).
    #[serde(default)]
    pub causation_id: Option<CorrelationId>,
    /// JSON payload.
    pub payload: Value,
}

impl Event {
    /// Create an uncorrelated event.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Build the failure event for a command.
    ///
    /// Rejections map to [`COMMAND_REJECTED`]; every other error kind maps
    /// to [`COMMAND_FAILED`]. The payload is a serialized [`FailurePayload`].
    pub fn command_failure(
        command_type: &str,
        correlation_id: impl Into<String>,
        error: &HandlerError,
    ) -> Self {
        let event_type = match error.kind() {
            ErrorKind::Rejected => COMMAND_REJECTED,
            _ => COMMAND_FAILED,
        };
        let payload = FailurePayload {
            command_type: command_type.to_string(),
            kind: error.kind(),
            message: error.message().to_string(),
        };
        Self::new(event_type, serde_json::to_value(payload).unwrap_or(Value::Null))
            .with_correlation_id(correlation_id)
    }

    /// Whether this event has the given type.
    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Whether this is a command failure or rejection.
    pub fn is_command_failure(&self) -> bool {
        self.event_type == COMMAND_FAILED || self.event_type == COMMAND_REJECTED
    }

    /// Whether the event carries the given correlation ID.
    pub fn correlates_with(&self, id: &str) -> bool {
        self.correlation_id.as_deref() == Some(id)
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }

    /// The failure details, if this is a command failure event.
    pub fn failure(&self) -> Option<FailurePayload> {
        if !self.is_command_failure() {
            return None;
        }
        self.payload_as().ok()
    }
}

/// Payload of [`COMMAND_FAILED`] and [`COMMAND_REJECTED`] events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePayload {
    /// Type of the command that failed.
    pub command_type: String,
    /// Error category.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}
