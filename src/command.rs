//! Command envelope and handler outcome types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HandlerError;

/// Opaque identifier tying a command to the event it produces.
pub type CorrelationId = String;

/// Generate a fresh correlation ID (a random UUID v4).
pub fn new_correlation_id() -> CorrelationId {
    uuid::Uuid::new_v4().to_string()
}

/// A request to change engine state.
///
/// The payload is a `serde_json::Value` because the dispatcher routes by
/// `command_type` and does not know the concrete payload type; handlers
/// decode it with [`payload_as`](Command::payload_as).
///
/// # Examples
///
/// ```
/// use dashboard_engine::Command;
/// use serde_json::json;
///
/// let cmd = Command::new("dashboard.rename", json!({"title": "Sales"}))
///     .with_correlation_id("req-abc-123");
///
/// assert_eq!(cmd.command_type, "dashboard.rename");
/// assert_eq!(cmd.correlation_id.as_deref(), Some("req-abc-123"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Routing key; must match a registered command handler.
    pub command_type: String,
    /// JSON-encoded command arguments.
    pub payload: Value,
    /// Correlation ID. Assigned on dispatch when absent.
    pub correlation_id: Option<CorrelationId>,
    /// Correlation ID of the command whose handler issued this one.
    #[serde(default)]
    pub causation_id: Option<CorrelationId>,
}

impl Command {
    /// Create a command without a correlation ID.
    ///
    /// # Arguments
    ///
    /// * `command_type` - Routing key of the target handler.
    /// * `payload` - JSON arguments for the handler.
    pub fn new(command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Set the correlation ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Any value convertible to `String`. The event produced by this
    ///   command carries the same ID.
    ///
    /// # Returns
    ///
    /// The updated `Command` with the correlation ID set.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID (the correlation ID of the parent command).
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Fill in a fresh correlation ID if none is set, returning the ID.
    pub(crate) fn ensure_correlation_id(&mut self) -> CorrelationId {
        self.correlation_id
            .get_or_insert_with(new_correlation_id)
            .clone()
    }

    /// Decode the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Validation`] when the payload does not match
    /// `T`, so handlers can simply use `?`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            HandlerError::validation(format!("invalid payload for {}: {e}", self.command_type))
        })
    }
}

/// What a command handler produced.
///
/// The dispatcher applies `mutations` atomically, records `inverse` for
/// undo and publishes one event: `event_type` with `event_payload` when
/// set, otherwise [`COMMAND_SUCCEEDED`](crate::event::COMMAND_SUCCEEDED).
#[derive(Debug, Clone)]
pub struct CommandOutcome<Mu> {
    /// Reducer actions to apply, in order.
    pub mutations: Vec<Mu>,
    /// Domain event type announcing the result.
    pub event_type: Option<String>,
    /// Payload of the domain event.
    pub event_payload: Value,
    /// Command that reverses this one, if it can be undone.
    pub inverse: Option<Command>,
}

impl<Mu> Default for CommandOutcome<Mu> {
    fn default() -> Self {
        Self {
            mutations: Vec::new(),
            event_type: None,
            event_payload: Value::Null,
            inverse: None,
        }
    }
}

impl<Mu> CommandOutcome<Mu> {
    /// An outcome with no mutations and the generic success event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutation.
    pub fn mutation(mut self, mutation: Mu) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Append several mutations.
    pub fn mutations(mut self, mutations: impl IntoIterator<Item = Mu>) -> Self {
        self.mutations.extend(mutations);
        self
    }

    /// Announce success with a domain event instead of `COMMAND_SUCCEEDED`.
    pub fn event(mut self, event_type: impl Into<String>, payload: Value) -> Self {
        self.event_type = Some(event_type.into());
        self.event_payload = payload;
        self
    }

    /// Register the command that undoes this one.
    pub fn inverse(mut self, command: Command) -> Self {
        self.inverse = Some(command);
        self
    }
}
