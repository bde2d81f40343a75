//! Crate-level error types for command dispatch, handler execution and
//! query retrieval.

use serde::{Deserialize, Serialize};

/// Broad category of a handler failure.
///
/// Carried in the payload of failure events so listeners can tell a bad
/// payload apart from a backend outage without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The command or query payload failed validation.
    Validation,
    /// A backend call made through the handler context failed.
    External,
    /// Mutations did not fit the current state.
    Consistency,
    /// The handler refused the command on business grounds.
    Rejected,
    /// The handler panicked or violated an engine contract.
    Internal,
}

/// Error produced by a command or query handler.
///
/// Every variant carries a human-readable message. The type is `Clone` so a
/// single query failure can be delivered to every caller attached to the
/// same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Payload could not be decoded or failed a precondition.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A backend call failed.
    #[error("external call failed: {0}")]
    External(String),

    /// The produced mutations were inconsistent with the current state.
    ///
    /// Raised by the dispatcher when [`Model::apply`](crate::Model::apply)
    /// rejects a mutation; the whole batch is discarded.
    #[error("consistency check failed: {0}")]
    Consistency(String),

    /// The handler declined to run the command.
    ///
    /// Published as [`COMMAND_REJECTED`](crate::event::COMMAND_REJECTED)
    /// rather than `COMMAND_FAILED`.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Unexpected failure, including handler panics.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for [`HandlerError::Rejected`].
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::External(_) => ErrorKind::External,
            Self::Consistency(_) => ErrorKind::Consistency,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Validation(m)
            | Self::External(m)
            | Self::Consistency(m)
            | Self::Rejected(m)
            | Self::Internal(m) => m,
        }
    }
}

/// Failure reported by a backend capability.
///
/// Backends return this from their async methods; the handler context
/// converts it into [`HandlerError::External`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    /// Create a backend error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<BackendError> for HandlerError {
    fn from(err: BackendError) -> Self {
        Self::External(err.message)
    }
}

/// Error returned synchronously when a command or query cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No handler is registered for the command type.
    #[error("no handler registered for command type '{0}'")]
    UnknownCommand(String),

    /// No handler is registered for the query type.
    #[error("no handler registered for query type '{0}'")]
    UnknownQuery(String),

    /// A second handler was registered for the same type.
    #[error("a handler is already registered for '{0}'")]
    DuplicateHandler(String),

    /// The command dispatcher task has shut down.
    ///
    /// The background task that serializes commands has exited, so no
    /// further commands can be processed.
    #[error("command dispatcher is no longer running")]
    DispatcherGone,
}

impl From<DispatchError> for HandlerError {
    /// A handler that issues an unroutable child command has a bug, so the
    /// failure is reported as internal.
    fn from(err: DispatchError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Error returned when awaiting a query result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The query handler failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The query could not be started.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The caller withdrew interest before the result arrived.
    #[error("query was canceled")]
    Canceled,

    /// The cached value is not of the type the caller asked for.
    #[error("query result for '{0}' has an unexpected type")]
    TypeMismatch(String),

    /// The task running the query went away without settling it.
    #[error("query task exited before producing a result")]
    Abandoned,
}

/// Error returned by the dispatch-and-wait helpers.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The command was not accepted.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The command ended in a failure or rejection event.
    ///
    /// The boxed event is the failure event itself, payload included.
    #[error("command ended with {}", .0.event_type)]
    Failed(Box<crate::event::Event>),

    /// The event bus subscription closed before a matching event arrived.
    #[error("event subscription closed before a matching event arrived")]
    Closed,
}

/// Error returned by [`AttributeFilterLoader`](crate::attribute_filter::AttributeFilterLoader)
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// The load was canceled, directly or by a change of load options.
    #[error("load was canceled")]
    Canceled,

    /// The backend request failed.
    #[error(transparent)]
    Load(QueryError),

    /// A next page was requested before any page was loaded.
    #[error("no elements page has been loaded yet")]
    NoPageLoaded,

    /// Every element matching the current options is already loaded.
    #[error("all elements are already loaded")]
    NoNextPage,

    /// A single-select accessor was used on a selection that is not one.
    #[error("selection holds more than one element or is inverted")]
    NotSingleSelection,
}

impl From<QueryError> for FilterError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Canceled => Self::Canceled,
            other => Self::Load(other),
        }
    }
}

impl From<DispatchError> for FilterError {
    fn from(err: DispatchError) -> Self {
        Self::Load(QueryError::Dispatch(err))
    }
}
