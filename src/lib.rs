//! Command/query orchestration core for dashboard state.
//!
//! An [`Engine`] owns one dashboard's state. Commands are executed one at a
//! time in dispatch order and each ends in exactly one event on the
//! [`EventBus`]; queries are deduplicated while in flight and their results
//! cached. [`attribute_filter`] builds paged element loading and invertible
//! selections on the same pieces.

pub mod attribute_filter;
mod bus;
mod command;
mod config;
mod context;
mod dispatcher;
mod engine;
mod error;
mod event;
mod handler;
mod model;
mod query;
mod store;
mod undo;

pub use bus::{EventBus, EventFilter, EventStream, Subscription};
pub use command::{Command, CommandOutcome, CorrelationId, new_correlation_id};
pub use config::{EngineConfig, FilterConfig};
pub use context::HandlerContext;
pub use engine::{Engine, EngineBuilder, EngineRegistry};
pub use error::{
    BackendError, DispatchError, ErrorKind, FilterError, HandlerError, QueryError, WaitError,
};
pub use event::{
    COMMAND_FAILED, COMMAND_REJECTED, COMMAND_SUCCEEDED, Event, FailurePayload, QUERY_FAILED,
    QUERY_SUCCEEDED,
};
pub use handler::{
    CommandHandler, FnCommandHandler, FnQueryHandler, QueryHandler, command_fn, query_fn,
};
pub use model::Model;
pub use query::{Query, QueryCanceler, QueryProcessor, QueryResult, QueryStatus};
pub use store::StateStore;
pub use undo::{UndoEntry, UndoLog};
