//! Command and query handler traits, closure adapters and the type-erased
//! query wrapper used by the query processor.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{Command, CommandOutcome};
use crate::context::HandlerContext;
use crate::error::HandlerError;
use crate::model::Model;
use crate::query::Query;

/// Handles one command type.
///
/// Handlers read state and call the backend through the context, then
/// return mutations for the dispatcher to apply. They never mutate state
/// themselves. A returned `Err` becomes a failure event; a panic becomes a
/// failure event of kind [`Internal`](crate::ErrorKind::Internal).
#[async_trait]
pub trait CommandHandler<M: Model, B>: Send + Sync + 'static {
    /// Run the command.
    async fn handle(
        &self,
        ctx: &HandlerContext<M, B>,
        command: &Command,
    ) -> Result<CommandOutcome<M::Mutation>, HandlerError>;
}

/// Handles one query type.
///
/// Queries read state and call the backend but produce no mutations.
/// Successful results are cached per [`cache_key`](QueryHandler::cache_key).
#[async_trait]
pub trait QueryHandler<M: Model, B>: Send + Sync + 'static {
    /// The value produced by the query.
    type Output: Send + Sync + 'static;

    /// Run the query.
    async fn run(
        &self,
        ctx: &HandlerContext<M, B>,
        query: &Query,
    ) -> Result<Self::Output, HandlerError>;

    /// Cache key for `query`. Defaults to the query type plus the JSON of
    /// its payload.
    fn cache_key(&self, query: &Query) -> String {
        query.default_cache_key()
    }

    /// How long a successful result stays fresh. `None` defers to the
    /// processor default.
    fn ttl(&self) -> Option<Duration> {
        None
    }

    /// Whether to publish query events. `None` defers to the processor
    /// default.
    fn notify(&self) -> Option<bool> {
        None
    }
}

/// Adapter turning a closure or `async fn` into a [`CommandHandler`].
///
/// Build one with [`command_fn`].
pub struct FnCommandHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnCommandHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCommandHandler")
    }
}

/// Wrap `f` as a command handler.
///
/// `f` receives owned clones of the context and command, so it can be a
/// plain `async fn`.
pub fn command_fn<F>(f: F) -> FnCommandHandler<F> {
    FnCommandHandler { f }
}

#[async_trait]
impl<M, B, F, Fut> CommandHandler<M, B> for FnCommandHandler<F>
where
    M: Model,
    B: Send + Sync + 'static,
    F: Fn(HandlerContext<M, B>, Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandOutcome<M::Mutation>, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &HandlerContext<M, B>,
        command: &Command,
    ) -> Result<CommandOutcome<M::Mutation>, HandlerError> {
        (self.f)(ctx.clone(), command.clone()).await
    }
}

type KeyFn = Arc<dyn Fn(&Query) -> String + Send + Sync>;

/// Adapter turning a closure or `async fn` into a [`QueryHandler`].
///
/// Build one with [`query_fn`], then tune caching with the `with_*`
/// methods.
pub struct FnQueryHandler<F> {
    f: F,
    key: Option<KeyFn>,
    ttl: Option<Duration>,
    notify: Option<bool>,
}

impl<F> fmt::Debug for FnQueryHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnQueryHandler")
            .field("custom_key", &self.key.is_some())
            .field("ttl", &self.ttl)
            .field("notify", &self.notify)
            .finish()
    }
}

/// Wrap `f` as a query handler.
pub fn query_fn<F>(f: F) -> FnQueryHandler<F> {
    FnQueryHandler {
        f,
        key: None,
        ttl: None,
        notify: None,
    }
}

impl<F> FnQueryHandler<F> {
    /// Derive cache keys with `key` instead of type plus payload.
    pub fn with_cache_key(mut self, key: impl Fn(&Query) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    /// Expire successful results after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Turn query events on or off for this handler.
    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = Some(notify);
        self
    }
}

#[async_trait]
impl<M, B, F, Fut, T> QueryHandler<M, B> for FnQueryHandler<F>
where
    M: Model,
    B: Send + Sync + 'static,
    F: Fn(HandlerContext<M, B>, Query) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, HandlerError>> + Send + 'static,
    T: Send + Sync + 'static,
{
    type Output = T;

    async fn run(&self, ctx: &HandlerContext<M, B>, query: &Query) -> Result<T, HandlerError> {
        (self.f)(ctx.clone(), query.clone()).await
    }

    fn cache_key(&self, query: &Query) -> String {
        match &self.key {
            Some(key) => key(query),
            None => query.default_cache_key(),
        }
    }

    fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn notify(&self) -> Option<bool> {
        self.notify
    }
}

/// A query result with its concrete type erased.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Object-safe view of a [`QueryHandler`] with the output type erased.
///
/// Stored in the processor's handler map as `Arc<dyn ErasedQueryHandler>`;
/// callers recover the concrete type by downcasting the `Arc`.
#[async_trait]
pub(crate) trait ErasedQueryHandler<M: Model, B>: Send + Sync + 'static {
    async fn run_erased(
        &self,
        ctx: &HandlerContext<M, B>,
        query: &Query,
    ) -> Result<AnyValue, HandlerError>;

    fn cache_key(&self, query: &Query) -> String;

    fn ttl(&self) -> Option<Duration>;

    fn notify(&self) -> Option<bool>;
}

pub(crate) struct ErasedQuery<H>(pub(crate) H);

#[async_trait]
impl<M, B, H> ErasedQueryHandler<M, B> for ErasedQuery<H>
where
    M: Model,
    B: Send + Sync + 'static,
    H: QueryHandler<M, B>,
{
    async fn run_erased(
        &self,
        ctx: &HandlerContext<M, B>,
        query: &Query,
    ) -> Result<AnyValue, HandlerError> {
        let output = self.0.run(ctx, query).await?;
        let value: AnyValue = Arc::new(output);
        Ok(value)
    }

    fn cache_key(&self, query: &Query) -> String {
        self.0.cache_key(query)
    }

    fn ttl(&self) -> Option<Duration> {
        self.0.ttl()
    }

    fn notify(&self) -> Option<bool> {
        self.0.notify()
    }
}
