//! Capabilities handed to command and query handlers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::command::{Command, CorrelationId};
use crate::dispatcher::CommandQueue;
use crate::error::{DispatchError, HandlerError};
use crate::model::Model;
use crate::store::StateStore;

/// What a handler may do while it runs.
///
/// A handler can read state through selectors, reach the backend through
/// [`call`](HandlerContext::call) and queue follow-up commands through
/// [`dispatch_child`](HandlerContext::dispatch_child). It cannot mutate
/// state directly: mutations are returned in a
/// [`CommandOutcome`](crate::CommandOutcome) and applied by the dispatcher.
///
/// Cloning is cheap; the clone shares the store, backend and queue.
pub struct HandlerContext<M: Model, B> {
    store: StateStore<M>,
    backend: Arc<B>,
    commands: Option<CommandQueue<M, B>>,
    correlation_id: Option<CorrelationId>,
    held: Option<HeldCommands>,
}

/// Child commands issued by a query handler, queued only once the query
/// settles with a caller still waiting.
pub(crate) type HeldCommands = Arc<Mutex<Vec<Command>>>;

impl<M: Model, B> Clone for HandlerContext<M, B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            backend: Arc::clone(&self.backend),
            commands: self.commands.clone(),
            correlation_id: self.correlation_id.clone(),
            held: self.held.clone(),
        }
    }
}

impl<M: Model, B> fmt::Debug for HandlerContext<M, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("correlation_id", &self.correlation_id)
            .field("version", &self.store.version())
            .finish_non_exhaustive()
    }
}

impl<M: Model, B> HandlerContext<M, B> {
    pub(crate) fn new(
        store: StateStore<M>,
        backend: Arc<B>,
        commands: Option<CommandQueue<M, B>>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            store,
            backend,
            commands,
            correlation_id,
            held: None,
        }
    }

    /// Collect child commands into `held` instead of queueing them.
    pub(crate) fn holding_children(mut self, held: HeldCommands) -> Self {
        self.held = Some(held);
        self
    }

    /// Evaluate a selector against the current state.
    pub fn select<T>(&self, selector: impl FnOnce(&M) -> T) -> T {
        self.store.read(selector)
    }

    /// The current state snapshot.
    pub fn snapshot(&self) -> Arc<M> {
        self.store.snapshot()
    }

    /// Correlation ID of the command or query being handled.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Perform a backend call.
    ///
    /// The closure receives a handle to the backend and returns the call's
    /// future. Errors are converted into [`HandlerError`], so backend
    /// failures surface as [`HandlerError::External`].
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let datasets = ctx
    ///     .call(move |catalog| async move { catalog.date_datasets(&widget).await })
    ///     .await?;
    /// ```
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, HandlerError>
    where
        F: FnOnce(Arc<B>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<HandlerError>,
    {
        let started = Instant::now();
        let result = operation(Arc::clone(&self.backend)).await;
        tracing::debug!(
            correlation_id = ?self.correlation_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "backend call finished"
        );
        result.map_err(Into::into)
    }

    /// Queue a follow-up command behind everything already queued.
    ///
    /// The child runs after the current command completes. It gets its own
    /// correlation ID (unless one is set) and records the current
    /// correlation ID as its causation ID.
    ///
    /// Inside a query handler the child is held back until the query
    /// settles, and dropped if every caller has canceled by then.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownCommand`] for an unregistered type,
    /// or [`DispatchError::DispatcherGone`] once the engine has shut down.
    pub fn dispatch_child(&self, mut command: Command) -> Result<CorrelationId, DispatchError> {
        let queue = self.commands.as_ref().ok_or(DispatchError::DispatcherGone)?;
        if command.causation_id.is_none()
            && let Some(parent) = &self.correlation_id
        {
            command.causation_id = Some(parent.clone());
        }
        let Some(held) = &self.held else {
            return queue.enqueue(command, true);
        };
        if !queue.handles(&command.command_type) {
            return Err(DispatchError::UnknownCommand(command.command_type));
        }
        let correlation_id = command.ensure_correlation_id();
        held.lock().push(command);
        Ok(correlation_id)
    }
}
