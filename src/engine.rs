//! Top-level entry point that composes the state store, event bus, command
//! dispatcher, query processor and undo log into a single [`Engine`].
//!
//! An engine is configured through [`EngineBuilder`], which collects the
//! command and query handler registries and spawns the dispatcher task on
//! [`build`](EngineBuilder::build). [`EngineRegistry`] keeps one engine per
//! dashboard.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, EventFilter, EventStream, Subscription};
use crate::command::{Command, CorrelationId};
use crate::config::EngineConfig;
use crate::dispatcher::{CommandHandlers, CommandQueue, spawn_dispatcher};
use crate::error::{DispatchError, WaitError};
use crate::event::Event;
use crate::handler::{CommandHandler, ErasedQuery, QueryHandler};
use crate::model::Model;
use crate::query::{Query, QueryHandlers, QueryProcessor, QueryResult, QueryStatus};
use crate::store::StateStore;
use crate::undo::{UndoEntry, UndoLog};

/// One engine instance: the state of a single dashboard plus the machinery
/// that changes and reads it.
///
/// Commands are executed one at a time in dispatch order; each produces
/// exactly one event carrying its correlation ID. Queries are deduplicated
/// and cached by the query processor. Readers always see a consistent
/// snapshot.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped. The dispatcher
/// task stops when the last clone is dropped or on
/// [`shutdown`](Engine::shutdown).
pub struct Engine<M: Model, B> {
    store: StateStore<M>,
    bus: EventBus,
    commands: CommandQueue<M, B>,
    queries: QueryProcessor<M, B>,
    undo: UndoLog,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<M: Model, B> Clone for Engine<M, B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: self.bus.clone(),
            commands: self.commands.clone(),
            queries: self.queries.clone(),
            undo: self.undo.clone(),
            task: Arc::clone(&self.task),
        }
    }
}

// Manual `Debug`: handler registries hold trait objects.
impl<M: Model, B> fmt::Debug for Engine<M, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("version", &self.store.version())
            .field("running", &self.commands.is_alive())
            .field("undo_depth", &self.undo.len())
            .finish_non_exhaustive()
    }
}

impl<M: Model, B: Send + Sync + 'static> Engine<M, B> {
    /// Queue a command for execution.
    ///
    /// Returns as soon as the command is queued. Its outcome arrives later
    /// as an event carrying the returned correlation ID.
    ///
    /// # Arguments
    ///
    /// * `command` - The command; a UUID correlation ID is assigned when
    ///   it has none.
    ///
    /// # Returns
    ///
    /// The command's correlation ID.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::UnknownCommand`] -- no handler for the type.
    /// * [`DispatchError::DispatcherGone`] -- the engine has shut down.
    pub fn dispatch(&self, command: Command) -> Result<CorrelationId, DispatchError> {
        self.commands.enqueue(command, true)
    }

    /// Dispatch a command and wait for its own result event.
    ///
    /// # Errors
    ///
    /// * [`WaitError::Dispatch`] -- the command was not accepted.
    /// * [`WaitError::Failed`] -- the command produced a failure or
    ///   rejection event.
    pub async fn dispatch_and_wait(&self, mut command: Command) -> Result<Event, WaitError> {
        let correlation_id = command.ensure_correlation_id();
        self.dispatch_and_wait_for(command, move |event| event.correlates_with(&correlation_id))
            .await
    }

    /// Dispatch a command and wait for the first event matching `predicate`.
    ///
    /// The subscription is registered before the command is queued, so the
    /// event cannot be missed. A failure event for this command ends the
    /// wait even when the predicate does not match it. There is no built-in
    /// timeout; race the returned future against a timer if one is needed.
    ///
    /// # Errors
    ///
    /// * [`WaitError::Dispatch`] -- the command was not accepted.
    /// * [`WaitError::Failed`] -- the command produced a failure or
    ///   rejection event.
    /// * [`WaitError::Closed`] -- the subscription was torn down.
    pub async fn dispatch_and_wait_for<P>(
        &self,
        mut command: Command,
        predicate: P,
    ) -> Result<Event, WaitError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let correlation_id = command.ensure_correlation_id();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let own_id = correlation_id.clone();
        let filter = EventFilter::predicate(move |event| {
            predicate(event) || (event.correlates_with(&own_id) && event.is_command_failure())
        });
        let _subscription = self.bus.subscribe(filter, move |event| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(event.clone());
            }
        });

        self.dispatch(command)?;
        let event = rx.await.map_err(|_| WaitError::Closed)?;

        if event.correlates_with(&correlation_id) && event.is_command_failure() {
            return Err(WaitError::Failed(Box::new(event)));
        }
        Ok(event)
    }

    /// Start (or join) a query. See [`QueryProcessor::run`].
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownQuery`] when no handler is
    /// registered for the query type.
    pub fn query<T: Send + Sync + 'static>(&self, query: Query) -> Result<QueryResult<T>, DispatchError> {
        self.queries.run(query)
    }

    /// Drop the cached result for `cache_key`.
    pub fn invalidate(&self, cache_key: &str) -> bool {
        self.queries.invalidate(cache_key)
    }

    /// Drop every cached result of `query_type`.
    pub fn invalidate_type(&self, query_type: &str) -> usize {
        self.queries.invalidate_type(query_type)
    }

    /// Status of the query cache record for `cache_key`.
    pub fn query_status(&self, cache_key: &str) -> Option<QueryStatus> {
        self.queries.status(cache_key)
    }

    /// Undo the most recent undoable command.
    ///
    /// Queues the recorded inverse command; the inverse itself is not
    /// recorded. Commands still queued are not considered.
    ///
    /// # Returns
    ///
    /// The inverse command's correlation ID, or `None` when there is
    /// nothing to undo.
    ///
    /// # Errors
    ///
    /// Returns the queueing error; the entry stays in the undo log.
    pub fn undo(&self) -> Result<Option<CorrelationId>, DispatchError> {
        let Some(entry) = self.undo.pop() else {
            return Ok(None);
        };
        match self.queue_inverse(&entry) {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                self.undo.push_back(entry);
                Err(err)
            }
        }
    }

    /// Undo every command back to and including `correlation_id`.
    ///
    /// # Returns
    ///
    /// Correlation IDs of the queued inverse commands, newest first, or
    /// `None` when `correlation_id` is not in the undo log.
    ///
    /// # Errors
    ///
    /// Stops at the first inverse that cannot be queued and returns its
    /// error; inverses queued before it still run.
    pub fn undo_to(&self, correlation_id: &str) -> Result<Option<Vec<CorrelationId>>, DispatchError> {
        let Some(entries) = self.undo.take_through(correlation_id) else {
            return Ok(None);
        };
        let mut queued = Vec::with_capacity(entries.len());
        for entry in &entries {
            queued.push(self.queue_inverse(entry)?);
        }
        Ok(Some(queued))
    }

    fn queue_inverse(&self, entry: &UndoEntry) -> Result<CorrelationId, DispatchError> {
        let mut inverse = entry.inverse.clone();
        inverse.correlation_id = None;
        inverse.causation_id = Some(entry.correlation_id.clone());
        let id = self.commands.enqueue(inverse, false)?;
        tracing::info!(
            undone = %entry.correlation_id,
            command_type = %entry.command_type,
            correlation_id = %id,
            "undo queued"
        );
        Ok(id)
    }

    /// The undo log.
    pub fn undo_log(&self) -> &UndoLog {
        &self.undo
    }

    /// Register a listener on the engine's event bus.
    pub fn subscribe(
        &self,
        filter: impl Into<EventFilter>,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(filter, listener)
    }

    /// Receive matching events as an async stream.
    pub fn events(&self, filter: impl Into<EventFilter>) -> EventStream {
        self.bus.stream(filter)
    }

    /// The engine's event bus, for sharing with other components.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Evaluate a selector against the current state.
    pub fn read<T>(&self, selector: impl FnOnce(&M) -> T) -> T {
        self.store.read(selector)
    }

    /// The current state snapshot.
    pub fn snapshot(&self) -> Arc<M> {
        self.store.snapshot()
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<Arc<M>> {
        self.store.watch()
    }

    /// Whether a handler is registered for `command_type`.
    pub fn handles(&self, command_type: &str) -> bool {
        self.commands.handles(command_type)
    }

    /// Whether the dispatcher is still accepting commands.
    pub fn is_running(&self) -> bool {
        self.commands.is_alive()
    }

    /// Stop the engine after the commands already queued have run.
    ///
    /// Calling `shutdown` more than once is safe; later calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DispatcherGone`] if the dispatcher task
    /// ended abnormally.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return Ok(());
        };
        if self.commands.is_alive() {
            self.commands.shutdown().await?;
        }
        handle.await.map_err(|err| {
            tracing::error!(error = %err, "dispatcher task ended abnormally");
            DispatchError::DispatcherGone
        })
    }
}

/// Builder for configuring and starting an [`Engine`].
///
/// Collects the initial state, the backend capability, configuration and
/// the handler registries, then spawns the dispatcher on
/// [`build`](EngineBuilder::build).
///
/// # Examples
///
/// ```ignore
/// let engine = EngineBuilder::new(Dashboard::default(), catalog)
///     .command_handler("dashboard.rename", command_fn(rename))?
///     .query_handler("catalog.dateDatasets", query_fn(date_datasets))?
///     .build();
/// ```
pub struct EngineBuilder<M: Model, B> {
    initial: M,
    backend: Arc<B>,
    bus: Option<EventBus>,
    config: EngineConfig,
    command_handlers: CommandHandlers<M, B>,
    query_handlers: QueryHandlers<M, B>,
}

impl<M: Model, B: Send + Sync + 'static> EngineBuilder<M, B> {
    /// Start configuring an engine.
    ///
    /// # Arguments
    ///
    /// * `initial` - The starting state.
    /// * `backend` - The capability handlers reach through
    ///   [`HandlerContext::call`](crate::HandlerContext::call).
    pub fn new(initial: M, backend: B) -> Self {
        Self::with_shared_backend(initial, Arc::new(backend))
    }

    /// Like [`new`](EngineBuilder::new), with a backend shared with other
    /// components.
    pub fn with_shared_backend(initial: M, backend: Arc<B>) -> Self {
        Self {
            initial,
            backend,
            bus: None,
            config: EngineConfig::default(),
            command_handlers: HashMap::new(),
            query_handlers: HashMap::new(),
        }
    }

    /// Set the engine configuration.
    ///
    /// If not called, [`EngineConfig::default()`] is used.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish on an existing bus instead of a new one.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register the handler for a command type.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateHandler`] if the type already has
    /// a handler.
    pub fn command_handler(
        mut self,
        command_type: impl Into<String>,
        handler: impl CommandHandler<M, B>,
    ) -> Result<Self, DispatchError> {
        let command_type = command_type.into();
        if self.command_handlers.contains_key(&command_type) {
            return Err(DispatchError::DuplicateHandler(command_type));
        }
        self.command_handlers.insert(command_type, Arc::new(handler));
        Ok(self)
    }

    /// Register the handler for a query type.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::DuplicateHandler`] if the type already has
    /// a handler.
    pub fn query_handler<H>(mut self, query_type: impl Into<String>, handler: H) -> Result<Self, DispatchError>
    where
        H: QueryHandler<M, B>,
    {
        let query_type = query_type.into();
        if self.query_handlers.contains_key(&query_type) {
            return Err(DispatchError::DuplicateHandler(query_type));
        }
        self.query_handlers
            .insert(query_type, Arc::new(ErasedQuery(handler)));
        Ok(self)
    }

    /// Spawn the dispatcher and return the running engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Engine<M, B> {
        let store = StateStore::new(self.initial);
        let bus = self.bus.unwrap_or_default();
        let undo = UndoLog::new(self.config.undo_depth);

        let (commands, task) = spawn_dispatcher(
            store.clone(),
            bus.clone(),
            Arc::clone(&self.backend),
            self.command_handlers,
            undo.clone(),
        );
        let queries = QueryProcessor::new(
            store.clone(),
            self.backend,
            bus.clone(),
            self.query_handlers,
            self.config.query_ttl,
            self.config.notify_queries,
            Some(commands.downgrade()),
        );

        tracing::info!(
            undo_depth = self.config.undo_depth,
            notify_queries = self.config.notify_queries,
            "engine started"
        );

        Engine {
            store,
            bus,
            commands,
            queries,
            undo,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Engines keyed by dashboard ID.
///
/// Each dashboard gets its own engine, so commands for different
/// dashboards never queue behind each other.
pub struct EngineRegistry<M: Model, B> {
    engines: RwLock<HashMap<String, Engine<M, B>>>,
}

impl<M: Model, B> Default for EngineRegistry<M, B> {
    fn default() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
        }
    }
}

impl<M: Model, B> fmt::Debug for EngineRegistry<M, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<String> = self.engines.read().keys().cloned().collect();
        ids.sort();
        f.debug_struct("EngineRegistry").field("dashboards", &ids).finish()
    }
}

impl<M: Model, B: Send + Sync + 'static> EngineRegistry<M, B> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `engine` for `dashboard_id`, returning the engine it replaces.
    pub fn insert(&self, dashboard_id: impl Into<String>, engine: Engine<M, B>) -> Option<Engine<M, B>> {
        self.engines.write().insert(dashboard_id.into(), engine)
    }

    /// The engine for `dashboard_id`.
    pub fn get(&self, dashboard_id: &str) -> Option<Engine<M, B>> {
        self.engines.read().get(dashboard_id).cloned()
    }

    /// The engine for `dashboard_id`, creating it with `create` when absent
    /// or no longer running.
    pub fn get_or_insert_with(
        &self,
        dashboard_id: &str,
        create: impl FnOnce() -> Engine<M, B>,
    ) -> Engine<M, B> {
        if let Some(engine) = self.get(dashboard_id)
            && engine.is_running()
        {
            return engine;
        }
        let mut engines = self.engines.write();
        match engines.get(dashboard_id) {
            Some(engine) if engine.is_running() => engine.clone(),
            _ => {
                let engine = create();
                engines.insert(dashboard_id.to_string(), engine.clone());
                engine
            }
        }
    }

    /// Unregister the engine for `dashboard_id`.
    ///
    /// The engine keeps running until it is shut down or dropped.
    pub fn remove(&self, dashboard_id: &str) -> Option<Engine<M, B>> {
        self.engines.write().remove(dashboard_id)
    }

    /// Registered dashboard IDs, sorted.
    pub fn dashboard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered engines.
    pub fn len(&self) -> usize {
        self.engines.read().len()
    }

    /// Whether no engine is registered.
    pub fn is_empty(&self) -> bool {
        self.engines.read().is_empty()
    }

    /// Unregister and shut down every engine.
    pub async fn shutdown_all(&self) {
        let engines: Vec<(String, Engine<M, B>)> = self.engines.write().drain().collect();
        for (dashboard_id, engine) in engines {
            if let Err(err) = engine.shutdown().await {
                tracing::warn!(%dashboard_id, error = %err, "engine shutdown failed");
            }
        }
    }
}
