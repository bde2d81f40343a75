//! Query execution with single-flight deduplication and result caching.
//!
//! Every query resolves to a cache key. At most one request per key is in
//! flight: callers arriving while it runs attach to it and receive the same
//! value. Successful results are cached until invalidated (or until their
//! TTL lapses); errors and cancellations are never served from cache.

use std::collections::HashMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::Instrument;

use crate::bus::EventBus;
use crate::command::{Command, CorrelationId};
use crate::context::{HandlerContext, HeldCommands};
use crate::dispatcher::WeakCommandQueue;
use crate::error::{DispatchError, HandlerError, QueryError};
use crate::event::{Event, QUERY_FAILED, QUERY_SUCCEEDED};
use crate::handler::{AnyValue, ErasedQueryHandler};
use crate::model::Model;
use crate::store::StateStore;

/// A request to read derived data.
///
/// # Examples
///
/// ```
/// use dashboard_engine::Query;
/// use serde_json::json;
///
/// let query = Query::new("catalog.dateDatasets", json!({"widget": "w1"}));
/// assert_eq!(query.default_cache_key(), r#"catalog.dateDatasets:{"widget":"w1"}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Routing key; must match a registered query handler.
    pub query_type: String,
    /// JSON-encoded query arguments.
    pub payload: Value,
    /// Explicit cache key, overriding the handler's derivation.
    #[serde(default)]
    pub cache_key: Option<String>,
    /// Correlation ID copied onto query events.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

impl Query {
    /// Create a query.
    pub fn new(query_type: impl Into<String>, payload: Value) -> Self {
        Self {
            query_type: query_type.into(),
            payload,
            cache_key: None,
            correlation_id: None,
        }
    }

    /// Use an explicit cache key.
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// `"{query_type}:{payload json}"`.
    pub fn default_cache_key(&self) -> String {
        format!("{}:{}", self.query_type, self.payload)
    }

    /// Decode the payload, reporting failures as validation errors.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            HandlerError::validation(format!("invalid payload for {}: {e}", self.query_type))
        })
    }
}

/// Status of a cache record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// A request is in flight.
    Loading,
    /// The last request succeeded; its value is cached.
    Success,
    /// The last request failed. The error is not served to new callers.
    Error,
    /// Every caller withdrew before the last request settled.
    Canceled,
}

type Settled = Result<AnyValue, QueryError>;

struct InFlight {
    // Changed only while the cache lock is held.
    interest: AtomicUsize,
    tx: watch::Sender<Option<Settled>>,
}

enum CacheRecord {
    Loading {
        query_type: String,
        flight: Arc<InFlight>,
    },
    Success {
        query_type: String,
        value: AnyValue,
        settled_at: Instant,
        ttl: Option<Duration>,
    },
    Error {
        query_type: String,
    },
    Canceled {
        query_type: String,
    },
}

impl CacheRecord {
    fn status(&self) -> QueryStatus {
        match self {
            Self::Loading { .. } => QueryStatus::Loading,
            Self::Success { .. } => QueryStatus::Success,
            Self::Error { .. } => QueryStatus::Error,
            Self::Canceled { .. } => QueryStatus::Canceled,
        }
    }

    fn query_type(&self) -> &str {
        match self {
            Self::Loading { query_type, .. }
            | Self::Success { query_type, .. }
            | Self::Error { query_type }
            | Self::Canceled { query_type } => query_type,
        }
    }
}

type QueryCache = Mutex<HashMap<String, CacheRecord>>;

/// What a query handler left behind when it returned.
struct Finished {
    outcome: Result<AnyValue, HandlerError>,
    children: Vec<Command>,
}

pub(crate) type QueryHandlers<M, B> = HashMap<String, Arc<dyn ErasedQueryHandler<M, B>>>;

/// Runs queries, deduplicating concurrent requests and caching results.
///
/// Cloning is cheap; clones share the cache.
pub struct QueryProcessor<M: Model, B> {
    inner: Arc<ProcessorInner<M, B>>,
}

struct ProcessorInner<M: Model, B> {
    store: StateStore<M>,
    backend: Arc<B>,
    bus: EventBus,
    handlers: QueryHandlers<M, B>,
    cache: Arc<QueryCache>,
    default_ttl: Option<Duration>,
    notify: bool,
    commands: Option<WeakCommandQueue<M, B>>,
}

impl<M: Model, B> Clone for QueryProcessor<M, B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Model, B> fmt::Debug for QueryProcessor<M, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.inner.handlers.keys().collect();
        types.sort();
        f.debug_struct("QueryProcessor")
            .field("query_types", &types)
            .field("cached", &self.inner.cache.lock().len())
            .field("default_ttl", &self.inner.default_ttl)
            .field("notify", &self.inner.notify)
            .finish()
    }
}

impl<M: Model, B: Send + Sync + 'static> QueryProcessor<M, B> {
    pub(crate) fn new(
        store: StateStore<M>,
        backend: Arc<B>,
        bus: EventBus,
        handlers: QueryHandlers<M, B>,
        default_ttl: Option<Duration>,
        notify: bool,
        commands: Option<WeakCommandQueue<M, B>>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                store,
                backend,
                bus,
                handlers,
                cache: Arc::new(Mutex::new(HashMap::new())),
                default_ttl,
                notify,
                commands,
            }),
        }
    }

    /// Start (or join) a query.
    ///
    /// Returns immediately. If the cache key has a fresh cached value, the
    /// result is already settled; if a request for the key is in flight,
    /// the caller attaches to it; otherwise a new request is spawned on the
    /// current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownQuery`] synchronously when no
    /// handler is registered for the query type.
    pub fn run<T: Send + Sync + 'static>(&self, query: Query) -> Result<QueryResult<T>, DispatchError> {
        let handler = self
            .inner
            .handlers
            .get(&query.query_type)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownQuery(query.query_type.clone()))?;
        let key = query
            .cache_key
            .clone()
            .unwrap_or_else(|| handler.cache_key(&query));

        let mut cache = self.inner.cache.lock();
        match cache.get(&key) {
            Some(CacheRecord::Loading { flight, .. }) => {
                flight.interest.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(cache_key = %key, "joining in-flight query");
                return Ok(QueryResult::pending(key, Arc::clone(flight), Arc::clone(&self.inner.cache)));
            }
            Some(CacheRecord::Success {
                value,
                settled_at,
                ttl,
                ..
            }) if ttl.is_none_or(|ttl| settled_at.elapsed() < ttl) => {
                tracing::debug!(cache_key = %key, "query served from cache");
                return Ok(QueryResult::ready(key, Arc::clone(value), Arc::clone(&self.inner.cache)));
            }
            _ => {}
        }

        let (tx, _) = watch::channel(None);
        let flight = Arc::new(InFlight {
            interest: AtomicUsize::new(1),
            tx,
        });
        cache.insert(
            key.clone(),
            CacheRecord::Loading {
                query_type: query.query_type.clone(),
                flight: Arc::clone(&flight),
            },
        );
        drop(cache);

        let result = QueryResult::pending(key.clone(), Arc::clone(&flight), Arc::clone(&self.inner.cache));
        self.spawn_flight(handler, query, key, flight);
        Ok(result)
    }

    fn spawn_flight(
        &self,
        handler: Arc<dyn ErasedQueryHandler<M, B>>,
        query: Query,
        key: String,
        flight: Arc<InFlight>,
    ) {
        let processor = self.clone();
        let ttl = handler.ttl().or(self.inner.default_ttl);
        let notify = handler.notify().unwrap_or(self.inner.notify);
        let span = tracing::debug_span!("query", query_type = %query.query_type, cache_key = %key);

        tokio::spawn(
            async move {
                let held = HeldCommands::default();
                let ctx = processor
                    .context(query.correlation_id.clone())
                    .holding_children(Arc::clone(&held));
                let task_query = query.clone();
                let joined = tokio::spawn(
                    async move { handler.run_erased(&ctx, &task_query).await }.in_current_span(),
                )
                .await;
                let outcome = joined.unwrap_or_else(|e| {
                    Err(HandlerError::Internal(format!("query handler panicked: {e}")))
                });
                let finished = Finished {
                    outcome,
                    children: std::mem::take(&mut *held.lock()),
                };
                processor.settle(&query, &key, &flight, finished, ttl, notify);
            }
            .instrument(span),
        );
    }

    fn context(&self, correlation_id: Option<CorrelationId>) -> HandlerContext<M, B> {
        let commands = self.inner.commands.as_ref().and_then(WeakCommandQueue::upgrade);
        HandlerContext::new(
            self.inner.store.clone(),
            Arc::clone(&self.inner.backend),
            commands,
            correlation_id,
        )
    }

    fn settle(
        &self,
        query: &Query,
        key: &str,
        flight: &Arc<InFlight>,
        finished: Finished,
        ttl: Option<Duration>,
        notify: bool,
    ) {
        let Finished { outcome, children } = finished;
        let mut cache = self.inner.cache.lock();
        let current = matches!(
            cache.get(key),
            Some(CacheRecord::Loading { flight: f, .. }) if Arc::ptr_eq(f, flight)
        );
        let query_type = query.query_type.clone();

        if flight.interest.load(Ordering::Acquire) == 0 {
            if current {
                cache.insert(key.to_string(), CacheRecord::Canceled { query_type });
            }
            tracing::debug!(
                children = children.len(),
                "query result discarded, no caller is waiting"
            );
            return;
        }

        // Queued under the cache lock so a cancel cannot slip in between.
        self.queue_children(children);

        let settled: Settled = outcome.map_err(QueryError::Handler);
        if current {
            let record = match &settled {
                Ok(value) => CacheRecord::Success {
                    query_type,
                    value: Arc::clone(value),
                    settled_at: Instant::now(),
                    ttl,
                },
                Err(_) => CacheRecord::Error { query_type },
            };
            cache.insert(key.to_string(), record);
        }
        flight.tx.send_replace(Some(settled.clone()));
        drop(cache);

        match &settled {
            Ok(_) => tracing::debug!("query succeeded"),
            Err(e) => tracing::warn!(error = %e, "query failed"),
        }
        if notify {
            self.inner.bus.publish(query_event(query, key, &settled));
        }
    }

    fn queue_children(&self, children: Vec<Command>) {
        if children.is_empty() {
            return;
        }
        let Some(queue) = self.inner.commands.as_ref().and_then(WeakCommandQueue::upgrade) else {
            tracing::warn!(children = children.len(), "engine stopped, child commands dropped");
            return;
        };
        for child in children {
            let command_type = child.command_type.clone();
            if let Err(err) = queue.enqueue(child, true) {
                tracing::warn!(%command_type, error = %err, "child command not queued");
            }
        }
    }

    /// Status of the record for `cache_key`, if any.
    pub fn status(&self, cache_key: &str) -> Option<QueryStatus> {
        self.inner.cache.lock().get(cache_key).map(CacheRecord::status)
    }

    /// Drop the record for `cache_key` so the next call re-fetches.
    ///
    /// Callers already attached to an in-flight request still receive its
    /// result, but the result is no longer cached.
    pub fn invalidate(&self, cache_key: &str) -> bool {
        let removed = self.inner.cache.lock().remove(cache_key).is_some();
        if removed {
            tracing::debug!(cache_key, "query cache entry invalidated");
        }
        removed
    }

    /// Drop every record belonging to `query_type`.
    pub fn invalidate_type(&self, query_type: &str) -> usize {
        let mut cache = self.inner.cache.lock();
        let before = cache.len();
        cache.retain(|_, record| record.query_type() != query_type);
        before - cache.len()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.inner.cache.lock().clear();
    }
}

fn query_event(query: &Query, key: &str, settled: &Settled) -> Event {
    let event = match settled {
        Ok(_) => Event::new(
            QUERY_SUCCEEDED,
            json!({"query_type": query.query_type, "cache_key": key}),
        ),
        Err(err) => {
            let (kind, message) = match err {
                QueryError::Handler(h) => (Some(h.kind()), h.message().to_string()),
                other => (None, other.to_string()),
            };
            Event::new(
                QUERY_FAILED,
                json!({
                    "query_type": query.query_type,
                    "cache_key": key,
                    "kind": kind,
                    "message": message,
                }),
            )
        }
    };
    match &query.correlation_id {
        Some(id) => event.with_correlation_id(id.clone()),
        None => event,
    }
}

struct CancelState {
    canceled: AtomicBool,
    wake: Notify,
}

enum Source {
    Cached(AnyValue),
    Flight(Arc<InFlight>),
}

/// Handle to a pending or settled query.
///
/// Await it (it implements [`IntoFuture`]) to get the value as `Arc<T>`;
/// every caller attached to the same request receives the same `Arc`.
/// Dropping the handle before it settles withdraws the caller's interest,
/// as does [`cancel`](QueryResult::cancel).
#[must_use = "dropping a QueryResult cancels the caller's interest"]
pub struct QueryResult<T> {
    cache_key: String,
    source: Source,
    cache: Arc<QueryCache>,
    cancel: Arc<CancelState>,
    settled: bool,
    _output: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for QueryResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("cache_key", &self.cache_key)
            .field("from_cache", &matches!(self.source, Source::Cached(_)))
            .field("canceled", &self.cancel.canceled.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + Sync + 'static> QueryResult<T> {
    fn ready(cache_key: String, value: AnyValue, cache: Arc<QueryCache>) -> Self {
        Self::with_source(cache_key, Source::Cached(value), cache)
    }

    fn pending(cache_key: String, flight: Arc<InFlight>, cache: Arc<QueryCache>) -> Self {
        Self::with_source(cache_key, Source::Flight(flight), cache)
    }

    fn with_source(cache_key: String, source: Source, cache: Arc<QueryCache>) -> Self {
        Self {
            cache_key,
            source,
            cache,
            cancel: Arc::new(CancelState {
                canceled: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            settled: false,
            _output: PhantomData,
        }
    }

    /// The cache key this result belongs to.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Whether the value was served from cache without a new request.
    pub fn from_cache(&self) -> bool {
        matches!(self.source, Source::Cached(_))
    }

    /// Withdraw interest. Awaiting afterwards yields [`QueryError::Canceled`].
    pub fn cancel(&self) {
        self.canceler().cancel();
    }

    /// A cloneable handle that cancels this result from elsewhere.
    pub fn canceler(&self) -> QueryCanceler {
        QueryCanceler {
            state: Arc::clone(&self.cancel),
            flight: match &self.source {
                Source::Flight(flight) => Some(Arc::clone(flight)),
                Source::Cached(_) => None,
            },
            cache: Arc::clone(&self.cache),
        }
    }

    /// Wait for the value.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Handler`] if the request failed.
    /// - [`QueryError::Canceled`] if this caller canceled.
    /// - [`QueryError::TypeMismatch`] if the handler produces a type other
    ///   than `T`.
    pub async fn wait(mut self) -> Result<Arc<T>, QueryError> {
        let value = match &self.source {
            Source::Cached(value) if !self.is_canceled() => Ok(Arc::clone(value)),
            Source::Cached(_) => Err(QueryError::Canceled),
            Source::Flight(flight) => {
                let flight = Arc::clone(flight);
                self.await_flight(&flight).await
            }
        };
        self.settled = true;
        value?
            .downcast::<T>()
            .map_err(|_| QueryError::TypeMismatch(self.cache_key.clone()))
    }

    async fn await_flight(&self, flight: &InFlight) -> Result<AnyValue, QueryError> {
        let mut rx = flight.tx.subscribe();
        loop {
            if self.is_canceled() {
                return Err(QueryError::Canceled);
            }
            if let Some(settled) = rx.borrow_and_update().clone() {
                return settled;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return rx.borrow().clone().unwrap_or(Err(QueryError::Abandoned));
                    }
                }
                () = self.cancel.wake.notified() => {}
            }
        }
    }

    fn is_canceled(&self) -> bool {
        self.cancel.canceled.load(Ordering::Acquire)
    }
}

impl<T> Drop for QueryResult<T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Source::Flight(flight) = &self.source {
            withdraw(&self.cache, &self.cancel, flight);
        }
    }
}

impl<T: Send + Sync + 'static> IntoFuture for QueryResult<T> {
    type Output = Result<Arc<T>, QueryError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

/// Cancels a [`QueryResult`] from another task.
#[derive(Clone)]
pub struct QueryCanceler {
    state: Arc<CancelState>,
    flight: Option<Arc<InFlight>>,
    cache: Arc<QueryCache>,
}

impl fmt::Debug for QueryCanceler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCanceler")
            .field("canceled", &self.state.canceled.load(Ordering::Relaxed))
            .finish()
    }
}

impl QueryCanceler {
    /// Withdraw the caller's interest. Idempotent.
    pub fn cancel(&self) {
        match &self.flight {
            Some(flight) => withdraw(&self.cache, &self.state, flight),
            None => {
                self.state.canceled.store(true, Ordering::Release);
            }
        }
        self.state.wake.notify_one();
    }
}

fn withdraw(cache: &QueryCache, state: &CancelState, flight: &InFlight) {
    let _cache = cache.lock();
    if state.canceled.swap(true, Ordering::AcqRel) {
        return;
    }
    let _ = flight
        .interest
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;
    use crate::bus::EventFilter;
    use crate::command::CommandOutcome;
    use crate::dispatcher::{CommandHandlers, CommandQueue, spawn_dispatcher};
    use crate::handler::{ErasedQuery, command_fn, query_fn};
    use crate::model::test_fixtures::{Dashboard, DashboardMutation, FakeCatalog};
    use crate::undo::UndoLog;

    const DATASETS: &str = "catalog.dateDatasets";

    async fn date_datasets(
        ctx: HandlerContext<Dashboard, FakeCatalog>,
        query: Query,
    ) -> Result<Vec<String>, HandlerError> {
        let widget: String = query.payload_as()?;
        ctx.call(move |catalog| async move { catalog.date_datasets(&widget).await })
            .await
    }

    async fn panicking(
        _ctx: HandlerContext<Dashboard, FakeCatalog>,
        _query: Query,
    ) -> Result<Vec<String>, HandlerError> {
        panic!("handler bug")
    }

    fn processor_with(
        catalog: FakeCatalog,
        ttl: Option<Duration>,
        notify: bool,
    ) -> (QueryProcessor<Dashboard, FakeCatalog>, Arc<FakeCatalog>, EventBus) {
        let catalog = Arc::new(catalog);
        let bus = EventBus::new();
        let mut handlers: QueryHandlers<Dashboard, FakeCatalog> = HashMap::new();
        handlers.insert(DATASETS.into(), Arc::new(ErasedQuery(query_fn(date_datasets))));
        handlers.insert("broken".into(), Arc::new(ErasedQuery(query_fn(panicking))));
        let processor = QueryProcessor::new(
            StateStore::new(Dashboard::default()),
            Arc::clone(&catalog),
            bus.clone(),
            handlers,
            ttl,
            notify,
            None,
        );
        (processor, catalog, bus)
    }

    fn datasets(widget: &str) -> Query {
        Query::new(DATASETS, json!(widget))
    }

    fn record_events(bus: &EventBus) -> (Arc<Mutex<Vec<Event>>>, crate::bus::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(EventFilter::All, move |e| sink.lock().push(e.clone()));
        (seen, sub)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_request() {
        let (processor, catalog, _bus) =
            processor_with(FakeCatalog::with_delay(Duration::from_millis(10)), None, false);

        let first = processor.run::<Vec<String>>(datasets("w1")).expect("query type is registered");
        let second = processor.run::<Vec<String>>(datasets("w1")).expect("query type is registered");
        assert_eq!(processor.status(first.cache_key()), Some(QueryStatus::Loading));

        let (a, b) = tokio::join!(first.wait(), second.wait());
        let a = a.expect("first caller should get a value");
        let b = b.expect("second caller should get a value");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(catalog.call_count(), 1);
    }

    #[tokio::test]
    async fn settled_value_is_served_from_cache() {
        let (processor, catalog, _bus) = processor_with(FakeCatalog::default(), None, false);

        let first = processor
            .run::<Vec<String>>(datasets("w1"))
            .expect("query type is registered")
            .await
            .expect("query should succeed");
        let again = processor.run::<Vec<String>>(datasets("w1")).expect("query type is registered");
        assert!(again.from_cache());
        let second = again.await.expect("cached query should succeed");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(catalog.call_count(), 1);
        assert_eq!(processor.status("catalog.dateDatasets:\"w1\""), Some(QueryStatus::Success));
    }

    #[tokio::test]
    async fn different_keys_are_independent() {
        let (processor, catalog, _bus) = processor_with(FakeCatalog::default(), None, false);

        let w1 = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        let w2 = processor.run::<Vec<String>>(datasets("w2")).expect("registered");
        let (w1, w2) = tokio::join!(w1.wait(), w2.wait());

        assert_eq!(w1.expect("w1 should load")[0], "w1.created");
        assert_eq!(w2.expect("w2 should load")[0], "w2.created");
        assert_eq!(catalog.call_count(), 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let (processor, catalog, _bus) = processor_with(FakeCatalog::failing(1), None, false);

        let err = processor
            .run::<Vec<String>>(datasets("w1"))
            .expect("registered")
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Handler(HandlerError::External("catalog unavailable".into())));

        let retry = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        assert!(!retry.from_cache());
        retry.await.expect("retry should succeed");
        assert_eq!(catalog.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn canceling_last_caller_discards_result() {
        let (processor, catalog, bus) =
            processor_with(FakeCatalog::with_delay(Duration::from_millis(10)), None, true);
        let (events, _sub) = record_events(&bus);

        let result = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        let key = result.cache_key().to_string();
        result.cancel();
        assert_eq!(result.await.unwrap_err(), QueryError::Canceled);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(catalog.call_count(), 1);
        assert_eq!(processor.status(&key), Some(QueryStatus::Canceled));
        assert!(events.lock().is_empty());
    }

    async fn rename_from_query(
        ctx: HandlerContext<Dashboard, FakeCatalog>,
        query: Query,
    ) -> Result<Vec<String>, HandlerError> {
        let title: String = query.payload_as()?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.dispatch_child(Command::new("dashboard.rename", json!({ "title": title })))?;
        Ok(Vec::new())
    }

    async fn rename(
        _ctx: HandlerContext<Dashboard, FakeCatalog>,
        command: Command,
    ) -> Result<CommandOutcome<DashboardMutation>, HandlerError> {
        let title: String = command.payload["title"]
            .as_str()
            .ok_or_else(|| HandlerError::validation("title is required"))?
            .to_string();
        Ok(CommandOutcome::new().mutation(DashboardMutation::Rename { title }))
    }

    /// A processor wired to a running dispatcher, so query handlers can
    /// issue child commands.
    fn processor_with_commands() -> (
        QueryProcessor<Dashboard, FakeCatalog>,
        CommandQueue<Dashboard, FakeCatalog>,
        StateStore<Dashboard>,
        EventBus,
    ) {
        let store = StateStore::new(Dashboard::default());
        let bus = EventBus::new();
        let catalog = Arc::new(FakeCatalog::default());
        let mut commands: CommandHandlers<Dashboard, FakeCatalog> = HashMap::new();
        commands.insert("dashboard.rename".into(), Arc::new(command_fn(rename)));
        let (queue, _task) = spawn_dispatcher(
            store.clone(),
            bus.clone(),
            Arc::clone(&catalog),
            commands,
            UndoLog::new(10),
        );
        let mut handlers: QueryHandlers<Dashboard, FakeCatalog> = HashMap::new();
        handlers.insert("renameFromQuery".into(), Arc::new(ErasedQuery(query_fn(rename_from_query))));
        let processor = QueryProcessor::new(
            store.clone(),
            catalog,
            bus.clone(),
            handlers,
            None,
            false,
            Some(queue.downgrade()),
        );
        (processor, queue, store, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_query_does_not_queue_child_commands() {
        let (processor, _queue, store, bus) = processor_with_commands();
        let (events, _sub) = record_events(&bus);

        let result = processor
            .run::<Vec<String>>(Query::new("renameFromQuery", json!("from-canceled-query")))
            .expect("registered");
        let key = result.cache_key().to_string();
        result.cancel();
        drop(result);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(processor.status(&key), Some(QueryStatus::Canceled));
        assert_eq!(store.read(|d| d.title.clone()), "");
        assert!(events.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn child_commands_run_once_query_settles() {
        let (processor, _queue, store, bus) = processor_with_commands();
        let mut renamed = bus.stream(EventFilter::All);

        processor
            .run::<Vec<String>>(
                Query::new("renameFromQuery", json!("from-query")).with_correlation_id("q-1"),
            )
            .expect("registered")
            .await
            .expect("query should succeed");

        let event = tokio::time::timeout(Duration::from_secs(1), renamed.next())
            .await
            .expect("child event should arrive")
            .expect("bus should stay open");
        assert_eq!(event.causation_id.as_deref(), Some("q-1"));
        assert_eq!(store.read(|d| d.title.clone()), "from-query");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_result_withdraws_interest() {
        let (processor, _catalog, _bus) =
            processor_with(FakeCatalog::with_delay(Duration::from_millis(10)), None, false);

        let result = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        let key = result.cache_key().to_string();
        drop(result);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.status(&key), Some(QueryStatus::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn one_caller_canceling_does_not_affect_others() {
        let (processor, _catalog, _bus) =
            processor_with(FakeCatalog::with_delay(Duration::from_millis(10)), None, false);

        let leaving = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        let staying = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        let canceler = leaving.canceler();

        let waiter = tokio::spawn(leaving.wait());
        canceler.cancel();

        assert_eq!(
            waiter.await.expect("task should not panic").unwrap_err(),
            QueryError::Canceled
        );
        staying.await.expect("remaining caller should get the value");
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let (processor, catalog, _bus) = processor_with(FakeCatalog::default(), None, false);

        let first = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        let key = first.cache_key().to_string();
        first.await.expect("query should succeed");

        assert!(processor.invalidate(&key));
        assert_eq!(processor.status(&key), None);

        processor
            .run::<Vec<String>>(datasets("w1"))
            .expect("registered")
            .await
            .expect("refetch should succeed");
        assert_eq!(catalog.call_count(), 2);
    }

    #[tokio::test]
    async fn invalidate_type_drops_all_keys_of_type() {
        let (processor, _catalog, _bus) = processor_with(FakeCatalog::default(), None, false);
        for widget in ["w1", "w2"] {
            processor
                .run::<Vec<String>>(datasets(widget))
                .expect("registered")
                .await
                .expect("query should succeed");
        }
        assert_eq!(processor.invalidate_type(DATASETS), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_cached_values() {
        let (processor, catalog, _bus) =
            processor_with(FakeCatalog::default(), Some(Duration::from_secs(1)), false);

        processor
            .run::<Vec<String>>(datasets("w1"))
            .expect("registered")
            .await
            .expect("query should succeed");
        tokio::time::advance(Duration::from_secs(2)).await;

        let again = processor.run::<Vec<String>>(datasets("w1")).expect("registered");
        assert!(!again.from_cache());
        again.await.expect("refetch should succeed");
        assert_eq!(catalog.call_count(), 2);
    }

    #[test]
    fn unknown_query_type_fails_synchronously() {
        let (processor, _catalog, _bus) = processor_with(FakeCatalog::default(), None, false);
        let err = processor
            .run::<Vec<String>>(Query::new("nope", Value::Null))
            .unwrap_err();
        assert_eq!(err, DispatchError::UnknownQuery("nope".into()));
    }

    #[tokio::test]
    async fn wrong_output_type_is_reported() {
        let (processor, _catalog, _bus) = processor_with(FakeCatalog::default(), None, false);
        let err = processor
            .run::<String>(datasets("w1"))
            .expect("registered")
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal_error() {
        let (processor, _catalog, _bus) = processor_with(FakeCatalog::default(), None, false);
        let err = processor
            .run::<Vec<String>>(Query::new("broken", Value::Null))
            .expect("registered")
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Handler(HandlerError::Internal(_))));
    }

    #[tokio::test]
    async fn notifications_carry_correlation_id() {
        let (processor, _catalog, bus) = processor_with(FakeCatalog::failing(1), None, true);
        let (events, _sub) = record_events(&bus);

        let _ = processor
            .run::<Vec<String>>(datasets("w1").with_correlation_id("q-1"))
            .expect("registered")
            .await;
        processor
            .run::<Vec<String>>(datasets("w1").with_correlation_id("q-2"))
            .expect("registered")
            .await
            .expect("retry should succeed");

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, QUERY_FAILED);
        assert!(events[0].correlates_with("q-1"));
        assert_eq!(events[0].payload["kind"], "external");
        assert_eq!(events[1].event_type, QUERY_SUCCEEDED);
        assert!(events[1].correlates_with("q-2"));
    }
}
