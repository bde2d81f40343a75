//! The attribute filter loader: paged element loading through the query
//! processor plus the staged selection, announced on the event bus.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;

use super::elements::{
    AttributeFilterDefinition, AttributeMetadata, AttributeRef, Element, ElementsBackend,
    ElementsPage, LoadOptions, SortOrder,
};
use super::selection::{ElementKey, Selection};
use super::state::{FilterMutation, FilterState, FilterStateError, FilterStatus, LoadOp, OperationStatus};
use crate::bus::EventBus;
use crate::command::{CorrelationId, new_correlation_id};
use crate::config::FilterConfig;
use crate::context::HandlerContext;
use crate::error::{FilterError, HandlerError, QueryError};
use crate::event::Event;
use crate::handler::{ErasedQuery, query_fn};
use crate::query::{Query, QueryCanceler, QueryHandlers, QueryProcessor};
use crate::store::StateStore;

/// Event types published by the loader. Every payload carries `filter_id`.
pub mod events {
    pub const INIT_STARTED: &str = "filter.init.started";
    pub const INIT_SUCCEEDED: &str = "filter.init.succeeded";
    pub const INIT_FAILED: &str = "filter.init.failed";
    pub const INIT_CANCELED: &str = "filter.init.canceled";

    pub const ATTRIBUTE_LOAD_STARTED: &str = "filter.attribute.load.started";
    pub const ATTRIBUTE_LOAD_SUCCEEDED: &str = "filter.attribute.load.succeeded";
    pub const ATTRIBUTE_LOAD_FAILED: &str = "filter.attribute.load.failed";
    pub const ATTRIBUTE_LOAD_CANCELED: &str = "filter.attribute.load.canceled";

    /// Payload carries `page` (`"initial"` or `"next"`) and `offset`.
    pub const PAGE_STARTED: &str = "filter.elements.page.started";
    pub const PAGE_SUCCEEDED: &str = "filter.elements.page.succeeded";
    pub const PAGE_FAILED: &str = "filter.elements.page.failed";
    pub const PAGE_CANCELED: &str = "filter.elements.page.canceled";

    pub const CUSTOM_STARTED: &str = "filter.elements.custom.started";
    pub const CUSTOM_SUCCEEDED: &str = "filter.elements.custom.succeeded";
    pub const CUSTOM_FAILED: &str = "filter.elements.custom.failed";
    pub const CUSTOM_CANCELED: &str = "filter.elements.custom.canceled";

    /// Published on every working selection change, including revert.
    pub const SELECTION_CHANGED: &str = "filter.selection.changed";
    /// Published only when the working selection is committed.
    pub const SELECTION_COMMITTED: &str = "filter.selection.committed";
}

const LOAD_ATTRIBUTE: &str = "attributeFilter.loadAttribute";
const LOAD_ELEMENTS: &str = "attributeFilter.loadElements";

struct OpEvents {
    started: &'static str,
    succeeded: &'static str,
    failed: &'static str,
    canceled: &'static str,
}

const INIT_EVENTS: OpEvents = OpEvents {
    started: events::INIT_STARTED,
    succeeded: events::INIT_SUCCEEDED,
    failed: events::INIT_FAILED,
    canceled: events::INIT_CANCELED,
};

const ATTRIBUTE_EVENTS: OpEvents = OpEvents {
    started: events::ATTRIBUTE_LOAD_STARTED,
    succeeded: events::ATTRIBUTE_LOAD_SUCCEEDED,
    failed: events::ATTRIBUTE_LOAD_FAILED,
    canceled: events::ATTRIBUTE_LOAD_CANCELED,
};

const PAGE_EVENTS: OpEvents = OpEvents {
    started: events::PAGE_STARTED,
    succeeded: events::PAGE_SUCCEEDED,
    failed: events::PAGE_FAILED,
    canceled: events::PAGE_CANCELED,
};

const CUSTOM_EVENTS: OpEvents = OpEvents {
    started: events::CUSTOM_STARTED,
    succeeded: events::CUSTOM_SUCCEEDED,
    failed: events::CUSTOM_FAILED,
    canceled: events::CUSTOM_CANCELED,
};

#[derive(Serialize, Deserialize)]
struct ElementsRequest {
    attribute: AttributeRef,
    options: LoadOptions,
}

async fn load_attribute<B: ElementsBackend>(
    ctx: HandlerContext<FilterState, B>,
    query: Query,
) -> Result<AttributeMetadata, HandlerError> {
    let attribute: AttributeRef = query.payload_as()?;
    ctx.call(move |backend| async move { backend.load_attribute(&attribute).await })
        .await
}

async fn load_elements<B: ElementsBackend>(
    ctx: HandlerContext<FilterState, B>,
    query: Query,
) -> Result<ElementsPage, HandlerError> {
    let ElementsRequest { attribute, options } = query.payload_as()?;
    ctx.call(move |backend| async move { backend.load_elements(&attribute, &options).await })
        .await
}

/// Key under which the cancelers of running loads are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot {
    Op(LoadOp),
    Custom(CorrelationId),
}

struct RunningLoad {
    request: u64,
    canceler: QueryCanceler,
}

struct LoaderInner<B: ElementsBackend> {
    filter_id: String,
    store: StateStore<FilterState>,
    queries: QueryProcessor<FilterState, B>,
    bus: EventBus,
    config: FilterConfig,
    requests: AtomicU64,
    running: Mutex<HashMap<Slot, Vec<RunningLoad>>>,
}

/// Loads and caches the elements of one attribute filter and keeps its
/// working and committed selection.
///
/// Element requests go through a private [`QueryProcessor`], so identical
/// requests in flight at the same time reach the backend once and loaded
/// pages are cached by their [`LoadOptions`]. Progress and selection changes
/// are published on the event bus given to the builder (typically the
/// engine's).
///
/// Load operations are `async` and settle with the outcome; the matching
/// `*.succeeded` / `*.failed` / `*.canceled` event is published before they
/// return. `Clone` is cheap, so a clone can cancel a load another task is
/// awaiting.
pub struct AttributeFilterLoader<B: ElementsBackend> {
    inner: Arc<LoaderInner<B>>,
}

impl<B: ElementsBackend> Clone for AttributeFilterLoader<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: ElementsBackend> fmt::Debug for AttributeFilterLoader<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeFilterLoader")
            .field("filter_id", &self.inner.filter_id)
            .field("attribute", self.inner.store.snapshot().attribute_ref())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl<B: ElementsBackend> AttributeFilterLoader<B> {
    /// Start configuring a loader for `attribute`.
    pub fn builder(
        filter_id: impl Into<String>,
        attribute: AttributeRef,
        backend: Arc<B>,
    ) -> AttributeFilterLoaderBuilder<B> {
        AttributeFilterLoaderBuilder {
            filter_id: filter_id.into(),
            attribute,
            backend,
            bus: None,
            config: FilterConfig::default(),
            selection: Selection::all(),
            limiting_filters: Vec::new(),
        }
    }

    pub fn filter_id(&self) -> &str {
        &self.inner.filter_id
    }

    // --- lifecycle ---

    /// Load the attribute, the first page of elements and any selected
    /// elements the first page did not contain.
    ///
    /// # Errors
    ///
    /// The first failing step's error; the filter status becomes
    /// [`FilterStatus::Error`].
    pub async fn init(&self, correlation: Option<CorrelationId>) -> Result<(), FilterError> {
        let correlation = correlation.unwrap_or_else(new_correlation_id);
        let request = self.start(LoadOp::Init);
        self.emit(INIT_EVENTS.started, Some(&correlation), json!({}));

        let outcome = self
            .init_steps(&correlation)
            .await
            .and_then(|()| self.settle_loaded(LoadOp::Init, request, FilterMutation::InitFinished { request }));
        match outcome {
            Ok(()) => {
                self.emit(INIT_EVENTS.succeeded, Some(&correlation), json!({}));
                tracing::info!(filter_id = %self.inner.filter_id, "attribute filter initialized");
                Ok(())
            }
            Err(err) => Err(self.settle_error(LoadOp::Init, request, &correlation, err, &INIT_EVENTS, json!({}))),
        }
    }

    async fn init_steps(&self, correlation: &CorrelationId) -> Result<(), FilterError> {
        self.load_attribute(Some(correlation.clone())).await?;
        self.load_initial_elements_page(Some(correlation.clone())).await?;

        let missing: BTreeSet<ElementKey> = self.inner.store.read(|s| {
            let selection = s.selection();
            selection
                .committed()
                .keys
                .iter()
                .chain(&selection.working().keys)
                .filter(|key| !s.is_cached(key))
                .cloned()
                .collect()
        });
        if !missing.is_empty() {
            self.load_custom_elements(LoadOptions::for_keys(missing), Some(correlation.clone()))
                .await?;
        }
        Ok(())
    }

    /// Load the attribute metadata.
    pub async fn load_attribute(&self, correlation: Option<CorrelationId>) -> Result<(), FilterError> {
        let correlation = correlation.unwrap_or_else(new_correlation_id);
        self.cancel_slot(&Slot::Op(LoadOp::Attribute));
        let request = self.start(LoadOp::Attribute);
        self.emit(ATTRIBUTE_EVENTS.started, Some(&correlation), json!({}));

        let attribute = self.inner.store.read(|s| s.attribute_ref().clone());
        let query = Query::new(LOAD_ATTRIBUTE, json!(attribute)).with_correlation_id(correlation.clone());
        let outcome = self
            .run_tracked::<AttributeMetadata>(Slot::Op(LoadOp::Attribute), request, query)
            .await
            .and_then(|metadata| {
                let payload = json!({ "attribute": metadata.as_ref() });
                let loaded = FilterMutation::AttributeLoaded {
                    request,
                    metadata: (*metadata).clone(),
                };
                self.settle_loaded(LoadOp::Attribute, request, loaded).map(|()| payload)
            });
        match outcome {
            Ok(payload) => {
                self.emit(ATTRIBUTE_EVENTS.succeeded, Some(&correlation), payload);
                Ok(())
            }
            Err(err) => Err(self.settle_error(
                LoadOp::Attribute,
                request,
                &correlation,
                err,
                &ATTRIBUTE_EVENTS,
                json!({}),
            )),
        }
    }

    /// Cancel a running attribute load.
    pub fn cancel_attribute_load(&self) -> bool {
        self.cancel_slot(&Slot::Op(LoadOp::Attribute))
    }

    // --- element pages ---

    /// Load the first page with the current options, replacing the element
    /// list once it arrives. Running page loads are canceled.
    pub async fn load_initial_elements_page(&self, correlation: Option<CorrelationId>) -> Result<(), FilterError> {
        self.cancel_page_loads();
        let options = self.inner.store.read(|s| s.options().clone().with_offset(0));
        self.load_page(LoadOp::InitialPage, options, correlation).await
    }

    /// Load the page after the last loaded element and append it.
    ///
    /// Calls made while a next page is already loading join it: they share
    /// its backend request and settle with it, and canceling the next page
    /// cancels every one of them.
    ///
    /// # Errors
    ///
    /// * [`FilterError::NoPageLoaded`] -- nothing is loaded for the current
    ///   options yet.
    /// * [`FilterError::NoNextPage`] -- everything is loaded.
    pub async fn load_next_elements_page(&self, correlation: Option<CorrelationId>) -> Result<(), FilterError> {
        let options = self.inner.store.read(|s| {
            if s.total_count_with_current_settings().is_none() {
                return Err(FilterError::NoPageLoaded);
            }
            if !s.has_next_page() {
                return Err(FilterError::NoNextPage);
            }
            Ok(s.options().clone().with_offset(s.offset()))
        })?;
        self.load_page(LoadOp::NextPage, options, correlation).await
    }

    pub fn cancel_initial_elements_page_load(&self) -> bool {
        self.cancel_slot(&Slot::Op(LoadOp::InitialPage))
    }

    pub fn cancel_next_elements_page_load(&self) -> bool {
        self.cancel_slot(&Slot::Op(LoadOp::NextPage))
    }

    async fn load_page(
        &self,
        op: LoadOp,
        options: LoadOptions,
        correlation: Option<CorrelationId>,
    ) -> Result<(), FilterError> {
        let correlation = correlation.unwrap_or_else(new_correlation_id);
        let page_name = if op == LoadOp::InitialPage { "initial" } else { "next" };
        let offset = options.offset;
        let request = self.join_or_start(op);
        self.emit(
            PAGE_EVENTS.started,
            Some(&correlation),
            json!({ "page": page_name, "offset": offset }),
        );

        let query = self.elements_query(options, &correlation);
        let outcome = self
            .run_tracked::<ElementsPage>(Slot::Op(op), request, query)
            .await
            .and_then(|page| {
                let payload = json!({
                    "page": page_name,
                    "offset": offset,
                    "count": page.elements.len(),
                    "total_count": page.total_count,
                });
                self.settle_loaded(op, request, FilterMutation::PageLoaded { op, request, page })
                    .map(|()| payload)
            });
        match outcome {
            Ok(payload) => {
                self.emit(PAGE_EVENTS.succeeded, Some(&correlation), payload);
                Ok(())
            }
            Err(err) => Err(self.settle_error(
                op,
                request,
                &correlation,
                err,
                &PAGE_EVENTS,
                json!({ "page": page_name, "offset": offset }),
            )),
        }
    }

    // --- custom elements ---

    /// Load elements matching `options` into the cache without touching
    /// the element list, for example to resolve titles of selected keys.
    ///
    /// The limit is capped at [`FilterConfig::custom_elements_limit`]; a
    /// zero limit means the cap.
    pub async fn load_custom_elements(
        &self,
        mut options: LoadOptions,
        correlation: Option<CorrelationId>,
    ) -> Result<Arc<ElementsPage>, FilterError> {
        let correlation = correlation.unwrap_or_else(new_correlation_id);
        let cap = self.inner.config.custom_elements_limit;
        if options.limit == 0 || options.limit > cap {
            options.limit = cap;
        }
        self.emit(CUSTOM_EVENTS.started, Some(&correlation), json!({}));

        let request = self.next_request();
        let query = self.elements_query(options, &correlation);
        let slot = Slot::Custom(correlation.clone());
        match self.run_tracked::<ElementsPage>(slot, request, query).await {
            Ok(page) => {
                self.update(FilterMutation::ElementsCached {
                    elements: page.elements.clone(),
                });
                self.emit(
                    CUSTOM_EVENTS.succeeded,
                    Some(&correlation),
                    json!({ "count": page.elements.len(), "total_count": page.total_count }),
                );
                Ok(page)
            }
            Err(FilterError::Canceled) => {
                self.emit(CUSTOM_EVENTS.canceled, Some(&correlation), json!({}));
                Err(FilterError::Canceled)
            }
            Err(err) => {
                tracing::warn!(filter_id = %self.inner.filter_id, error = %err, "custom elements load failed");
                self.emit(
                    CUSTOM_EVENTS.failed,
                    Some(&correlation),
                    json!({ "error": err.to_string() }),
                );
                Err(err)
            }
        }
    }

    /// Cancel the custom elements load started with `correlation`.
    pub fn cancel_custom_elements_load(&self, correlation: &str) -> bool {
        self.cancel_slot(&Slot::Custom(correlation.to_string()))
    }

    // --- load options ---

    /// Change the page size. Cancels page loads and clears the element list.
    pub fn set_limit(&self, limit: u32) {
        self.change_options(FilterMutation::SetLimit(limit));
    }

    /// Change the sort order. Cancels page loads and clears the element list.
    pub fn set_order(&self, order: SortOrder) {
        self.change_options(FilterMutation::SetOrder(order));
    }

    /// Change the title search. Cancels page loads and clears the element
    /// list.
    pub fn set_search(&self, search: impl Into<String>) {
        self.change_options(FilterMutation::SetSearch(search.into()));
    }

    /// Change the filters limiting the offered elements. Cancels page loads
    /// and clears the element list.
    pub fn set_limiting_filters(&self, filters: Vec<AttributeFilterDefinition>) {
        self.change_options(FilterMutation::SetLimitingFilters(filters));
    }

    fn change_options(&self, mutation: FilterMutation) {
        self.cancel_page_loads();
        self.update(mutation);
    }

    // --- selection ---

    /// Replace the working selection.
    pub fn change_selection(&self, selection: Selection) {
        self.update(FilterMutation::ChangeSelection(selection));
        self.emit_selection(events::SELECTION_CHANGED, |s| s.selection().working());
    }

    /// Select one element or none, in include mode.
    pub fn change_single_selection(&self, key: Option<ElementKey>) {
        self.change_selection(Selection::single(key));
    }

    /// Copy the working selection to the committed one.
    pub fn commit_selection(&self) {
        self.update(FilterMutation::CommitSelection);
        self.emit_selection(events::SELECTION_COMMITTED, |s| s.selection().committed());
    }

    /// Reset the working selection to the committed one.
    pub fn revert_selection(&self) {
        self.update(FilterMutation::RevertSelection);
        self.emit_selection(events::SELECTION_CHANGED, |s| s.selection().working());
    }

    /// Flip the working selection between include and exclude.
    ///
    /// Keys are kept as they are. While [`is_fully_loaded`](Self::is_fully_loaded)
    /// is false, callers should not offer inversion: the user has not seen
    /// every element the inverted selection covers.
    pub fn invert_selection(&self) {
        self.update(FilterMutation::InvertSelection);
        self.emit_selection(events::SELECTION_CHANGED, |s| s.selection().working());
    }

    /// Set the working selection to everything.
    pub fn clear_selection(&self) {
        self.update(FilterMutation::ClearSelection);
        self.emit_selection(events::SELECTION_CHANGED, |s| s.selection().working());
    }

    pub fn working_selection(&self) -> Selection {
        self.inner.store.read(|s| s.selection().working().clone())
    }

    pub fn committed_selection(&self) -> Selection {
        self.inner.store.read(|s| s.selection().committed().clone())
    }

    /// The working selection's single key.
    ///
    /// # Errors
    ///
    /// [`FilterError::NotSingleSelection`] for inverted or multi-key
    /// selections.
    pub fn working_single_selection(&self) -> Result<Option<ElementKey>, FilterError> {
        self.inner.store.read(|s| {
            s.selection()
                .working()
                .single_key()
                .map(|key| key.map(str::to_string))
        })
    }

    /// The committed selection's single key.
    ///
    /// # Errors
    ///
    /// [`FilterError::NotSingleSelection`] for inverted or multi-key
    /// selections.
    pub fn committed_single_selection(&self) -> Result<Option<ElementKey>, FilterError> {
        self.inner.store.read(|s| {
            s.selection()
                .committed()
                .single_key()
                .map(|key| key.map(str::to_string))
        })
    }

    pub fn is_working_selection_changed(&self) -> bool {
        self.inner.store.read(|s| s.selection().is_changed())
    }

    /// Whether the working selection selects nothing. An empty exclude
    /// selection selects everything, so it is not empty.
    pub fn is_working_selection_empty(&self) -> bool {
        self.inner.store.read(|s| s.selection().is_working_empty())
    }

    /// The committed selection as a filter definition.
    pub fn filter(&self) -> AttributeFilterDefinition {
        self.inner.store.read(FilterState::filter)
    }

    // --- state ---

    /// The whole filter state.
    pub fn snapshot(&self) -> Arc<FilterState> {
        self.inner.store.snapshot()
    }

    /// Subscribe to filter state changes.
    pub fn watch(&self) -> watch::Receiver<Arc<FilterState>> {
        self.inner.store.watch()
    }

    pub fn status(&self) -> FilterStatus {
        self.inner.store.read(FilterState::status)
    }

    pub fn attribute(&self) -> Option<AttributeMetadata> {
        self.inner.store.read(|s| s.attribute().cloned())
    }

    pub fn attribute_status(&self) -> OperationStatus {
        self.inner.store.read(|s| s.load(LoadOp::Attribute).status)
    }

    pub fn initial_page_status(&self) -> OperationStatus {
        self.inner.store.read(|s| s.load(LoadOp::InitialPage).status)
    }

    pub fn next_page_status(&self) -> OperationStatus {
        self.inner.store.read(|s| s.load(LoadOp::NextPage).status)
    }

    pub fn all_elements(&self) -> Vec<Element> {
        self.inner.store.read(FilterState::all_elements)
    }

    pub fn elements_by_key<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Element> {
        self.inner.store.read(|s| s.elements_by_key(keys))
    }

    pub fn total_count(&self) -> Option<u64> {
        self.inner.store.read(FilterState::total_count)
    }

    pub fn total_count_with_current_settings(&self) -> Option<u64> {
        self.inner.store.read(FilterState::total_count_with_current_settings)
    }

    pub fn offset(&self) -> u32 {
        self.inner.store.read(FilterState::offset)
    }

    pub fn limit(&self) -> u32 {
        self.inner.store.read(FilterState::limit)
    }

    pub fn search(&self) -> String {
        self.inner.store.read(|s| s.search().to_string())
    }

    pub fn order(&self) -> SortOrder {
        self.inner.store.read(FilterState::order)
    }

    pub fn limiting_filters(&self) -> Vec<AttributeFilterDefinition> {
        self.inner.store.read(|s| s.limiting_filters().to_vec())
    }

    pub fn has_next_page(&self) -> bool {
        self.inner.store.read(FilterState::has_next_page)
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.inner.store.read(FilterState::is_fully_loaded)
    }

    // --- internals ---

    fn next_request(&self) -> u64 {
        self.inner.requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn start(&self, op: LoadOp) -> u64 {
        let request = self.next_request();
        self.update(FilterMutation::LoadStarted { op, request });
        request
    }

    /// The request of the load already running for `op`, or a new one.
    fn join_or_start(&self, op: LoadOp) -> u64 {
        let running = self.inner.running.lock();
        match running.get(&Slot::Op(op)).and_then(|loads| loads.first()) {
            Some(load) => load.request,
            None => self.start(op),
        }
    }

    fn apply(&self, mutation: &FilterMutation) -> Result<(), FilterStateError> {
        self.inner.store.apply(mutation).map(|_| ())
    }

    /// Apply a mutation that only a broken invariant can reject.
    fn update(&self, mutation: FilterMutation) {
        if let Err(err) = self.apply(&mutation) {
            tracing::warn!(filter_id = %self.inner.filter_id, error = %err, "filter update rejected");
        }
    }

    /// Apply the mutation that completes `request`.
    ///
    /// A stale request was superseded or canceled while its result was on
    /// the way, so the caller sees [`FilterError::Canceled`]. Joined callers
    /// share a request; whichever settles second finds it already completed
    /// and succeeds too.
    fn settle_loaded(&self, op: LoadOp, request: u64, mutation: FilterMutation) -> Result<(), FilterError> {
        match self.apply(&mutation) {
            Ok(()) => Ok(()),
            Err(FilterStateError::Stale { .. })
                if self.inner.store.read(|s| s.load(op).succeeded_with(request)) =>
            {
                Ok(())
            }
            Err(FilterStateError::Stale { .. }) => {
                tracing::debug!(filter_id = %self.inner.filter_id, ?op, request, "result of a superseded load discarded");
                Err(FilterError::Canceled)
            }
            Err(err) => Err(FilterError::Load(QueryError::Handler(HandlerError::Consistency(
                err.to_string(),
            )))),
        }
    }

    fn elements_query(&self, options: LoadOptions, correlation: &str) -> Query {
        let attribute = self.inner.store.read(|s| s.attribute_ref().clone());
        let key = options.cache_key(&attribute);
        let request = ElementsRequest { attribute, options };
        Query::new(LOAD_ELEMENTS, json!(request))
            .with_cache_key(key)
            .with_correlation_id(correlation)
    }

    async fn run_tracked<T: Send + Sync + 'static>(
        &self,
        slot: Slot,
        request: u64,
        query: Query,
    ) -> Result<Arc<T>, FilterError> {
        let result = self.inner.queries.run::<T>(query)?;
        self.inner
            .running
            .lock()
            .entry(slot.clone())
            .or_default()
            .push(RunningLoad {
                request,
                canceler: result.canceler(),
            });
        let outcome = result.await;
        self.finish(&slot, request);
        outcome.map_err(FilterError::from)
    }

    fn finish(&self, slot: &Slot, request: u64) {
        let mut running = self.inner.running.lock();
        if let Some(loads) = running.get_mut(slot) {
            if let Some(at) = loads.iter().position(|load| load.request == request) {
                loads.swap_remove(at);
            }
            if loads.is_empty() {
                running.remove(slot);
            }
        }
    }

    /// Cancel every caller attached to `slot`.
    fn cancel_slot(&self, slot: &Slot) -> bool {
        let loads = self.inner.running.lock().remove(slot).unwrap_or_default();
        for load in &loads {
            load.canceler.cancel();
        }
        !loads.is_empty()
    }

    fn cancel_page_loads(&self) {
        self.cancel_slot(&Slot::Op(LoadOp::InitialPage));
        self.cancel_slot(&Slot::Op(LoadOp::NextPage));
    }

    fn settle_error(
        &self,
        op: LoadOp,
        request: u64,
        correlation: &str,
        err: FilterError,
        names: &OpEvents,
        payload: Value,
    ) -> FilterError {
        match &err {
            FilterError::Canceled => {
                self.settle_outcome(FilterMutation::LoadCanceled { op, request });
                self.emit(names.canceled, Some(correlation), payload);
                tracing::debug!(filter_id = %self.inner.filter_id, ?op, "load canceled");
            }
            other => {
                self.settle_outcome(FilterMutation::LoadFailed {
                    op,
                    request,
                    error: other.to_string(),
                });
                let mut payload = payload;
                if let Value::Object(map) = &mut payload {
                    map.insert("error".into(), json!(other.to_string()));
                }
                self.emit(names.failed, Some(correlation), payload);
                tracing::warn!(filter_id = %self.inner.filter_id, ?op, error = %other, "load failed");
            }
        }
        err
    }

    /// Record a failed or canceled outcome. Joined callers settle the same
    /// request, so every caller after the first is rejected as stale.
    fn settle_outcome(&self, mutation: FilterMutation) {
        if let Err(err) = self.apply(&mutation) {
            tracing::debug!(filter_id = %self.inner.filter_id, error = %err, "load outcome already recorded");
        }
    }

    fn emit(&self, event_type: &str, correlation: Option<&str>, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("filter_id".into(), json!(self.inner.filter_id));
        }
        let event = Event::new(event_type, payload);
        let event = match correlation {
            Some(id) => event.with_correlation_id(id),
            None => event,
        };
        self.inner.bus.publish(event);
    }

    fn emit_selection(&self, event_type: &str, pick: impl FnOnce(&FilterState) -> &Selection) {
        let selection = self.inner.store.read(|s| json!(pick(s)));
        self.emit(event_type, None, json!({ "selection": selection }));
    }
}

/// Builder for [`AttributeFilterLoader`].
pub struct AttributeFilterLoaderBuilder<B: ElementsBackend> {
    filter_id: String,
    attribute: AttributeRef,
    backend: Arc<B>,
    bus: Option<EventBus>,
    config: FilterConfig,
    selection: Selection,
    limiting_filters: Vec<AttributeFilterDefinition>,
}

impl<B: ElementsBackend> AttributeFilterLoaderBuilder<B> {
    /// Publish on `bus` instead of a private bus.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// If not called, [`FilterConfig::default()`] is used.
    pub fn config(mut self, config: FilterConfig) -> Self {
        self.config = config;
        self
    }

    /// Selection the filter starts with, both working and committed.
    ///
    /// Defaults to [`Selection::all`].
    pub fn initial_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    /// Filters limiting the offered elements from the start.
    pub fn limiting_filters(mut self, filters: Vec<AttributeFilterDefinition>) -> Self {
        self.limiting_filters = filters;
        self
    }

    pub fn build(self) -> AttributeFilterLoader<B> {
        let options = LoadOptions {
            limit: self.config.page_limit,
            limiting_filters: self.limiting_filters,
            ..LoadOptions::default()
        };
        let store = StateStore::new(FilterState::new(self.attribute, options, self.selection));
        let bus = self.bus.unwrap_or_default();

        let mut handlers: QueryHandlers<FilterState, B> = HashMap::new();
        handlers.insert(
            LOAD_ATTRIBUTE.to_string(),
            Arc::new(ErasedQuery(query_fn(load_attribute::<B>))),
        );
        handlers.insert(
            LOAD_ELEMENTS.to_string(),
            Arc::new(ErasedQuery(query_fn(load_elements::<B>))),
        );
        let queries = QueryProcessor::new(store.clone(), self.backend, bus.clone(), handlers, None, false, None);

        AttributeFilterLoader {
            inner: Arc::new(LoaderInner {
                filter_id: self.filter_id,
                store,
                queries,
                bus,
                config: self.config,
                requests: AtomicU64::new(0),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }
}
