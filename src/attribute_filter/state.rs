//! State of one attribute filter, modelled as a [`Model`] so it lives in a
//! [`StateStore`](crate::StateStore) like any engine state.
//!
//! Every load runs under a request number. A load's settling mutation is
//! rejected with [`FilterStateError::Stale`] unless its request is still the
//! current one for that operation and still loading, so a late response can
//! never overwrite the result of a newer request or undo a cancellation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::elements::{
    AttributeFilterDefinition, AttributeMetadata, AttributeRef, Element, ElementsPage, LoadOptions,
    SortOrder,
};
use super::selection::{ElementKey, Selection, StagedSelection};
use crate::model::Model;

/// Status of one asynchronous operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Loading,
    Success,
    Error,
    Canceled,
}

/// Operations whose progress the filter state tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOp {
    Init,
    Attribute,
    InitialPage,
    NextPage,
}

/// Progress of one [`LoadOp`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadState {
    pub status: OperationStatus,
    /// Message of the last failure; cleared when a new request starts.
    pub error: Option<String>,
    request: u64,
}

impl LoadState {
    /// Whether `request` is the request that last completed this operation.
    pub(crate) fn succeeded_with(&self, request: u64) -> bool {
        self.request == request && self.status == OperationStatus::Success
    }
}

/// Overall filter status derived from the individual loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum FilterStatus {
    Initial,
    LoadingAttribute,
    LoadingElements { offset: u32 },
    Ready,
    Error,
}

/// Reducer actions for [`FilterState`].
#[derive(Debug, Clone)]
pub enum FilterMutation {
    LoadStarted { op: LoadOp, request: u64 },
    LoadFailed { op: LoadOp, request: u64, error: String },
    LoadCanceled { op: LoadOp, request: u64 },
    InitFinished { request: u64 },
    AttributeLoaded { request: u64, metadata: AttributeMetadata },
    PageLoaded { op: LoadOp, request: u64, page: Arc<ElementsPage> },
    /// Add elements to the cache without touching the ordered list.
    ElementsCached { elements: Vec<Element> },
    SetLimit(u32),
    SetOrder(SortOrder),
    SetSearch(String),
    SetLimitingFilters(Vec<AttributeFilterDefinition>),
    ChangeSelection(Selection),
    CommitSelection,
    RevertSelection,
    InvertSelection,
    ClearSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterStateError {
    /// The request was superseded, canceled or already settled.
    #[error("{op:?} request {request} is no longer current")]
    Stale { op: LoadOp, request: u64 },

    /// A mutation named an operation it cannot settle.
    #[error("{0:?} cannot be settled with an elements page")]
    NotAPageLoad(LoadOp),
}

/// Everything one attribute filter knows.
#[derive(Debug, Clone)]
pub struct FilterState {
    attribute_ref: AttributeRef,
    attribute: Option<AttributeMetadata>,
    init: LoadState,
    attribute_load: LoadState,
    initial_page: LoadState,
    next_page: LoadState,
    elements: Vec<ElementKey>,
    /// Keys of `elements`, for membership checks while appending.
    listed: HashSet<ElementKey>,
    cache: HashMap<ElementKey, Element>,
    options: LoadOptions,
    total_count: Option<u64>,
    total_count_with_current_settings: Option<u64>,
    selection: StagedSelection,
}

impl FilterState {
    /// A filter on `attribute` that has loaded nothing yet.
    pub fn new(attribute: AttributeRef, options: LoadOptions, selection: Selection) -> Self {
        Self {
            attribute_ref: attribute,
            attribute: None,
            init: LoadState::default(),
            attribute_load: LoadState::default(),
            initial_page: LoadState::default(),
            next_page: LoadState::default(),
            elements: Vec::new(),
            listed: HashSet::new(),
            cache: HashMap::new(),
            options,
            total_count: None,
            total_count_with_current_settings: None,
            selection: StagedSelection::new(selection),
        }
    }

    pub fn attribute_ref(&self) -> &AttributeRef {
        &self.attribute_ref
    }

    /// Loaded attribute metadata.
    pub fn attribute(&self) -> Option<&AttributeMetadata> {
        self.attribute.as_ref()
    }

    pub fn load(&self, op: LoadOp) -> &LoadState {
        match op {
            LoadOp::Init => &self.init,
            LoadOp::Attribute => &self.attribute_load,
            LoadOp::InitialPage => &self.initial_page,
            LoadOp::NextPage => &self.next_page,
        }
    }

    fn load_mut(&mut self, op: LoadOp) -> &mut LoadState {
        match op {
            LoadOp::Init => &mut self.init,
            LoadOp::Attribute => &mut self.attribute_load,
            LoadOp::InitialPage => &mut self.initial_page,
            LoadOp::NextPage => &mut self.next_page,
        }
    }

    /// The overall status. A failed next page leaves the filter ready; only
    /// the next page's own status reports the error.
    pub fn status(&self) -> FilterStatus {
        let loading = |state: &LoadState| state.status == OperationStatus::Loading;
        let failed = |state: &LoadState| state.status == OperationStatus::Error;

        if loading(&self.attribute_load) {
            FilterStatus::LoadingAttribute
        } else if loading(&self.initial_page) {
            FilterStatus::LoadingElements { offset: 0 }
        } else if loading(&self.next_page) {
            FilterStatus::LoadingElements {
                offset: self.offset(),
            }
        } else if failed(&self.init) || failed(&self.attribute_load) || failed(&self.initial_page) {
            FilterStatus::Error
        } else if self.attribute_load.status == OperationStatus::Success
            && self.initial_page.status == OperationStatus::Success
        {
            FilterStatus::Ready
        } else {
            FilterStatus::Initial
        }
    }

    /// Elements of the ordered list, in load order.
    pub fn all_elements(&self) -> Vec<Element> {
        self.elements_by_key(&self.elements)
    }

    /// Cached elements for `keys`, in the order given. Unknown keys are
    /// skipped.
    pub fn elements_by_key<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Element> {
        keys.iter()
            .filter_map(|key| self.cache.get(key.as_ref()).cloned())
            .collect()
    }

    /// Whether the element is in the cache.
    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Count of all elements, without search or limiting filters.
    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    /// Count of elements matching the current options.
    pub fn total_count_with_current_settings(&self) -> Option<u64> {
        self.total_count_with_current_settings
    }

    /// Number of elements in the ordered list; where the next page starts.
    pub fn offset(&self) -> u32 {
        u32::try_from(self.elements.len()).unwrap_or(u32::MAX)
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    pub fn limit(&self) -> u32 {
        self.options.limit
    }

    pub fn search(&self) -> &str {
        &self.options.search
    }

    pub fn order(&self) -> SortOrder {
        self.options.order
    }

    pub fn limiting_filters(&self) -> &[AttributeFilterDefinition] {
        &self.options.limiting_filters
    }

    /// Whether more elements match the current options than are loaded.
    pub fn has_next_page(&self) -> bool {
        self.total_count_with_current_settings
            .is_some_and(|total| u64::from(self.offset()) < total)
    }

    /// Whether every element matching the current options is loaded.
    pub fn is_fully_loaded(&self) -> bool {
        self.total_count_with_current_settings.is_some() && !self.has_next_page()
    }

    pub fn selection(&self) -> &StagedSelection {
        &self.selection
    }

    /// The committed selection as a filter definition.
    pub fn filter(&self) -> AttributeFilterDefinition {
        AttributeFilterDefinition::from_selection(&self.attribute_ref, self.selection.committed())
    }

    fn settle(&mut self, op: LoadOp, request: u64) -> Result<&mut LoadState, FilterStateError> {
        let state = self.load_mut(op);
        if state.request != request || state.status != OperationStatus::Loading {
            return Err(FilterStateError::Stale { op, request });
        }
        Ok(state)
    }

    fn clear_elements(&mut self) {
        self.elements.clear();
        self.listed.clear();
    }

    fn reset_elements(&mut self) {
        self.clear_elements();
        self.total_count_with_current_settings = None;
        for op in [LoadOp::InitialPage, LoadOp::NextPage] {
            let state = self.load_mut(op);
            if state.status == OperationStatus::Loading {
                state.status = OperationStatus::Canceled;
            }
        }
    }

    fn cache_elements<'a>(&mut self, elements: impl IntoIterator<Item = &'a Element>) {
        for element in elements {
            self.cache
                .entry(element.key.clone())
                .or_insert_with(|| element.clone());
        }
    }
}

impl Model for FilterState {
    type Mutation = FilterMutation;
    type Error = FilterStateError;

    fn apply(mut self, mutation: &FilterMutation) -> Result<Self, FilterStateError> {
        match mutation {
            FilterMutation::LoadStarted { op, request } => {
                *self.load_mut(*op) = LoadState {
                    status: OperationStatus::Loading,
                    error: None,
                    request: *request,
                };
            }
            FilterMutation::LoadFailed { op, request, error } => {
                let state = self.settle(*op, *request)?;
                state.status = OperationStatus::Error;
                state.error = Some(error.clone());
            }
            FilterMutation::LoadCanceled { op, request } => {
                self.settle(*op, *request)?.status = OperationStatus::Canceled;
            }
            FilterMutation::InitFinished { request } => {
                self.settle(LoadOp::Init, *request)?.status = OperationStatus::Success;
            }
            FilterMutation::AttributeLoaded { request, metadata } => {
                self.settle(LoadOp::Attribute, *request)?.status = OperationStatus::Success;
                if self.total_count.is_none() {
                    self.total_count = metadata.elements_count;
                }
                self.attribute = Some(metadata.clone());
            }
            FilterMutation::PageLoaded { op, request, page } => {
                if !matches!(op, LoadOp::InitialPage | LoadOp::NextPage) {
                    return Err(FilterStateError::NotAPageLoad(*op));
                }
                self.settle(*op, *request)?.status = OperationStatus::Success;
                if *op == LoadOp::InitialPage {
                    self.clear_elements();
                }
                for element in &page.elements {
                    if self.listed.insert(element.key.clone()) {
                        self.elements.push(element.key.clone());
                    }
                }
                self.cache_elements(&page.elements);
                self.total_count_with_current_settings = Some(page.total_count);
                if !page.options.is_narrowed() {
                    self.total_count = Some(page.total_count);
                }
            }
            FilterMutation::ElementsCached { elements } => self.cache_elements(elements),
            FilterMutation::SetLimit(limit) => {
                self.options.limit = *limit;
                self.reset_elements();
            }
            FilterMutation::SetOrder(order) => {
                self.options.order = *order;
                self.reset_elements();
            }
            FilterMutation::SetSearch(search) => {
                self.options.search = search.clone();
                self.reset_elements();
            }
            FilterMutation::SetLimitingFilters(filters) => {
                self.options.limiting_filters = filters.clone();
                self.reset_elements();
            }
            FilterMutation::ChangeSelection(selection) => self.selection.change(selection.clone()),
            FilterMutation::CommitSelection => self.selection.commit(),
            FilterMutation::RevertSelection => self.selection.revert(),
            FilterMutation::InvertSelection => self.selection.invert(),
            FilterMutation::ClearSelection => self.selection.clear(),
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FilterState {
        FilterState::new(
            AttributeRef::new("label.region"),
            LoadOptions {
                limit: 2,
                ..LoadOptions::default()
            },
            Selection::all(),
        )
    }

    fn page(keys: &[&str], offset: u32, total: u64) -> Arc<ElementsPage> {
        Arc::new(ElementsPage {
            elements: keys.iter().map(|k| Element::new(*k, k.to_uppercase())).collect(),
            total_count: total,
            options: LoadOptions {
                offset,
                limit: 2,
                ..LoadOptions::default()
            },
        })
    }

    fn apply(state: FilterState, mutations: &[FilterMutation]) -> FilterState {
        mutations
            .iter()
            .try_fold(state, |s, m| s.apply(m))
            .expect("mutations should apply")
    }

    #[test]
    fn initial_page_then_next_page_appends() {
        let s = apply(
            state(),
            &[
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 1 },
                FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 1, page: page(&["a", "b"], 0, 3) },
                FilterMutation::LoadStarted { op: LoadOp::NextPage, request: 2 },
            ],
        );
        assert_eq!(s.status(), FilterStatus::LoadingElements { offset: 2 });
        assert!(s.has_next_page());

        let s = apply(
            s,
            &[FilterMutation::PageLoaded { op: LoadOp::NextPage, request: 2, page: page(&["c"], 2, 3) }],
        );
        let keys: Vec<_> = s.all_elements().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert!(s.is_fully_loaded());
        assert_eq!(s.total_count(), Some(3));
    }

    #[test]
    fn stale_response_is_rejected() {
        let s = apply(
            state(),
            &[
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 1 },
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 2 },
            ],
        );
        let err = s
            .apply(&FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 1, page: page(&["a"], 0, 1) })
            .unwrap_err();
        assert_eq!(err, FilterStateError::Stale { op: LoadOp::InitialPage, request: 1 });
    }

    #[test]
    fn option_change_cancels_loading_pages_and_clears_list() {
        let s = apply(
            state(),
            &[
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 1 },
                FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 1, page: page(&["a", "b"], 0, 3) },
                FilterMutation::LoadStarted { op: LoadOp::NextPage, request: 2 },
                FilterMutation::SetSearch("b".into()),
            ],
        );
        assert_eq!(s.load(LoadOp::NextPage).status, OperationStatus::Canceled);
        assert!(s.all_elements().is_empty());
        assert_eq!(s.total_count_with_current_settings(), None);
        assert!(s.is_cached("a"));
        assert_eq!(s.search(), "b");

        let late = s.apply(&FilterMutation::PageLoaded { op: LoadOp::NextPage, request: 2, page: page(&["c"], 2, 3) });
        assert!(matches!(late, Err(FilterStateError::Stale { .. })));
    }

    #[test]
    fn overlapping_pages_list_each_key_once() {
        let s = apply(
            state(),
            &[
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 1 },
                FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 1, page: page(&["a", "b"], 0, 4) },
                FilterMutation::LoadStarted { op: LoadOp::NextPage, request: 2 },
                FilterMutation::PageLoaded { op: LoadOp::NextPage, request: 2, page: page(&["b", "c"], 2, 4) },
            ],
        );
        let keys: Vec<_> = s.all_elements().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        // A cleared list accepts the same keys again.
        let s = apply(
            s,
            &[
                FilterMutation::SetOrder(SortOrder::Desc),
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 3 },
                FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 3, page: page(&["c", "b"], 0, 4) },
            ],
        );
        let keys: Vec<_> = s.all_elements().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["c", "b"]);
        assert!(s.load(LoadOp::InitialPage).succeeded_with(3));
        assert!(!s.load(LoadOp::InitialPage).succeeded_with(1));
    }

    #[test]
    fn narrowed_page_keeps_unfiltered_total() {
        let searched = Arc::new(ElementsPage {
            elements: vec![Element::new("b", "B")],
            total_count: 1,
            options: LoadOptions {
                search: "b".into(),
                ..LoadOptions::default()
            },
        });
        let s = apply(
            state(),
            &[
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 1 },
                FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 1, page: page(&["a", "b"], 0, 3) },
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 2 },
                FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 2, page: searched },
            ],
        );
        assert_eq!(s.total_count(), Some(3));
        assert_eq!(s.total_count_with_current_settings(), Some(1));
    }

    #[test]
    fn failed_next_page_keeps_filter_ready_and_selection() {
        let s = apply(
            state(),
            &[
                FilterMutation::LoadStarted { op: LoadOp::Attribute, request: 1 },
                FilterMutation::AttributeLoaded {
                    request: 1,
                    metadata: AttributeMetadata { id: "region".into(), title: "Region".into(), elements_count: None },
                },
                FilterMutation::LoadStarted { op: LoadOp::InitialPage, request: 2 },
                FilterMutation::PageLoaded { op: LoadOp::InitialPage, request: 2, page: page(&["a", "b"], 0, 3) },
                FilterMutation::ChangeSelection(Selection::include(["a"])),
                FilterMutation::CommitSelection,
                FilterMutation::LoadStarted { op: LoadOp::NextPage, request: 3 },
                FilterMutation::LoadFailed { op: LoadOp::NextPage, request: 3, error: "timeout".into() },
            ],
        );
        assert_eq!(s.status(), FilterStatus::Ready);
        assert_eq!(s.load(LoadOp::NextPage).error.as_deref(), Some("timeout"));
        assert_eq!(s.selection().committed(), &Selection::include(["a"]));
    }

    #[test]
    fn elements_by_key_skips_unknown() {
        let s = apply(state(), &[FilterMutation::ElementsCached { elements: vec![Element::new("x", "X")] }]);
        let found = s.elements_by_key(&["x", "missing"]);
        assert_eq!(found, vec![Element::new("x", "X")]);
        assert!(s.all_elements().is_empty());
    }

    #[test]
    fn filter_reflects_committed_selection() {
        let s = apply(
            state(),
            &[FilterMutation::ChangeSelection(Selection::include(["a"]))],
        );
        assert!(matches!(s.filter(), AttributeFilterDefinition::Negative { .. }));
        let s = apply(s, &[FilterMutation::CommitSelection]);
        assert!(matches!(s.filter(), AttributeFilterDefinition::Positive { .. }));
    }

    #[test]
    fn page_mutation_for_attribute_is_rejected() {
        let err = state()
            .apply(&FilterMutation::PageLoaded { op: LoadOp::Attribute, request: 1, page: page(&[], 0, 0) })
            .unwrap_err();
        assert_eq!(err, FilterStateError::NotAPageLoad(LoadOp::Attribute));
    }
}
