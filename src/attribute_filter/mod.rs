//! Attribute filter loading and selection.
//!
//! An [`AttributeFilterLoader`] owns the state of one filter: the attribute
//! metadata, the ordered list of loaded elements with a cache of every
//! element seen so far, and an invertible [`Selection`] kept as a working
//! draft and a committed value.

mod elements;
mod loader;
mod selection;
mod state;

pub use elements::{
    AttributeFilterDefinition, AttributeMetadata, AttributeRef, Element, ElementsBackend,
    ElementsPage, LoadOptions, SortOrder,
};
pub use loader::{AttributeFilterLoader, AttributeFilterLoaderBuilder, events};
pub use selection::{ElementKey, Selection, SelectionMode, StagedSelection};
pub use state::{
    FilterMutation, FilterState, FilterStateError, FilterStatus, LoadOp, LoadState,
    OperationStatus,
};
