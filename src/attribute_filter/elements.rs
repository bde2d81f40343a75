//! Element records, load options and the backend capability the loader
//! reads them through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::selection::{ElementKey, Selection, SelectionMode};
use crate::error::BackendError;

/// Identifies the attribute (by display form) a filter works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeRef {
    pub display_form: String,
}

impl AttributeRef {
    pub fn new(display_form: impl Into<String>) -> Self {
        Self {
            display_form: display_form.into(),
        }
    }
}

/// Attribute metadata returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    pub id: String,
    pub title: String,
    /// Total element count without any search or limiting filter, when the
    /// backend knows it.
    #[serde(default)]
    pub elements_count: Option<u64>,
}

/// One attribute element. Elements are immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Element {
    pub key: ElementKey,
    pub title: String,
}

impl Element {
    pub fn new(key: impl Into<ElementKey>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// An attribute filter as applied to data: the committed selection of one
/// display form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeFilterDefinition {
    /// Only the listed elements pass.
    Positive {
        display_form: String,
        keys: Vec<ElementKey>,
    },
    /// Every element except the listed ones passes.
    Negative {
        display_form: String,
        keys: Vec<ElementKey>,
    },
}

impl AttributeFilterDefinition {
    /// The filter equivalent to `selection` on `attribute`.
    pub fn from_selection(attribute: &AttributeRef, selection: &Selection) -> Self {
        let display_form = attribute.display_form.clone();
        let keys = selection.keys.iter().cloned().collect();
        match selection.mode {
            SelectionMode::Include => Self::Positive { display_form, keys },
            SelectionMode::Exclude => Self::Negative { display_form, keys },
        }
    }
}

/// Parameters of one elements request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadOptions {
    pub offset: u32,
    pub limit: u32,
    /// Case-insensitive title search; empty means no search.
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub order: SortOrder,
    /// Other filters that narrow the elements offered (parent filters).
    #[serde(default)]
    pub limiting_filters: Vec<AttributeFilterDefinition>,
    /// Load exactly these elements instead of a page.
    #[serde(default)]
    pub keys: Option<Vec<ElementKey>>,
}

impl LoadOptions {
    /// A request for exactly `keys`.
    pub fn for_keys(keys: impl IntoIterator<Item = ElementKey>) -> Self {
        let keys: Vec<ElementKey> = keys.into_iter().collect();
        Self {
            limit: u32::try_from(keys.len()).unwrap_or(u32::MAX),
            keys: Some(keys),
            ..Self::default()
        }
    }

    /// The same request starting at `offset`.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Whether search or limiting filters narrow the result.
    pub fn is_narrowed(&self) -> bool {
        !self.search.is_empty() || !self.limiting_filters.is_empty()
    }

    /// Query cache key for this request against `attribute`.
    pub fn cache_key(&self, attribute: &AttributeRef) -> String {
        let options = serde_json::to_string(self).unwrap_or_default();
        format!("attributeFilter.elements:{}:{options}", attribute.display_form)
    }
}

/// One page of elements as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementsPage {
    pub elements: Vec<Element>,
    /// Count of all elements matching the request's options.
    pub total_count: u64,
    /// The options the page was loaded with.
    pub options: LoadOptions,
}

/// Backend capability used by the attribute filter loader.
///
/// Implementations wrap whichever analytical backend hosts the attribute.
#[async_trait]
pub trait ElementsBackend: Send + Sync + 'static {
    /// Load the attribute's metadata.
    async fn load_attribute(&self, attribute: &AttributeRef) -> Result<AttributeMetadata, BackendError>;

    /// Load elements matching `options`.
    async fn load_elements(
        &self,
        attribute: &AttributeRef,
        options: &LoadOptions,
    ) -> Result<ElementsPage, BackendError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_differs_by_offset_and_search() {
        let attribute = AttributeRef::new("label.region");
        let base = LoadOptions {
            limit: 50,
            ..LoadOptions::default()
        };
        let next = base.clone().with_offset(50);
        let searched = LoadOptions {
            search: "eu".into(),
            ..base.clone()
        };

        assert_ne!(base.cache_key(&attribute), next.cache_key(&attribute));
        assert_ne!(base.cache_key(&attribute), searched.cache_key(&attribute));
        assert_eq!(base.cache_key(&attribute), base.clone().cache_key(&attribute));
    }

    #[test]
    fn for_keys_sizes_the_request() {
        let options = LoadOptions::for_keys(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(options.limit, 2);
        assert_eq!(options.keys.as_deref(), Some(&["a".to_string(), "b".to_string()][..]));
    }

    #[test]
    fn filter_definition_follows_mode() {
        let attribute = AttributeRef::new("label.region");
        let positive = AttributeFilterDefinition::from_selection(&attribute, &Selection::include(["a"]));
        let negative = AttributeFilterDefinition::from_selection(&attribute, &Selection::all());

        assert_eq!(
            positive,
            AttributeFilterDefinition::Positive {
                display_form: "label.region".into(),
                keys: vec!["a".into()],
            }
        );
        assert!(matches!(negative, AttributeFilterDefinition::Negative { keys, .. } if keys.is_empty()));
    }

    #[test]
    fn narrowed_when_searching_or_limited() {
        assert!(!LoadOptions::default().is_narrowed());
        let searched = LoadOptions {
            search: "x".into(),
            ..LoadOptions::default()
        };
        assert!(searched.is_narrowed());
    }
}
