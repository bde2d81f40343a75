//! Invertible element selections and the working/committed pair.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::FilterError;

/// Stable identity of an attribute element.
pub type ElementKey = String;

/// How [`Selection::keys`] is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Exactly the listed keys are selected.
    #[default]
    Include,
    /// Everything except the listed keys is selected.
    Exclude,
}

impl SelectionMode {
    /// The opposite mode.
    pub fn inverted(self) -> Self {
        match self {
            Self::Include => Self::Exclude,
            Self::Exclude => Self::Include,
        }
    }
}

/// A set of element keys plus the mode that says what the set means.
///
/// `Include` with no keys selects nothing; `Exclude` with no keys selects
/// everything. The default is the empty include selection.
///
/// # Examples
///
/// ```
/// use dashboard_engine::attribute_filter::Selection;
///
/// let picked = Selection::include(["A", "B"]);
/// assert!(picked.is_selected("A"));
///
/// let rest = picked.inverted();
/// assert!(!rest.is_selected("A"));
/// assert!(rest.is_selected("C"));
/// assert_eq!(rest.inverted(), picked);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub mode: SelectionMode,
    pub keys: BTreeSet<ElementKey>,
}

impl Selection {
    /// Select exactly `keys`.
    pub fn include<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ElementKey>,
    {
        Self {
            mode: SelectionMode::Include,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Select everything except `keys`.
    pub fn exclude<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ElementKey>,
    {
        Self {
            mode: SelectionMode::Exclude,
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Select nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Select everything.
    pub fn all() -> Self {
        Self {
            mode: SelectionMode::Exclude,
            keys: BTreeSet::new(),
        }
    }

    /// Select one element, or nothing.
    pub fn single(key: Option<impl Into<ElementKey>>) -> Self {
        Self::include(key.map(Into::<ElementKey>::into))
    }

    /// Flip the mode, keeping the keys.
    pub fn inverted(&self) -> Self {
        Self {
            mode: self.mode.inverted(),
            keys: self.keys.clone(),
        }
    }

    /// Whether nothing is selected.
    ///
    /// An empty exclude selection selects everything and is not empty.
    pub fn is_empty(&self) -> bool {
        self.mode == SelectionMode::Include && self.keys.is_empty()
    }

    /// Whether everything is selected.
    pub fn is_all(&self) -> bool {
        self.mode == SelectionMode::Exclude && self.keys.is_empty()
    }

    /// Whether the element with `key` is selected.
    pub fn is_selected(&self, key: &str) -> bool {
        match self.mode {
            SelectionMode::Include => self.keys.contains(key),
            SelectionMode::Exclude => !self.keys.contains(key),
        }
    }

    /// The key of a single selection.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::NotSingleSelection`] when the selection is
    /// inverted or holds more than one key.
    pub fn single_key(&self) -> Result<Option<&str>, FilterError> {
        if self.mode == SelectionMode::Exclude || self.keys.len() > 1 {
            return Err(FilterError::NotSingleSelection);
        }
        Ok(self.keys.first().map(String::as_str))
    }
}

/// A working (draft) selection and the committed one it was derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedSelection {
    working: Selection,
    committed: Selection,
}

impl StagedSelection {
    /// Start with `initial` as both working and committed selection.
    pub fn new(initial: Selection) -> Self {
        Self {
            working: initial.clone(),
            committed: initial,
        }
    }

    pub fn working(&self) -> &Selection {
        &self.working
    }

    pub fn committed(&self) -> &Selection {
        &self.committed
    }

    /// Replace the working selection.
    pub fn change(&mut self, selection: Selection) {
        self.working = selection;
    }

    /// Make the working selection the committed one.
    pub fn commit(&mut self) {
        self.committed = self.working.clone();
    }

    /// Discard working changes.
    pub fn revert(&mut self) {
        self.working = self.committed.clone();
    }

    /// Flip the working selection's mode.
    pub fn invert(&mut self) {
        self.working = self.working.inverted();
    }

    /// Set the working selection to everything.
    pub fn clear(&mut self) {
        self.working = Selection::all();
    }

    /// Whether the working selection differs from the committed one.
    pub fn is_changed(&self) -> bool {
        self.working != self.committed
    }

    /// Whether the working selection selects nothing.
    pub fn is_working_empty(&self) -> bool {
        self.working.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_invert_is_identity() {
        let selection = Selection::exclude(["x", "y"]);
        assert_eq!(selection.inverted().inverted(), selection);
    }

    #[test]
    fn emptiness_depends_on_mode() {
        assert!(Selection::none().is_empty());
        assert!(!Selection::all().is_empty());
        assert!(Selection::all().is_all());
        assert!(!Selection::include(["a"]).is_empty());
    }

    #[test]
    fn exclude_selects_unlisted_keys() {
        let selection = Selection::exclude(["a"]);
        assert!(!selection.is_selected("a"));
        assert!(selection.is_selected("b"));
    }

    #[test]
    fn single_key_accessor() {
        assert_eq!(Selection::single(Some("a")).single_key(), Ok(Some("a")));
        assert_eq!(Selection::single(None::<String>).single_key(), Ok(None));
        assert_eq!(
            Selection::include(["a", "b"]).single_key(),
            Err(FilterError::NotSingleSelection)
        );
        assert_eq!(Selection::all().single_key(), Err(FilterError::NotSingleSelection));
    }

    #[test]
    fn commit_then_revert_keeps_committed() {
        let mut staged = StagedSelection::new(Selection::all());
        staged.change(Selection::include(["A"]));
        assert!(staged.is_changed());

        staged.commit();
        staged.revert();

        assert_eq!(staged.working(), &Selection::include(["A"]));
        assert_eq!(staged.working(), staged.committed());
        assert!(!staged.is_changed());
    }

    #[test]
    fn revert_discards_working_changes() {
        let mut staged = StagedSelection::new(Selection::include(["A"]));
        staged.invert();
        assert_eq!(staged.working().mode, SelectionMode::Exclude);
        staged.revert();
        assert_eq!(staged.working(), &Selection::include(["A"]));
    }

    #[test]
    fn clear_selects_everything() {
        let mut staged = StagedSelection::new(Selection::include(["A"]));
        staged.clear();
        assert!(staged.working().is_all());
        assert!(!staged.is_working_empty());
    }

    #[test]
    fn mode_serializes_snake_case() {
        let json = serde_json::to_value(Selection::exclude(["k"])).expect("serialization should succeed");
        assert_eq!(json, serde_json::json!({ "mode": "exclude", "keys": ["k"] }));
    }
}
