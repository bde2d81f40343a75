//! Model trait: the state an engine instance owns and the reducer that
//! advances it.

use std::fmt;

/// The state owned by one engine instance (for example a dashboard).
///
/// The implementing type itself serves as the committed snapshot. It is
/// advanced only by folding [`Mutation`](Model::Mutation)s through
/// [`apply`](Model::apply), which the [`StateStore`](crate::StateStore) does
/// on a private copy before swapping it in.
///
/// # Contract
///
/// - [`apply`](Model::apply) must be pure: no I/O, no side effects.
/// - Returning `Err` rejects the mutation. The store discards the partially
///   built next state, so a failed mutation is never visible to readers.
pub trait Model: Clone + Send + Sync + 'static {
    /// Reducer actions accepted by this model.
    type Mutation: Clone + Send + Sync + fmt::Debug + 'static;

    /// Error raised when a mutation is inconsistent with the current state
    /// (e.g. it references an entity that no longer exists).
    type Error: std::error::Error + Send + Sync + 'static;

    /// Apply a single mutation to produce the next state.
    fn apply(self, mutation: &Self::Mutation) -> Result<Self, Self::Error>;
}


#[cfg(test)]
mod tests {
    use super::Model;
    use super::test_fixtures::{Dashboard, DashboardError, DashboardMutation};

    fn add(local_id: &str) -> DashboardMutation {
        DashboardMutation::AddFilter {
            local_id: local_id.into(),
            display_form: format!("{local_id}.df"),
        }
    }

    #[test]
    fn apply_rename() {
        let dashboard = Dashboard::default()
            .apply(&DashboardMutation::Rename {
                title: "Sales".into(),
            })
            .expect("rename should apply");
        assert_eq!(dashboard.title, "Sales");
    }

    #[test]
    fn apply_add_then_remove_filter() {
        let dashboard = Dashboard::default().apply(&add("f1")).expect("add should apply");
        assert_eq!(dashboard.filters.len(), 1);

        let dashboard = dashboard
            .apply(&DashboardMutation::RemoveFilter {
                local_id: "f1".into(),
            })
            .expect("remove should apply");
        assert!(dashboard.filters.is_empty());
    }

    #[test]
    fn duplicate_filter_is_rejected() {
        let dashboard = Dashboard::default().apply(&add("f1")).expect("add should apply");
        let err = dashboard.apply(&add("f1")).unwrap_err();
        assert!(matches!(err, DashboardError::DuplicateFilter(id) if id == "f1"));
    }

    #[test]
    fn removing_missing_filter_is_rejected() {
        let err = Dashboard::default()
            .apply(&DashboardMutation::RemoveFilter {
                local_id: "nope".into(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "filter nope not found");
    }
}
