//! Engine and attribute filter configuration.

use std::time::Duration;

/// Configuration for an [`Engine`](crate::Engine).
///
/// All fields have defaults accessible via [`EngineConfig::default()`].
/// Pass to [`EngineBuilder::config`](crate::EngineBuilder::config) to
/// customize.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use dashboard_engine::EngineConfig;
///
/// let config = EngineConfig {
///     query_ttl: Some(Duration::from_secs(60)),
///     ..EngineConfig::default()
/// };
/// assert_eq!(config.undo_depth, 50);
/// assert!(!config.notify_queries);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of undoable commands kept in the undo log.
    ///
    /// Zero disables undo recording.
    ///
    /// Default: 50.
    pub undo_depth: usize,

    /// How long a successful query result stays fresh.
    ///
    /// `None` keeps results until they are invalidated. Individual query
    /// handlers may override this.
    ///
    /// Default: `None`.
    pub query_ttl: Option<Duration>,

    /// Whether settled queries publish `QUERY_SUCCEEDED` / `QUERY_FAILED`
    /// events. Individual query handlers may override this.
    ///
    /// Default: `false`.
    pub notify_queries: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            undo_depth: 50,
            query_ttl: None,
            notify_queries: false,
        }
    }
}

/// Configuration for an
/// [`AttributeFilterLoader`](crate::attribute_filter::AttributeFilterLoader).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Page size used for element pages unless a limit is set explicitly.
    ///
    /// Default: 50.
    pub page_limit: u32,

    /// Maximum number of keys resolved by one custom elements load.
    ///
    /// Default: 1000.
    pub custom_elements_limit: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            page_limit: 50,
            custom_elements_limit: 1000,
        }
    }
}
