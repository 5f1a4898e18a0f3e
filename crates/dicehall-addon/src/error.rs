//! Error types for the filter layer.

use std::time::Duration;

/// Failures while running or managing filters.
///
/// Evaluation failures (`Timeout`, `Internal`) never reach callers as
/// request errors: the registry resolves them with the filter's
/// [`OnError`](crate::OnError) policy and records them as diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("filter {filter} exceeded its {budget:?} budget")]
    Timeout { filter: String, budget: Duration },

    #[error("filter {filter} failed: {message}")]
    Internal { filter: String, message: String },

    #[error("no filter registered as {0}")]
    UnknownFilter(String),

    #[error("a filter is already registered as {0}")]
    DuplicateFilter(String),
}
