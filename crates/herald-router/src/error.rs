//! Error types for the routing path.

use herald_rules::RuleError;

/// Error type returned by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures that stop a routing pass before any delivery is attempted.
///
/// Delivery failures never appear here; they are captured per channel in
/// the [`RouteReport`](crate::RouteReport).
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The content store could not produce the event context.
    #[error("content store error: {0}")]
    Content(#[source] BoxError),

    /// The visibility oracle could not answer.
    #[error("visibility check failed: {0}")]
    Visibility(#[source] BoxError),

    /// Rules could not be loaded.
    #[error("rule store error: {0}")]
    Rules(#[from] RuleError),

    /// A blocking store call panicked or was cancelled.
    #[error("store task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}
