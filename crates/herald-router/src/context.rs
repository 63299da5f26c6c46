//! Contracts for the content-side collaborators.

use herald_types::{EventContext, Identity};

use crate::error::BoxError;

/// Source of post facts.
///
/// Implementations resolve topic, category, tags, mentioned groups, and
/// participant groups for a post. Calls run on the blocking thread pool.
pub trait ContentStore: Send + Sync {
    /// The event context for `post_id`, or `None` if the post is gone.
    fn event_context(&self, post_id: i64) -> Result<Option<EventContext>, BoxError>;
}

/// Permission check guarding every notification.
pub trait VisibilityOracle: Send + Sync {
    /// Whether `identity` can read the post described by `event`.
    fn can_see(&self, identity: &Identity, event: &EventContext) -> Result<bool, BoxError>;
}
