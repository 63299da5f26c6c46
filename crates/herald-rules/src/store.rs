//! The rule store contract consumed by the router, and its SQLite backing.

use herald_db::DbPool;
use herald_types::{Channel, ErrorMarker, Family, Rule};

use crate::RuleError;

/// Read access to rules and channels, plus the single write the router
/// performs: recording the outcome of a delivery on the channel.
///
/// Implementations are called from blocking worker threads and must be
/// shareable across them.
pub trait RuleStore: Send + Sync {
    /// Every rule belonging to `family`, in creation order.
    fn rules_for_family(&self, family: Family) -> Result<Vec<Rule>, RuleError>;

    /// The channel with `channel_id`, if it still exists.
    fn channel(&self, channel_id: i64) -> Result<Option<Channel>, RuleError>;

    /// Overwrites the channel's error marker; `None` clears it.
    fn record_delivery_result(
        &self,
        channel_id: i64,
        marker: Option<&ErrorMarker>,
    ) -> Result<(), RuleError>;
}

/// [`RuleStore`] backed by the Herald SQLite schema.
#[derive(Clone)]
pub struct SqliteRuleStore {
    pool: DbPool,
}

impl SqliteRuleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for configuration tooling that shares it.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl RuleStore for SqliteRuleStore {
    fn rules_for_family(&self, family: Family) -> Result<Vec<Rule>, RuleError> {
        let conn = self.pool.get()?;
        crate::list_rules_for_family(&conn, family)
    }

    fn channel(&self, channel_id: i64) -> Result<Option<Channel>, RuleError> {
        let conn = self.pool.get()?;
        crate::find_channel(&conn, channel_id)
    }

    fn record_delivery_result(
        &self,
        channel_id: i64,
        marker: Option<&ErrorMarker>,
    ) -> Result<(), RuleError> {
        let conn = self.pool.get()?;
        crate::set_channel_error(&conn, channel_id, marker)
    }
}
