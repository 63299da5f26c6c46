//! Channel and rule storage for Herald.
//!
//! Channels are delivery destinations bound to a provider; rules attach a
//! matching condition and a filter to a channel. The router only reads
//! rules and writes a channel's error marker. Everything else here exists
//! for configuration tooling and tests.
//!
//! [`RuleStore`] is the read/write surface the router depends on.
//! [`SqliteRuleStore`] implements it over a [`herald_db::DbPool`].

mod store;

use std::collections::BTreeSet;

use herald_types::{normalize_tag, Channel, ErrorMarker, Family, Filter, Rule};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{RuleStore, SqliteRuleStore};

/// Errors that can occur during channel and rule operations.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("channel not found: {0}")]
    ChannelNotFound(i64),
    #[error("rule not found: {0}")]
    RuleNotFound(i64),
    /// The rule is inconsistent with its family or filter.
    #[error("invalid rule: {0}")]
    Invalid(String),
}

/// Parameters for creating a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelParams {
    pub provider_id: String,
    pub data: serde_json::Value,
}

/// Parameters for creating a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRuleParams {
    pub channel_id: i64,
    pub family: Family,
    pub filter: Option<Filter>,
    pub category_id: Option<i64>,
    pub group_id: Option<i64>,
    pub tags: BTreeSet<String>,
}

const CHANNEL_COLUMNS: &str = "id, provider_id, data_json, error_key, error_info, created_at";
const RULE_COLUMNS: &str =
    "id, channel_id, family, filter, category_id, group_id, tags_json, created_at";

/// Creates a channel and returns the stored record.
pub fn create_channel(conn: &Connection, params: &CreateChannelParams) -> Result<Channel, RuleError> {
    if params.provider_id.trim().is_empty() {
        return Err(RuleError::Invalid("provider_id must not be empty".to_string()));
    }
    let data_json = serde_json::to_string(&params.data)?;
    conn.execute(
        "INSERT INTO channels (provider_id, data_json) VALUES (?1, ?2)",
        params![params.provider_id, data_json],
    )?;
    get_channel(conn, conn.last_insert_rowid())
}

/// Retrieves a channel by ID.
pub fn get_channel(conn: &Connection, channel_id: i64) -> Result<Channel, RuleError> {
    find_channel(conn, channel_id)?.ok_or(RuleError::ChannelNotFound(channel_id))
}

/// Retrieves a channel by ID, returning `None` if it does not exist.
pub fn find_channel(conn: &Connection, channel_id: i64) -> Result<Option<Channel>, RuleError> {
    let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [channel_id], map_row_to_channel)
        .optional()?)
}

/// Lists every channel, oldest first.
pub fn list_channels(conn: &Connection) -> Result<Vec<Channel>, RuleError> {
    let sql = format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_row_to_channel)?;
    let mut channels = Vec::new();
    for row in rows {
        channels.push(row?);
    }
    Ok(channels)
}

/// Lists channels whose last delivery failed.
pub fn list_failing_channels(conn: &Connection) -> Result<Vec<Channel>, RuleError> {
    let sql = format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels WHERE error_key IS NOT NULL ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], map_row_to_channel)?;
    let mut channels = Vec::new();
    for row in rows {
        channels.push(row?);
    }
    Ok(channels)
}

/// Deletes a channel together with its rules.
pub fn delete_channel(conn: &Connection, channel_id: i64) -> Result<(), RuleError> {
    let count = conn.execute("DELETE FROM channels WHERE id = ?1", [channel_id])?;
    if count == 0 {
        return Err(RuleError::ChannelNotFound(channel_id));
    }
    Ok(())
}

/// Overwrites a channel's error marker. `None` clears it.
///
/// The marker is never accumulated: each delivery attempt replaces whatever
/// the previous one left behind.
pub fn set_channel_error(
    conn: &Connection,
    channel_id: i64,
    marker: Option<&ErrorMarker>,
) -> Result<(), RuleError> {
    let (key, info) = match marker {
        Some(m) => (Some(m.key.as_str()), m.info.as_deref()),
        None => (None, None),
    };
    let count = conn.execute(
        "UPDATE channels SET error_key = ?1, error_info = ?2 WHERE id = ?3",
        params![key, info, channel_id],
    )?;
    if count == 0 {
        return Err(RuleError::ChannelNotFound(channel_id));
    }
    Ok(())
}

fn map_row_to_channel(row: &Row) -> rusqlite::Result<Channel> {
    let data_json: String = row.get(2)?;
    let data = serde_json::from_str(&data_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Channel {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        data,
        error_key: row.get(3)?,
        error_info: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Checks that a rule makes sense for its family and filter, and returns the
/// normalized tag set.
///
/// Configuration mistakes are reported here, to the administrator creating
/// the rule. The routing path never sees an error for them.
pub fn validate_rule(params: &CreateRuleParams) -> Result<BTreeSet<String>, RuleError> {
    let filter = params
        .filter
        .ok_or_else(|| RuleError::Invalid("filter is required".to_string()))?;

    let mut tags = BTreeSet::new();
    for tag in &params.tags {
        let tag = normalize_tag(tag);
        if tag.is_empty() {
            return Err(RuleError::Invalid("tags must not be blank".to_string()));
        }
        tags.insert(tag);
    }

    match params.family {
        Family::Normal => {
            if params.group_id.is_some() {
                return Err(RuleError::Invalid(
                    "normal rules cannot be keyed on a group".to_string(),
                ));
            }
            if filter == Filter::TagAdded && tags.is_empty() {
                return Err(RuleError::Invalid(
                    "tag_added rules need at least one tag".to_string(),
                ));
            }
        }
        family => {
            if params.group_id.is_none() {
                return Err(RuleError::Invalid(format!("{family} rules require a group")));
            }
            if params.category_id.is_some() {
                return Err(RuleError::Invalid(format!(
                    "{family} rules cannot be restricted to a category"
                )));
            }
            if filter == Filter::TagAdded {
                return Err(RuleError::Invalid(format!(
                    "tag_added is not supported for {family} rules"
                )));
            }
        }
    }

    Ok(tags)
}

/// Validates and creates a rule, returning the stored record.
pub fn create_rule(conn: &Connection, params: &CreateRuleParams) -> Result<Rule, RuleError> {
    let tags = validate_rule(params)?;
    let filter = params
        .filter
        .ok_or_else(|| RuleError::Invalid("filter is required".to_string()))?;
    // Surface a missing channel as NotFound rather than a foreign key failure.
    get_channel(conn, params.channel_id)?;

    let tags_json = serde_json::to_string(&tags)?;
    conn.execute(
        "INSERT INTO rules (channel_id, family, filter, category_id, group_id, tags_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            params.channel_id,
            params.family.as_str(),
            filter.as_str(),
            params.category_id,
            params.group_id,
            tags_json,
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::debug!(
        rule_id = id,
        channel_id = params.channel_id,
        family = %params.family,
        filter = %filter,
        "created rule"
    );
    get_rule(conn, id)
}

/// Retrieves a rule by ID.
pub fn get_rule(conn: &Connection, rule_id: i64) -> Result<Rule, RuleError> {
    let sql = format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1");
    conn.query_row(&sql, [rule_id], map_row_to_rule)
        .optional()?
        .ok_or(RuleError::RuleNotFound(rule_id))
}

/// Lists every rule of a family, in creation order.
///
/// Rows that cannot be decoded are logged and left out, so one corrupt rule
/// cannot stop routing for every other channel. Connection and query
/// failures are still returned.
pub fn list_rules_for_family(conn: &Connection, family: Family) -> Result<Vec<Rule>, RuleError> {
    let sql = format!("SELECT {RULE_COLUMNS} FROM rules WHERE family = ?1 ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([family.as_str()], |row| {
        Ok((row.get::<_, i64>(0)?, map_row_to_rule(row)))
    })?;
    let mut rules = Vec::new();
    for row in rows {
        let (rule_id, decoded) = row?;
        match decoded {
            Ok(rule) => rules.push(rule),
            Err(error) => {
                tracing::warn!(rule_id, %family, %error, "skipping malformed rule");
            }
        }
    }
    Ok(rules)
}

/// Lists every rule attached to a channel, in creation order.
pub fn list_rules_for_channel(conn: &Connection, channel_id: i64) -> Result<Vec<Rule>, RuleError> {
    let sql = format!("SELECT {RULE_COLUMNS} FROM rules WHERE channel_id = ?1 ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([channel_id], map_row_to_rule)?;
    let mut rules = Vec::new();
    for row in rows {
        rules.push(row?);
    }
    Ok(rules)
}

/// Deletes a rule.
pub fn delete_rule(conn: &Connection, rule_id: i64) -> Result<(), RuleError> {
    let count = conn.execute("DELETE FROM rules WHERE id = ?1", [rule_id])?;
    if count == 0 {
        return Err(RuleError::RuleNotFound(rule_id));
    }
    Ok(())
}

fn map_row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    let family_str: String = row.get(2)?;
    let family: Family = family_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let filter_str: String = row.get(3)?;
    let filter: Filter = filter_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let tags_json: String = row.get(6)?;
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Rule {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        family,
        filter,
        category_id: row.get(4)?,
        group_id: row.get(5)?,
        tags,
        created_at: row.get(7)?,
    })
}
