//! Shared types for the Herald notification router.
//!
//! This crate holds the vocabulary every other Herald crate speaks: rule
//! families and filters, the persisted `Rule` and `Channel` records, the
//! read-only `EventContext` describing one post, and the delivery error
//! taxonomy that providers report back to the router.
//!
//! Nothing in here touches storage or the network. Keeping these types in a
//! leaf crate lets the store, the router, and provider implementations agree
//! on them without depending on each other.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error marker recorded on a channel when a provider fails without a
/// structured error code.
pub const CHANNEL_EXCEPTION_KEY: &str = "chat_integration.channel_exception";

/// Independent evaluation track a rule belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// Category/tag based rules for public topics.
    #[default]
    Normal,
    /// Rules keyed on groups with standing access to a private message.
    GroupMessage,
    /// Rules keyed on groups mentioned in the post body.
    GroupMention,
}

impl Family {
    /// All families, in evaluation order.
    pub const ALL: [Family; 3] = [Family::Normal, Family::GroupMessage, Family::GroupMention];

    /// Returns the canonical storage label for this family.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::GroupMessage => "group_message",
            Self::GroupMention => "group_mention",
        }
    }

    /// Whether rules of this family are keyed on a group rather than a category.
    pub fn is_group_family(self) -> bool {
        matches!(self, Self::GroupMessage | Self::GroupMention)
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Family {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "group_message" => Ok(Self::GroupMessage),
            "group_mention" => Ok(Self::GroupMention),
            _ => Err(ParseLabelError {
                kind: "family",
                value: s.to_string(),
            }),
        }
    }
}

/// Action prescribed by a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Notify on every new topic and reply.
    Watch,
    /// Notify on new topics only.
    Follow,
    /// Never notify.
    Mute,
    /// Like `Watch`, but providers should thread replies together.
    Thread,
    /// Notify when one of the rule's tags is newly attached to the topic.
    TagAdded,
}

impl Filter {
    /// Returns the canonical storage label for this filter.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Watch => "watch",
            Self::Follow => "follow",
            Self::Mute => "mute",
            Self::Thread => "thread",
            Self::TagAdded => "tag_added",
        }
    }

    /// The delivery hint this filter carries when it fires. `Mute` never fires.
    pub fn hint(self) -> Option<FilterHint> {
        match self {
            Self::Watch => Some(FilterHint::Watch),
            Self::Follow => Some(FilterHint::Follow),
            Self::Thread => Some(FilterHint::Thread),
            Self::TagAdded => Some(FilterHint::TagAdded),
            Self::Mute => None,
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Filter {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watch" => Ok(Self::Watch),
            "follow" => Ok(Self::Follow),
            "mute" => Ok(Self::Mute),
            "thread" => Ok(Self::Thread),
            "tag_added" => Ok(Self::TagAdded),
            _ => Err(ParseLabelError {
                kind: "filter",
                value: s.to_string(),
            }),
        }
    }
}

/// Delivery style passed through to a provider for a notified channel.
///
/// The hint is purely informative; it never changes which channels are
/// notified. The derived ordering is declaration order, not
/// [`precedence`](Self::precedence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterHint {
    Watch,
    Follow,
    Thread,
    TagAdded,
}

impl FilterHint {
    /// Ranking used when several rules fire for the same channel.
    /// Higher wins; `Thread` outranks everything.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Thread => 3,
            Self::Watch => 2,
            Self::Follow => 1,
            Self::TagAdded => 0,
        }
    }
}

/// Error returned when parsing an unknown family or filter label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseLabelError {
    /// Which enumeration was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// A routing rule attached to a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    /// Store-assigned ID. Later rules have larger IDs.
    pub id: i64,
    /// Channel this rule notifies.
    pub channel_id: i64,
    pub family: Family,
    pub filter: Filter,
    /// Category restriction; `None` is a wildcard. Only used by `Normal` rules.
    pub category_id: Option<i64>,
    /// Group the rule is keyed on. Required for group families.
    pub group_id: Option<i64>,
    /// Tag restriction; empty means no restriction.
    pub tags: BTreeSet<String>,
    /// Creation timestamp (ISO 8601).
    pub created_at: String,
}

impl Rule {
    /// Whether this `Normal` rule applies to every category.
    pub fn is_wildcard(&self) -> bool {
        self.category_id.is_none()
    }
}

/// A delivery destination bound to one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    /// Store-assigned ID.
    pub id: i64,
    /// Name of the provider that delivers to this channel (e.g. "slack").
    pub provider_id: String,
    /// Provider-specific parameters (webhook URL, room identifier, ...).
    pub data: serde_json::Value,
    /// Last delivery error code, `None` after a clean delivery.
    pub error_key: Option<String>,
    /// Provider supplied detail for `error_key`, as a JSON string.
    pub error_info: Option<String>,
    /// Creation timestamp (ISO 8601).
    pub created_at: String,
}

/// Error state written to a channel after a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub key: String,
    pub info: Option<String>,
}

impl ErrorMarker {
    /// The marker for failures that carry no structured code.
    pub fn generic() -> Self {
        Self {
            key: CHANNEL_EXCEPTION_KEY.to_string(),
            info: None,
        }
    }
}

/// Kind of post that triggered an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostType {
    #[default]
    Regular,
    /// Synthetic post recording a metadata change (category move, retag).
    SmallAction,
    ModeratorAction,
    Whisper,
}

/// Canonical form of a tag name, used for rules and events alike.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Identity used to evaluate whether a post may be announced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    /// The built-in system user.
    System,
    /// A named user account.
    User(String),
}

impl Identity {
    /// Builds the acting identity from an optional username setting.
    /// Blank or missing settings fall back to the system identity.
    pub fn from_setting(username: Option<&str>) -> Self {
        match username.map(str::trim) {
            Some(name) if !name.is_empty() => Self::User(name.to_string()),
            _ => Self::System,
        }
    }
}

/// Facts about a single post, derived from the content store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventContext {
    pub post_id: i64,
    pub topic_id: i64,
    /// `None` for private messages and uncategorized topics.
    pub category_id: Option<i64>,
    pub is_private_message: bool,
    /// 1 for the opening post of a topic.
    pub post_number: u32,
    pub post_type: PostType,
    /// Tags newly attached by this event.
    pub added_tags: BTreeSet<String>,
    /// Full tag set of the topic at evaluation time.
    pub current_tags: BTreeSet<String>,
    /// Groups referenced by mention in the post body.
    pub mentioned_groups: BTreeSet<i64>,
    /// Groups with standing access to the topic. Private messages only.
    pub participant_groups: BTreeSet<i64>,
    pub is_category_change_event: bool,
    pub is_tag_change_event: bool,
}

impl EventContext {
    /// Whether this event records a metadata change rather than new content.
    pub fn is_metadata_change(&self) -> bool {
        self.is_category_change_event || self.is_tag_change_event
    }

    /// A new topic or reply carrying user content.
    pub fn is_ordinary_post(&self) -> bool {
        !self.is_metadata_change()
    }

    /// The opening post of a new topic.
    pub fn is_new_topic(&self) -> bool {
        self.post_number == 1 && self.is_ordinary_post()
    }

    /// A copy with `added_tags` and `current_tags` in canonical form, so
    /// they compare equal to stored rule tags.
    pub fn with_normalized_tags(&self) -> Self {
        let normalize = |tags: &BTreeSet<String>| -> BTreeSet<String> {
            tags.iter()
                .map(|t| normalize_tag(t))
                .filter(|t| !t.is_empty())
                .collect()
        };
        Self {
            added_tags: normalize(&self.added_tags),
            current_tags: normalize(&self.current_tags),
            ..self.clone()
        }
    }

    /// Whether the router should consider this post at all.
    ///
    /// Regular posts always qualify. Small-action posts qualify only when
    /// they record a category or tag change.
    pub fn is_routable(&self) -> bool {
        match self.post_type {
            PostType::Regular => true,
            PostType::SmallAction => self.is_metadata_change(),
            PostType::ModeratorAction | PostType::Whisper => false,
        }
    }
}

/// Failure reported by a delivery provider.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// A known condition with a stable code, recorded verbatim on the channel.
    #[error("provider reported {code}")]
    Structured {
        code: String,
        info: Option<serde_json::Value>,
    },

    /// Any other failure. Only the generic marker reaches the channel record.
    #[error("delivery failed: {0}")]
    Other(String),
}

impl DeliveryError {
    /// Convenience constructor for a structured error without detail.
    pub fn code(code: impl Into<String>) -> Self {
        Self::Structured {
            code: code.into(),
            info: None,
        }
    }
}
