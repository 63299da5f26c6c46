//! Family resolvers: turn matched rules into channels to notify.
//!
//! Each family is evaluated on its own. A resolver never sees the rules or
//! results of another family; the engine unions their output afterwards.

use std::collections::BTreeMap;

use herald_types::{EventContext, Family, Filter, FilterHint, Rule};

use crate::matcher::{
    match_group_mention, match_group_message, match_normal, tags_intersect, MatchOptions,
};

/// A channel one family wants notified, and the rule that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub channel_id: i64,
    pub rule_id: i64,
    pub family: Family,
    pub hint: FilterHint,
}

/// Signature shared by every family resolver.
pub type Resolver = fn(&EventContext, &[Rule], MatchOptions) -> Vec<Candidate>;

/// One resolver per family, in evaluation order.
pub const RESOLVERS: [(Family, Resolver); 3] = [
    (Family::Normal, resolve_normal),
    (Family::GroupMessage, resolve_group_message),
    (Family::GroupMention, resolve_group_mention),
];

/// Whether a matched rule fires for this kind of event, following the
/// new-topic/reply/metadata-change distinctions.
fn fires_for_post(rule: &Rule, event: &EventContext, opts: MatchOptions) -> Option<FilterHint> {
    let fires = match rule.filter {
        Filter::Mute => false,
        Filter::Watch | Filter::Thread => event.is_ordinary_post(),
        // A wildcard follow must not announce topics moved between categories.
        Filter::Follow => {
            event.is_new_topic() || (event.is_category_change_event && !rule.is_wildcard())
        }
        // Only tags attached by this revision count, not ones already present.
        Filter::TagAdded => {
            opts.tagging_enabled
                && event.is_tag_change_event
                && tags_intersect(&rule.tags, &event.added_tags)
        }
    };
    fires.then(|| rule.filter.hint()).flatten()
}

/// Mentions fire regardless of where in the topic they appear.
fn fires_for_mention(rule: &Rule, _event: &EventContext, _opts: MatchOptions) -> Option<FilterHint> {
    match rule.filter {
        Filter::Mute | Filter::TagAdded => None,
        filter => filter.hint(),
    }
}

/// Resolver for `normal` rules: the single most specific rule per channel
/// decides.
pub fn resolve_normal(event: &EventContext, rules: &[Rule], opts: MatchOptions) -> Vec<Candidate> {
    match_normal(event, rules, opts)
        .into_iter()
        .filter_map(|(channel_id, rule)| {
            fires_for_post(rule, event, opts).map(|hint| Candidate {
                channel_id,
                rule_id: rule.id,
                family: Family::Normal,
                hint,
            })
        })
        .collect()
}

/// Resolver for `group_message` rules on private messages.
pub fn resolve_group_message(
    event: &EventContext,
    rules: &[Rule],
    opts: MatchOptions,
) -> Vec<Candidate> {
    let matched = match_group_message(event, rules, opts);
    combine_group_rules(event, matched, Family::GroupMessage, opts, fires_for_post)
}

/// Resolver for `group_mention` rules.
pub fn resolve_group_mention(
    event: &EventContext,
    rules: &[Rule],
    opts: MatchOptions,
) -> Vec<Candidate> {
    let matched = match_group_mention(event, rules, opts);
    combine_group_rules(event, matched, Family::GroupMention, opts, fires_for_mention)
}

/// Several group rules of one channel can match the same event (one per
/// group). A matching `mute` silences the channel for the family; otherwise
/// the firing rule with the strongest hint wins, newest rule on ties.
fn combine_group_rules(
    event: &EventContext,
    matched: BTreeMap<i64, Vec<&Rule>>,
    family: Family,
    opts: MatchOptions,
    fires: fn(&Rule, &EventContext, MatchOptions) -> Option<FilterHint>,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for (channel_id, rules) in matched {
        if let Some(mute) = rules.iter().find(|r| r.filter == Filter::Mute) {
            tracing::debug!(channel_id, rule_id = mute.id, %family, "channel muted for family");
            continue;
        }

        let best = rules
            .iter()
            .filter_map(|rule| fires(rule, event, opts).map(|hint| (hint, *rule)))
            .max_by_key(|(hint, rule)| (hint.precedence(), rule.id));

        if let Some((hint, rule)) = best {
            candidates.push(Candidate {
                channel_id,
                rule_id: rule.id,
                family,
                hint,
            });
        }
    }
    candidates
}
