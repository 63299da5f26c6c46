//! Rule matching: which rules of a family apply to an event, per channel.
//!
//! Matching is pure. It decides applicability only (category, group, tags);
//! whether a matched rule actually fires for this kind of event is the
//! resolver's job.

use std::collections::{BTreeMap, BTreeSet};

use herald_types::{EventContext, Family, Rule};

/// Knobs that affect matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    /// When off, rule tag restrictions are ignored.
    pub tagging_enabled: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            tagging_enabled: true,
        }
    }
}

/// Any-intersection test used for every tag comparison.
pub fn tags_intersect(rule_tags: &BTreeSet<String>, tags: &BTreeSet<String>) -> bool {
    !rule_tags.is_disjoint(tags)
}

fn passes_tag_restriction(rule: &Rule, event: &EventContext, opts: MatchOptions) -> bool {
    !opts.tagging_enabled
        || rule.tags.is_empty()
        || tags_intersect(&rule.tags, &event.current_tags)
}

fn by_channel<'a>(
    rules: &'a [Rule],
    family: Family,
) -> BTreeMap<i64, Vec<&'a Rule>> {
    let mut grouped: BTreeMap<i64, Vec<&Rule>> = BTreeMap::new();
    for rule in rules.iter().filter(|r| r.family == family) {
        grouped.entry(rule.channel_id).or_default().push(rule);
    }
    grouped
}

/// Selects the single most specific `normal` rule for each channel.
///
/// A rule scoped to the event's category beats a wildcard. Among equally
/// specific rules the most recently created one (highest id) wins. The
/// selected rule must also satisfy its tag restriction; if it does not, the
/// channel gets nothing from this family even when a less specific rule
/// would have matched.
///
/// Private messages never match.
pub fn match_normal<'a>(
    event: &EventContext,
    rules: &'a [Rule],
    opts: MatchOptions,
) -> BTreeMap<i64, &'a Rule> {
    let mut matched = BTreeMap::new();
    if event.is_private_message {
        return matched;
    }

    for (channel_id, channel_rules) in by_channel(rules, Family::Normal) {
        let scoped: Vec<&Rule> = match event.category_id {
            Some(category) => channel_rules
                .iter()
                .copied()
                .filter(|r| r.category_id == Some(category))
                .collect(),
            None => Vec::new(),
        };
        let candidates = if scoped.is_empty() {
            channel_rules
                .iter()
                .copied()
                .filter(|r| r.is_wildcard())
                .collect()
        } else {
            scoped
        };

        let Some(selected) = candidates.iter().copied().max_by_key(|r| r.id) else {
            continue;
        };
        if candidates.len() > 1 {
            tracing::warn!(
                channel_id,
                selected_rule = selected.id,
                tied = candidates.len(),
                category_id = ?selected.category_id,
                "equally specific rules for channel, using the most recent"
            );
        }

        if passes_tag_restriction(selected, event, opts) {
            matched.insert(channel_id, selected);
        } else {
            tracing::trace!(channel_id, rule_id = selected.id, "rule tags do not match topic");
        }
    }
    matched
}

/// Rules of `family` keyed on a group, grouped by channel.
///
/// A rule applies when `group_applies` accepts its group and its tag
/// restriction holds. Group rules without a group are a configuration
/// mistake and never match.
fn match_group<'a>(
    event: &EventContext,
    rules: &'a [Rule],
    family: Family,
    opts: MatchOptions,
    group_applies: impl Fn(i64) -> bool,
) -> BTreeMap<i64, Vec<&'a Rule>> {
    let mut matched = BTreeMap::new();
    for (channel_id, channel_rules) in by_channel(rules, family) {
        let applicable: Vec<&Rule> = channel_rules
            .into_iter()
            .filter(|rule| match rule.group_id {
                Some(group) => group_applies(group),
                None => {
                    tracing::warn!(rule_id = rule.id, %family, "group rule has no group, ignoring");
                    false
                }
            })
            .filter(|rule| passes_tag_restriction(rule, event, opts))
            .collect();
        if !applicable.is_empty() {
            matched.insert(channel_id, applicable);
        }
    }
    matched
}

/// `group_message` rules whose group participates in the private message.
pub fn match_group_message<'a>(
    event: &EventContext,
    rules: &'a [Rule],
    opts: MatchOptions,
) -> BTreeMap<i64, Vec<&'a Rule>> {
    if !event.is_private_message {
        return BTreeMap::new();
    }
    match_group(event, rules, Family::GroupMessage, opts, |group| {
        event.participant_groups.contains(&group)
    })
}

/// `group_mention` rules whose group is mentioned in the post.
///
/// Inside a private message the group must also have access to it, so a
/// mention cannot leak the message to outsiders.
pub fn match_group_mention<'a>(
    event: &EventContext,
    rules: &'a [Rule],
    opts: MatchOptions,
) -> BTreeMap<i64, Vec<&'a Rule>> {
    match_group(event, rules, Family::GroupMention, opts, |group| {
        event.mentioned_groups.contains(&group)
            && (!event.is_private_message || event.participant_groups.contains(&group))
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use herald_types::Filter;

    pub(crate) fn rule(id: i64, channel_id: i64, family: Family, filter: Filter) -> Rule {
        Rule {
            id,
            channel_id,
            family,
            filter,
            category_id: None,
            group_id: None,
            tags: BTreeSet::new(),
            created_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    pub(crate) fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|t| t.to_string()).collect()
    }

    fn public_post(category: i64) -> EventContext {
        EventContext {
            post_id: 1,
            topic_id: 1,
            category_id: Some(category),
            post_number: 1,
            ..Default::default()
        }
    }

    #[test]
    fn category_rule_beats_wildcard() {
        let mut scoped = rule(1, 10, Family::Normal, Filter::Mute);
        scoped.category_id = Some(5);
        let wildcard = rule(2, 10, Family::Normal, Filter::Watch);
        let rules = vec![scoped, wildcard];

        let matched = match_normal(&public_post(5), &rules, MatchOptions::default());
        assert_eq!(matched[&10].id, 1);

        let elsewhere = match_normal(&public_post(6), &rules, MatchOptions::default());
        assert_eq!(elsewhere[&10].id, 2);
    }

    #[test]
    fn unrelated_category_and_no_wildcard_matches_nothing() {
        let mut scoped = rule(1, 10, Family::Normal, Filter::Watch);
        scoped.category_id = Some(5);
        let rules = vec![scoped];

        assert!(match_normal(&public_post(6), &rules, MatchOptions::default()).is_empty());
    }

    #[test]
    fn equally_specific_rules_pick_most_recent() {
        let mut older = rule(3, 10, Family::Normal, Filter::Watch);
        older.category_id = Some(5);
        let mut newer = rule(8, 10, Family::Normal, Filter::Mute);
        newer.category_id = Some(5);
        let rules = vec![newer, older];

        let matched = match_normal(&public_post(5), &rules, MatchOptions::default());
        assert_eq!(matched[&10].id, 8);
        assert_eq!(matched[&10].filter, Filter::Mute);
    }

    #[test]
    fn tag_mismatch_on_selected_rule_does_not_fall_back() {
        let mut scoped = rule(1, 10, Family::Normal, Filter::Watch);
        scoped.category_id = Some(5);
        scoped.tags = tags(&["gsoc"]);
        let wildcard = rule(2, 10, Family::Normal, Filter::Watch);
        let rules = vec![scoped, wildcard];

        let mut event = public_post(5);
        event.current_tags = tags(&["other"]);
        assert!(match_normal(&event, &rules, MatchOptions::default()).is_empty());

        event.current_tags = tags(&["other", "gsoc"]);
        assert_eq!(
            match_normal(&event, &rules, MatchOptions::default())[&10].id,
            1
        );
    }

    #[test]
    fn any_rule_tag_is_enough() {
        let mut tagged = rule(1, 10, Family::Normal, Filter::Watch);
        tagged.tags = tags(&["a", "b"]);
        let rules = vec![tagged];

        let mut event = public_post(5);
        event.current_tags = tags(&["b"]);
        assert_eq!(match_normal(&event, &rules, MatchOptions::default()).len(), 1);
    }

    #[test]
    fn tag_restrictions_ignored_when_tagging_disabled() {
        let mut tagged = rule(1, 10, Family::Normal, Filter::Watch);
        tagged.tags = tags(&["gsoc"]);
        let rules = vec![tagged];

        let opts = MatchOptions {
            tagging_enabled: false,
        };
        assert_eq!(match_normal(&public_post(5), &rules, opts).len(), 1);
    }

    #[test]
    fn private_messages_never_match_normal_rules() {
        let rules = vec![rule(1, 10, Family::Normal, Filter::Watch)];
        let event = EventContext {
            is_private_message: true,
            ..public_post(5)
        };
        assert!(match_normal(&event, &rules, MatchOptions::default()).is_empty());
    }

    #[test]
    fn rules_from_other_families_are_ignored() {
        let mut mention = rule(1, 10, Family::GroupMention, Filter::Watch);
        mention.group_id = Some(4);
        let rules = vec![mention];
        assert!(match_normal(&public_post(5), &rules, MatchOptions::default()).is_empty());
    }

    #[test]
    fn group_message_requires_participating_group() {
        let mut member = rule(1, 10, Family::GroupMessage, Filter::Watch);
        member.group_id = Some(4);
        let mut outsider = rule(2, 11, Family::GroupMessage, Filter::Watch);
        outsider.group_id = Some(9);
        let rules = vec![member, outsider];

        let event = EventContext {
            is_private_message: true,
            participant_groups: [4].into_iter().collect(),
            post_number: 2,
            ..Default::default()
        };
        let matched = match_group_message(&event, &rules, MatchOptions::default());
        assert_eq!(matched.keys().copied().collect::<Vec<_>>(), vec![10]);

        let public = EventContext {
            is_private_message: false,
            ..event
        };
        assert!(match_group_message(&public, &rules, MatchOptions::default()).is_empty());
    }

    #[test]
    fn mention_in_private_message_requires_access() {
        let mut mention = rule(1, 10, Family::GroupMention, Filter::Watch);
        mention.group_id = Some(4);
        let rules = vec![mention];

        let public = EventContext {
            mentioned_groups: [4].into_iter().collect(),
            ..public_post(5)
        };
        assert_eq!(
            match_group_mention(&public, &rules, MatchOptions::default()).len(),
            1
        );

        let private = EventContext {
            is_private_message: true,
            category_id: None,
            participant_groups: [7].into_iter().collect(),
            ..public.clone()
        };
        assert!(match_group_mention(&private, &rules, MatchOptions::default()).is_empty());

        let private_with_access = EventContext {
            participant_groups: [4, 7].into_iter().collect(),
            ..private
        };
        assert_eq!(
            match_group_mention(&private_with_access, &rules, MatchOptions::default()).len(),
            1
        );
    }

    #[test]
    fn group_rule_without_group_never_matches() {
        let broken = rule(1, 10, Family::GroupMention, Filter::Watch);
        let rules = vec![broken];
        let event = EventContext {
            mentioned_groups: [4].into_iter().collect(),
            ..public_post(5)
        };
        assert!(match_group_mention(&event, &rules, MatchOptions::default()).is_empty());
    }
}
