//! The routing engine: gate, resolve, union, deliver, record.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use herald_rules::RuleStore;
use herald_types::{ErrorMarker, EventContext, Family, FilterHint};
use serde::Serialize;
use tokio::task::{self, spawn_blocking, JoinHandle, JoinSet};

use crate::config::RouterConfig;
use crate::context::{ContentStore, VisibilityOracle};
use crate::delivery::{
    error_marker_for, DeliveryOutcome, ProviderLookup, ProviderRegistry, SkipReason,
};
use crate::error::RouteError;
use crate::matcher::MatchOptions;
use crate::resolver::{Candidate, RESOLVERS};

/// A channel to notify, after all families have been unioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub channel_id: i64,
    pub hint: FilterHint,
    /// Families that selected this channel, in evaluation order.
    pub families: Vec<Family>,
    /// Rules that selected this channel, one per family.
    pub rule_ids: Vec<i64>,
}

/// Merges per-family candidates into one notification per channel.
///
/// `thread` wins as the hint whenever any family asked for it; otherwise
/// the first family's hint is kept. Candidates must arrive in family
/// evaluation order.
pub fn union_candidates(candidates: impl IntoIterator<Item = Candidate>) -> Vec<Notification> {
    let mut merged: BTreeMap<i64, Notification> = BTreeMap::new();
    for candidate in candidates {
        let entry = merged
            .entry(candidate.channel_id)
            .or_insert_with(|| Notification {
                channel_id: candidate.channel_id,
                hint: candidate.hint,
                families: Vec::new(),
                rule_ids: Vec::new(),
            });
        if !entry.families.contains(&candidate.family) {
            entry.families.push(candidate.family);
        }
        entry.rule_ids.push(candidate.rule_id);
        if candidate.hint == FilterHint::Thread {
            entry.hint = FilterHint::Thread;
        }
    }
    merged.into_values().collect()
}

/// Delivery record for one notified channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDelivery {
    pub channel_id: i64,
    pub hint: FilterHint,
    pub families: Vec<Family>,
    pub outcome: DeliveryOutcome,
}

/// Everything a routing pass did, ordered by channel id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    pub post_id: i64,
    pub deliveries: Vec<ChannelDelivery>,
}

impl RouteReport {
    fn empty(post_id: i64) -> Self {
        Self {
            post_id,
            deliveries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Channels in the notification set, whatever their delivery outcome.
    pub fn notified_channels(&self) -> Vec<i64> {
        self.deliveries.iter().map(|d| d.channel_id).collect()
    }

    pub fn delivery_for(&self, channel_id: i64) -> Option<&ChannelDelivery> {
        self.deliveries.iter().find(|d| d.channel_id == channel_id)
    }
}

/// Routes post events to chat channels.
///
/// Holds no per-event state; concurrent `route` calls for different posts
/// share nothing but the collaborators.
pub struct RoutingEngine {
    config: RouterConfig,
    content: Arc<dyn ContentStore>,
    visibility: Arc<dyn VisibilityOracle>,
    rules: Arc<dyn RuleStore>,
    providers: Arc<ProviderRegistry>,
}

impl RoutingEngine {
    pub fn new(
        config: RouterConfig,
        content: Arc<dyn ContentStore>,
        visibility: Arc<dyn VisibilityOracle>,
        rules: Arc<dyn RuleStore>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            config,
            content,
            visibility,
            rules,
            providers: Arc::new(providers),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn match_options(&self) -> MatchOptions {
        MatchOptions {
            tagging_enabled: self.config.tagging_enabled,
        }
    }

    /// Notifies every channel whose rules select `post_id`.
    ///
    /// Returns an empty report when routing is disabled, the post is gone or
    /// not routable, or the acting identity cannot see it. Delivery failures
    /// are recorded on their channel and in the report, never returned.
    ///
    /// # Errors
    ///
    /// Returns `RouteError` only when the event context, the visibility
    /// answer, or the rules cannot be loaded. No delivery has been attempted
    /// in that case.
    pub async fn route(&self, post_id: i64) -> Result<RouteReport, RouteError> {
        if !self.config.enabled {
            tracing::debug!(post_id, "routing disabled, skipping post");
            return Ok(RouteReport::empty(post_id));
        }

        let content = Arc::clone(&self.content);
        let event = spawn_blocking(move || content.event_context(post_id))
            .await?
            .map_err(RouteError::Content)?;
        let Some(event) = event else {
            tracing::debug!(post_id, "post not found, skipping");
            return Ok(RouteReport::empty(post_id));
        };
        if !event.is_routable() {
            tracing::debug!(post_id, post_type = ?event.post_type, "post type is not routed");
            return Ok(RouteReport::empty(post_id));
        }

        if !self.is_visible(&event).await? {
            tracing::debug!(post_id, "acting identity cannot see post, skipping");
            return Ok(RouteReport::empty(post_id));
        }

        let notifications = self.resolve(&event).await?;
        let deliveries = self.deliver_all(Arc::new(event), notifications).await;

        tracing::info!(
            post_id,
            notified = deliveries.len(),
            delivered = deliveries.iter().filter(|d| d.outcome.is_delivered()).count(),
            "routed post"
        );
        Ok(RouteReport {
            post_id,
            deliveries,
        })
    }

    async fn is_visible(&self, event: &EventContext) -> Result<bool, RouteError> {
        let visibility = Arc::clone(&self.visibility);
        let identity = self.config.acting_identity();
        let event = event.clone();
        spawn_blocking(move || visibility.can_see(&identity, &event))
            .await?
            .map_err(RouteError::Visibility)
    }

    /// Computes the notification set for `event` from a fresh rule snapshot.
    ///
    /// This is the pure decision half of [`route`](Self::route): it skips the
    /// visibility gate and performs no delivery. Event tags are compared in
    /// the same canonical form as stored rule tags.
    pub async fn resolve(&self, event: &EventContext) -> Result<Vec<Notification>, RouteError> {
        let opts = self.match_options();
        let event = &event.with_normalized_tags();
        let mut candidates = Vec::new();
        for (family, resolver) in RESOLVERS {
            let store = Arc::clone(&self.rules);
            let rules = spawn_blocking(move || store.rules_for_family(family)).await??;
            let found = resolver(event, &rules, opts);
            tracing::debug!(
                post_id = event.post_id,
                %family,
                rules = rules.len(),
                channels = found.len(),
                "resolved family"
            );
            candidates.extend(found);
        }
        Ok(union_candidates(candidates))
    }

    async fn deliver_all(
        &self,
        event: Arc<EventContext>,
        notifications: Vec<Notification>,
    ) -> Vec<ChannelDelivery> {
        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();
        for notification in notifications {
            let job = DeliveryJob {
                rules: Arc::clone(&self.rules),
                providers: Arc::clone(&self.providers),
                event: Arc::clone(&event),
                timeout: self.config.delivery_timeout(),
            };
            let handle = tasks.spawn(job.run(notification.channel_id, notification.hint));
            pending.insert(handle.id(), notification);
        }

        collect_deliveries(tasks, pending).await
    }
}

/// Drains delivery tasks into one record per notified channel.
///
/// `pending` maps each task to the notification it serves, so a task that
/// dies without an outcome is still reported for its channel.
async fn collect_deliveries(
    mut tasks: JoinSet<DeliveryOutcome>,
    mut pending: HashMap<task::Id, Notification>,
) -> Vec<ChannelDelivery> {
    let mut deliveries = Vec::with_capacity(pending.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(error = %e, "delivery task failed");
                (e.id(), DeliveryOutcome::Aborted)
            }
        };
        if let Some(notification) = pending.remove(&id) {
            deliveries.push(ChannelDelivery {
                channel_id: notification.channel_id,
                hint: notification.hint,
                families: notification.families,
                outcome,
            });
        }
    }
    deliveries.sort_by_key(|d| d.channel_id);
    deliveries
}

/// Aborts the wrapped task when dropped, so cancelling a routing pass also
/// cancels the provider calls it started.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything one channel's delivery needs, owned so it can run as its own
/// task.
struct DeliveryJob {
    rules: Arc<dyn RuleStore>,
    providers: Arc<ProviderRegistry>,
    event: Arc<EventContext>,
    timeout: Duration,
}

impl DeliveryJob {
    async fn run(self, channel_id: i64, hint: FilterHint) -> DeliveryOutcome {
        let post_id = self.event.post_id;

        let store = Arc::clone(&self.rules);
        let channel = match spawn_blocking(move || store.channel(channel_id)).await {
            Ok(Ok(Some(channel))) => channel,
            Ok(Ok(None)) => {
                tracing::warn!(post_id, channel_id, "channel disappeared before delivery");
                return DeliveryOutcome::Skipped(SkipReason::ChannelMissing);
            }
            Ok(Err(e)) => {
                tracing::error!(post_id, channel_id, error = %e, "failed to load channel");
                return DeliveryOutcome::Skipped(SkipReason::ChannelUnavailable);
            }
            Err(e) => {
                tracing::error!(post_id, channel_id, error = %e, "channel lookup task failed");
                return DeliveryOutcome::Skipped(SkipReason::ChannelUnavailable);
            }
        };

        let provider_id = channel.provider_id.clone();
        let adapter = match self.providers.lookup(&provider_id) {
            ProviderLookup::Enabled(adapter) => adapter,
            ProviderLookup::Disabled => {
                tracing::debug!(post_id, channel_id, provider = %provider_id, "provider disabled");
                return DeliveryOutcome::Skipped(SkipReason::ProviderDisabled { provider_id });
            }
            ProviderLookup::Unknown => {
                tracing::warn!(post_id, channel_id, provider = %provider_id, "no adapter for provider");
                return DeliveryOutcome::Skipped(SkipReason::UnknownProvider { provider_id });
            }
        };

        let had_error = channel.error_key.is_some();
        let event = Arc::clone(&self.event);
        // The adapter runs in its own task so a panic is contained to this channel.
        let mut call = AbortOnDrop(tokio::spawn(async move {
            adapter.deliver(&channel, &event, hint).await
        }));

        let (outcome, marker) = match tokio::time::timeout(self.timeout, &mut call.0).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(post_id, channel_id, provider = %provider_id, "delivered");
                (DeliveryOutcome::Delivered, None)
            }
            Ok(Ok(Err(err))) => {
                let marker = error_marker_for(&err);
                tracing::warn!(
                    post_id,
                    channel_id,
                    provider = %provider_id,
                    error_key = %marker.key,
                    error = %err,
                    "delivery failed"
                );
                (
                    DeliveryOutcome::Failed {
                        error_key: marker.key.clone(),
                    },
                    Some(marker),
                )
            }
            Ok(Err(join)) => {
                tracing::error!(post_id, channel_id, provider = %provider_id, error = %join, "delivery adapter panicked");
                let marker = ErrorMarker::generic();
                (
                    DeliveryOutcome::Failed {
                        error_key: marker.key.clone(),
                    },
                    Some(marker),
                )
            }
            Err(_) => {
                call.0.abort();
                tracing::warn!(
                    post_id,
                    channel_id,
                    provider = %provider_id,
                    timeout_ms = self.timeout.as_millis(),
                    "delivery timed out"
                );
                (DeliveryOutcome::TimedOut, Some(ErrorMarker::generic()))
            }
        };

        if marker.is_none() && !had_error {
            return outcome;
        }

        let store = Arc::clone(&self.rules);
        match spawn_blocking(move || store.record_delivery_result(channel_id, marker.as_ref())).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(post_id, channel_id, error = %e, "failed to record delivery result")
            }
            Err(e) => {
                tracing::error!(post_id, channel_id, error = %e, "delivery result task failed")
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(channel_id: i64, rule_id: i64, family: Family, hint: FilterHint) -> Candidate {
        Candidate {
            channel_id,
            rule_id,
            family,
            hint,
        }
    }

    #[test]
    fn channel_matched_by_two_families_is_notified_once() {
        let merged = union_candidates([
            candidate(10, 1, Family::Normal, FilterHint::Watch),
            candidate(10, 7, Family::GroupMention, FilterHint::Watch),
            candidate(11, 3, Family::GroupMention, FilterHint::Follow),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].channel_id, 10);
        assert_eq!(merged[0].families, vec![Family::Normal, Family::GroupMention]);
        assert_eq!(merged[0].rule_ids, vec![1, 7]);
    }

    #[test]
    fn thread_hint_takes_precedence_in_union() {
        let merged = union_candidates([
            candidate(10, 1, Family::Normal, FilterHint::Watch),
            candidate(10, 2, Family::GroupMention, FilterHint::Thread),
        ]);
        assert_eq!(merged[0].hint, FilterHint::Thread);

        let merged = union_candidates([
            candidate(10, 1, Family::Normal, FilterHint::Follow),
            candidate(10, 2, Family::GroupMention, FilterHint::Watch),
        ]);
        assert_eq!(merged[0].hint, FilterHint::Follow);
    }

    async fn crash() -> DeliveryOutcome {
        panic!("delivery bug")
    }

    #[tokio::test]
    async fn failed_task_is_still_reported_for_its_channel() {
        let notification = |channel_id| Notification {
            channel_id,
            hint: FilterHint::Watch,
            families: vec![Family::Normal],
            rule_ids: vec![channel_id],
        };

        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();
        let ok = tasks.spawn(async { DeliveryOutcome::Delivered });
        pending.insert(ok.id(), notification(1));
        let crashed = tasks.spawn(crash());
        pending.insert(crashed.id(), notification(2));

        let deliveries = collect_deliveries(tasks, pending).await;

        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].outcome, DeliveryOutcome::Delivered);
        assert_eq!(deliveries[0].families, vec![Family::Normal]);
        assert_eq!(deliveries[1].channel_id, 2);
        assert_eq!(deliveries[1].outcome, DeliveryOutcome::Aborted);
    }

    #[test]
    fn empty_report_has_no_channels() {
        let report = RouteReport::empty(5);
        assert!(report.is_empty());
        assert!(report.notified_channels().is_empty());
        assert_eq!(report.delivery_for(1), None);
    }
}
