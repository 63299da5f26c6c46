//! Delivery provider contract, the provider registry, and the mapping from
//! delivery results to channel error markers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use herald_types::{Channel, DeliveryError, ErrorMarker, EventContext, FilterHint};
use serde::Serialize;

use crate::config::ProviderConfig;

/// A chat provider able to post into its channels.
///
/// Implementations own their transport, timeouts, and retries. The router
/// bounds each call with its own timeout as well, so a stuck provider cannot
/// hold up other channels.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Provider id matched against `Channel::provider_id`.
    fn provider_id(&self) -> &str;

    /// Posts a notification about `event` into `channel`.
    async fn deliver(
        &self,
        channel: &Channel,
        event: &EventContext,
        hint: FilterHint,
    ) -> Result<(), DeliveryError>;
}

/// Result of looking up the provider for a channel.
pub enum ProviderLookup {
    Enabled(Arc<dyn DeliveryAdapter>),
    Disabled,
    Unknown,
}

/// Registered delivery adapters, keyed by provider id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn DeliveryAdapter>>,
    disabled: BTreeSet<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `adapter`, replacing any adapter with the same provider id.
    pub fn register(&mut self, adapter: Arc<dyn DeliveryAdapter>) -> &mut Self {
        let id = adapter.provider_id().to_string();
        if self.adapters.insert(id.clone(), adapter).is_some() {
            tracing::warn!(provider = %id, "replacing registered delivery adapter");
        }
        self
    }

    /// Applies the `[providers.*]` configuration tables.
    pub fn apply_settings(&mut self, settings: &BTreeMap<String, ProviderConfig>) -> &mut Self {
        for (id, provider) in settings {
            self.set_enabled(id, provider.enabled);
        }
        self
    }

    pub fn set_enabled(&mut self, provider_id: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(provider_id);
        } else {
            self.disabled.insert(provider_id.to_string());
        }
    }

    pub fn lookup(&self, provider_id: &str) -> ProviderLookup {
        match self.adapters.get(provider_id) {
            None => ProviderLookup::Unknown,
            Some(_) if self.disabled.contains(provider_id) => ProviderLookup::Disabled,
            Some(adapter) => ProviderLookup::Enabled(Arc::clone(adapter)),
        }
    }
}

/// Why a notified channel was not handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The channel was deleted between matching and delivery.
    ChannelMissing,
    /// The channel record could not be read.
    ChannelUnavailable,
    UnknownProvider { provider_id: String },
    ProviderDisabled { provider_id: String },
}

/// What happened to one channel's delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// The provider failed; `error_key` is what was recorded on the channel.
    Failed { error_key: String },
    /// The provider did not answer within the delivery timeout.
    TimedOut,
    /// The delivery task died before producing an outcome. Nothing was
    /// recorded on the channel.
    Aborted,
    Skipped(SkipReason),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Error marker to persist for a failed delivery.
///
/// Structured errors keep their code and detail; anything else collapses to
/// the generic exception marker with no provider detail.
pub fn error_marker_for(error: &DeliveryError) -> ErrorMarker {
    match error {
        DeliveryError::Structured { code, info } => ErrorMarker {
            key: code.clone(),
            info: info.as_ref().map(|v| v.to_string()),
        },
        DeliveryError::Other(_) => ErrorMarker::generic(),
    }
}
