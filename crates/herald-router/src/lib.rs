//! Notification routing for forum post events.
//!
//! Given a post, the router decides which chat channels should hear about
//! it and hands each one to its delivery provider:
//!
//! 1. A visibility gate: if the acting identity cannot see the post, nothing
//!    happens.
//! 2. Three independent rule families (`normal`, `group_message`,
//!    `group_mention`) each pick channels; the results are unioned so every
//!    channel is notified at most once.
//! 3. Each channel is delivered to concurrently with its own timeout. The
//!    outcome is written to the channel's error marker and never escapes
//!    as an error.
//!
//! # Usage
//!
//! ```rust,ignore
//! use herald_router::{RoutingEngine, ProviderRegistry};
//!
//! let mut providers = ProviderRegistry::new();
//! providers.register(Arc::new(SlackAdapter::new(client)));
//! providers.apply_settings(&config.providers);
//!
//! let engine = RoutingEngine::new(config.router, content, visibility, store, providers);
//! let report = engine.route(post_id).await?;
//! ```

pub mod config;
mod context;
mod delivery;
mod engine;
mod error;
pub mod matcher;
pub mod resolver;

pub use config::{
    init_tracing, load_config, Config, ConfigError, DatabaseConfig, LoggingConfig,
    ProviderConfig, RouterConfig,
};
pub use context::{ContentStore, VisibilityOracle};
pub use delivery::{
    error_marker_for, DeliveryAdapter, DeliveryOutcome, ProviderLookup, ProviderRegistry,
    SkipReason,
};
pub use engine::{union_candidates, ChannelDelivery, Notification, RouteReport, RoutingEngine};
pub use error::{BoxError, RouteError};
pub use matcher::MatchOptions;
pub use resolver::Candidate;
