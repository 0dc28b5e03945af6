//! Consumer-facing feeds.
//!
//! [`PriceFeed`] serves live prices, snapshots and history and owns the
//! polling loop; [`NewsFeed`] serves headlines. Each owns its own fetcher, so
//! a failing news provider never suspends price polling.

mod news;
mod prices;
mod scheduler;
mod subscriptions;

pub use news::NewsFeed;
pub use prices::{PriceFeed, PriceSubscription};
pub use scheduler::{SchedulerState, markets_path};
pub use subscriptions::{SubscriberId, SubscriptionRegistry};

use crate::config::Config;
use crate::error::Result;

/// Both feeds, wired from one configuration.
pub struct Feeds {
    pub prices: PriceFeed,
    pub news: NewsFeed,
}

impl Feeds {
    /// Build both feeds. Must be called within a Tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            prices: PriceFeed::from_config(config)?,
            news: NewsFeed::from_config(config)?,
        })
    }
}
