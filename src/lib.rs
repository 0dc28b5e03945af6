//! # coinfeed - resilient crypto market data and news
//!
//! Reaches a market-data provider and a news provider through an ordered set
//! of interchangeable HTTP relays, and keeps a dashboard supplied with prices
//! even when relays or providers misbehave.
//!
//! ## Architecture
//!
//! - **API**: relay registry with cooldowns, circuit breaker, the resilient
//!   fetcher and payload conversion
//! - **Events**: connection status derived from fetch outcomes
//! - **Feed**: polling scheduler, price subscriptions and the news client
//! - **State**: domain records and fallback data
//! - **Config**: configuration management

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{ConnectionState, ConnectionStatus, StatusStream};
pub use feed::{Feeds, NewsFeed, PriceFeed, PriceSubscription, SchedulerState};
pub use state::{Article, CoinSnapshot, PricePoint, Timeframe};
