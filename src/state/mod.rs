//! Domain records handed to consumers, plus the fixed fallback set.

pub mod fallback;
mod market_state;
mod news_state;

pub use market_state::{CoinSnapshot, PricePoint, Timeframe};
pub use news_state::Article;
