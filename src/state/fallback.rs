//! Fixed data served when an upstream can't be reached.
//!
//! Every one-shot fetch falls back to these values so a consumer always has
//! something to render. Prices are static; history is a deterministic wave
//! around the coin's fallback price ending at the current time.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal_macros::dec;

use super::{Article, CoinSnapshot, PricePoint, Timeframe};

/// Price used for history of coins not in [`snapshot`].
const DEFAULT_BASE_PRICE: Decimal = dec!(100);

fn coin(
    id: &str,
    symbol: &str,
    name: &str,
    price: Decimal,
    change: Decimal,
    market_cap: Decimal,
) -> CoinSnapshot {
    CoinSnapshot {
        id: id.to_string(),
        symbol: symbol.to_string(),
        name: name.to_string(),
        image_url: None,
        price,
        change_24h_pct: change,
        market_cap: Some(market_cap),
        volume_24h: None,
        high_24h: None,
        low_24h: None,
        last_updated: None,
    }
}

/// The fixed market snapshot.
pub fn snapshot() -> Vec<CoinSnapshot> {
    vec![
        coin("bitcoin", "BTC", "Bitcoin", dec!(67250.00), dec!(1.24), dec!(1324000000000)),
        coin("ethereum", "ETH", "Ethereum", dec!(3480.50), dec!(-0.82), dec!(418000000000)),
        coin("solana", "SOL", "Solana", dec!(172.35), dec!(3.10), dec!(79500000000)),
        coin("binancecoin", "BNB", "BNB", dec!(592.10), dec!(0.45), dec!(87300000000)),
        coin("ripple", "XRP", "XRP", dec!(0.52), dec!(-1.15), dec!(28900000000)),
        coin("cardano", "ADA", "Cardano", dec!(0.45), dec!(0.30), dec!(16000000000)),
        coin("dogecoin", "DOGE", "Dogecoin", dec!(0.16), dec!(2.05), dec!(23100000000)),
    ]
}

/// A synthetic price series for `coin_id` over `timeframe`, oldest first.
pub fn history(coin_id: &str, timeframe: Timeframe) -> Vec<PricePoint> {
    let base = snapshot()
        .into_iter()
        .find(|c| c.id == coin_id)
        .map(|c| c.price)
        .unwrap_or(DEFAULT_BASE_PRICE);
    let base_f = base.to_f64().unwrap_or(100.0);

    let count = match timeframe {
        Timeframe::Day => 24,
        Timeframe::Week => 28,
        Timeframe::Month => 30,
        Timeframe::Year => 52,
    };
    let span = Duration::days(i64::from(timeframe.days()));
    let step = span / count;
    let end = Utc::now();

    (0..count)
        .map(|i| {
            let x = f64::from(i);
            let wave = 1.0 + 0.03 * (x * 0.5).sin() + 0.01 * (x * 1.7).cos();
            let value = Decimal::from_f64(base_f * wave)
                .unwrap_or(base)
                .round_dp(2);
            let timestamp = end - step * (count - 1 - i);
            PricePoint {
                label: timestamp.format(timeframe.label_format()).to_string(),
                value,
                timestamp,
            }
        })
        .collect()
}

/// The fixed list of headlines.
pub fn articles() -> Vec<Article> {
    let now = Utc::now();
    let article = |id: &str, title: &str, source: &str, summary: &str, hours: i64, cats: &[&str]| {
        Article {
            id: id.to_string(),
            title: title.to_string(),
            url: "https://www.cryptocompare.com/news/".to_string(),
            source: source.to_string(),
            summary: summary.to_string(),
            image_url: None,
            published_at: now - Duration::hours(hours),
            categories: cats.iter().map(|c| c.to_string()).collect(),
        }
    };

    vec![
        article(
            "fallback-1",
            "Bitcoin holds steady as markets await macro data",
            "coinfeed",
            "Live news is temporarily unavailable. Showing cached headlines.",
            1,
            &["BTC", "Market"],
        ),
        article(
            "fallback-2",
            "Ethereum developers outline next network upgrade",
            "coinfeed",
            "Live news is temporarily unavailable. Showing cached headlines.",
            3,
            &["ETH", "Technology"],
        ),
        article(
            "fallback-3",
            "Stablecoin volumes climb to monthly high",
            "coinfeed",
            "Live news is temporarily unavailable. Showing cached headlines.",
            6,
            &["Market", "Trading"],
        ),
    ]
}
