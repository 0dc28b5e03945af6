//! Wire formats and their conversion to domain records.

use crate::state::{Article, CoinSnapshot, PricePoint, Timeframe};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Characters of article body kept as the summary.
const SUMMARY_CHARS: usize = 280;

// ============================================================================
// Wire formats
// ============================================================================

/// One entry of a `/coins/markets` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMarketCoin {
    pub id: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub price_change_percentage_24h: Option<Decimal>,
    #[serde(default)]
    pub market_cap: Option<Decimal>,
    #[serde(default)]
    pub total_volume: Option<Decimal>,
    #[serde(default)]
    pub high_24h: Option<Decimal>,
    #[serde(default)]
    pub low_24h: Option<Decimal>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// A `/coins/{id}/market_chart` response. Samples are `[unix_ms, price]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMarketChart {
    pub prices: Vec<(f64, f64)>,
}

/// A `/news/` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RawNewsResponse {
    #[serde(rename = "Data")]
    pub data: Vec<RawArticle>,
}

/// One news item.
#[derive(Debug, Clone, Deserialize)]
pub struct RawArticle {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub imageurl: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub source_info: Option<RawSourceInfo>,
    pub published_on: i64,
    /// Pipe-separated, e.g. `"BTC|Market"`.
    #[serde(default)]
    pub categories: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSourceInfo {
    pub name: String,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

// ============================================================================
// Conversion
// ============================================================================

/// Converts API responses to domain records.
pub struct DataConverter;

impl DataConverter {
    /// Convert a markets entry. Coins the provider has no price for are dropped.
    pub fn convert_coin(coin: RawMarketCoin) -> Option<CoinSnapshot> {
        let price = coin.current_price?;

        Some(CoinSnapshot {
            id: coin.id,
            symbol: coin.symbol.to_uppercase(),
            name: coin.name,
            image_url: coin.image.filter(|url| !url.is_empty()),
            price,
            change_24h_pct: coin
                .price_change_percentage_24h
                .unwrap_or(Decimal::ZERO)
                .round_dp(2),
            market_cap: coin.market_cap,
            volume_24h: coin.total_volume,
            high_24h: coin.high_24h,
            low_24h: coin.low_24h,
            last_updated: coin.last_updated,
        })
    }

    /// Convert a markets response.
    pub fn convert_coins(coins: Vec<RawMarketCoin>) -> Vec<CoinSnapshot> {
        coins.into_iter().filter_map(Self::convert_coin).collect()
    }

    /// Convert a market chart to labelled points, oldest first, thinned to
    /// the timeframe's point budget.
    pub fn convert_chart(chart: RawMarketChart, timeframe: Timeframe) -> Vec<PricePoint> {
        let mut points: Vec<PricePoint> = chart
            .prices
            .into_iter()
            .filter_map(|(ts, price)| {
                let timestamp = DateTime::from_timestamp_millis(ts as i64)?;
                let value = Decimal::from_f64(price)?.round_dp(8).normalize();
                Some(PricePoint {
                    label: timestamp.format(timeframe.label_format()).to_string(),
                    value,
                    timestamp,
                })
            })
            .collect();

        points.sort_by_key(|p| p.timestamp);
        Self::downsample(points, timeframe.max_points())
    }

    /// Convert a news response.
    pub fn convert_articles(response: RawNewsResponse) -> Vec<Article> {
        response
            .data
            .into_iter()
            .map(Self::convert_article)
            .collect()
    }

    pub fn convert_article(article: RawArticle) -> Article {
        let source = article
            .source_info
            .map(|info| info.name)
            .filter(|name| !name.is_empty())
            .unwrap_or(article.source);

        Article {
            id: article.id,
            title: article.title.trim().to_string(),
            url: article.url,
            source,
            summary: Self::summarize(&article.body),
            image_url: article.imageurl.filter(|url| !url.is_empty()),
            published_at: DateTime::from_timestamp(article.published_on, 0)
                .unwrap_or_else(Utc::now),
            categories: article
                .categories
                .split('|')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    fn summarize(body: &str) -> String {
        let body = body.trim();
        match body.char_indices().nth(SUMMARY_CHARS) {
            Some((cut, _)) => format!("{}…", body[..cut].trim_end()),
            None => body.to_string(),
        }
    }

    /// Keep at most `max` evenly spaced points, always including both ends.
    fn downsample(points: Vec<PricePoint>, max: usize) -> Vec<PricePoint> {
        if max < 2 || points.len() <= max {
            return points;
        }

        let last = points.len() - 1;
        let step = last as f64 / (max - 1) as f64;
        (0..max)
            .map(|i| {
                let index = ((i as f64 * step).round() as usize).min(last);
                points[index].clone()
            })
            .collect()
    }
}
