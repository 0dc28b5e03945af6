//! Market-related records.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Current price and 24h change for one coin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinSnapshot {
    /// Provider coin id (e.g. "bitcoin").
    pub id: String,
    /// Ticker symbol, upper case.
    pub symbol: String,
    /// Display name.
    pub name: String,
    /// Logo URL.
    pub image_url: Option<String>,
    /// Current price in the quote currency.
    pub price: Decimal,
    /// Price change over the last 24h, in percent.
    pub change_24h_pct: Decimal,
    pub market_cap: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    /// When the provider last refreshed this coin.
    pub last_updated: Option<DateTime<Utc>>,
}

impl CoinSnapshot {
    /// Whether the coin is up over the last 24h.
    pub fn is_up(&self) -> bool {
        self.change_24h_pct.is_sign_positive() && !self.change_24h_pct.is_zero()
    }
}

/// Range of a historical price series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "24h")]
    Day,
    #[default]
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "1y")]
    Year,
}

impl Timeframe {
    /// Number of days requested from the provider.
    pub fn days(&self) -> u32 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
            Self::Month => 30,
            Self::Year => 365,
        }
    }

    /// Explicit sampling interval, if the provider default isn't wanted.
    ///
    /// The provider picks 5-minute samples for one day and hourly samples up
    /// to 90 days, so only long ranges ask for daily points.
    pub fn interval(&self) -> Option<&'static str> {
        match self {
            Self::Day | Self::Week | Self::Month => None,
            Self::Year => Some("daily"),
        }
    }

    /// strftime pattern for point labels.
    pub fn label_format(&self) -> &'static str {
        match self {
            Self::Day => "%H:%M",
            Self::Week | Self::Month => "%b %d",
            Self::Year => "%b %Y",
        }
    }

    /// Maximum number of points handed to a chart.
    pub fn max_points(&self) -> usize {
        match self {
            Self::Day => 48,
            Self::Week => 56,
            Self::Month => 60,
            Self::Year => 73,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "24h"),
            Self::Week => write!(f, "7d"),
            Self::Month => write!(f, "30d"),
            Self::Year => write!(f, "1y"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "24h" | "1d" => Ok(Self::Day),
            "7d" | "1w" => Ok(Self::Week),
            "30d" | "1m" => Ok(Self::Month),
            "1y" | "365d" => Ok(Self::Year),
            other => Err(crate::Error::invalid_input(format!(
                "unknown timeframe '{other}'"
            ))),
        }
    }
}

/// One point of a price chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Human label for the x axis.
    pub label: String,
    pub value: Decimal,
    pub timestamp: DateTime<Utc>,
}
