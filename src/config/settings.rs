//! Configuration settings for coinfeed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `COINFEED__FETCHER__TRIP_SECS=300`.
const ENV_PREFIX: &str = "COINFEED";

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retry, cooldown and circuit breaker tuning shared by both feeds.
    pub fetcher: FetcherConfig,
    /// Market data feed.
    pub prices: PriceFeedConfig,
    /// News feed.
    pub news: NewsFeedConfig,
    /// Relay routes, tried in this order.
    pub proxies: Vec<ProxyConfig>,
    /// Logging.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetcher: FetcherConfig::default(),
            prices: PriceFeedConfig::default(),
            news: NewsFeedConfig::default(),
            proxies: ProxyConfig::defaults(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, returning default if file doesn't exist.
    pub fn load_or_default() -> crate::Result<Self> {
        Self::load(None)
    }

    /// Load configuration from file, layered with environment overrides.
    pub fn load(path: Option<PathBuf>) -> crate::Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`Config::load`], reading overrides from `env` instead of the
    /// process environment when given.
    fn load_with_env(
        path: Option<PathBuf>,
        env: Option<::config::Map<String, String>>,
    ) -> crate::Result<Self> {
        let config_path = path.unwrap_or_else(default_config_path);

        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(config_path).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self, path: Option<PathBuf>) -> crate::Result<()> {
        let config_path = path.unwrap_or_else(default_config_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::config(e.to_string()))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Check the invariants the feeds rely on.
    pub fn validate(&self) -> crate::Result<()> {
        self.fetcher.validate()?;

        if self.proxies.is_empty() {
            return Err(crate::Error::config("at least one proxy is required"));
        }

        let mut seen = HashSet::new();
        for proxy in &self.proxies {
            if !seen.insert(proxy.name.as_str()) {
                return Err(crate::Error::config(format!(
                    "duplicate proxy name '{}'",
                    proxy.name
                )));
            }
            if !proxy.url_template.contains("{url}") && !proxy.url_template.contains("{raw_url}")
            {
                return Err(crate::Error::config(format!(
                    "proxy '{}' template has no {{url}} or {{raw_url}} placeholder",
                    proxy.name
                )));
            }
        }

        if self.prices.poll_interval_secs == 0 {
            return Err(crate::Error::config("prices.poll_interval_secs must be > 0"));
        }

        Ok(())
    }
}

fn default_config_path() -> PathBuf {
    super::config_dir()
        .map(|p| p.join("config.toml"))
        .unwrap_or_else(|_| PathBuf::from("config.toml"))
}

/// Retry, cooldown and circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Attempts per proxy before moving on.
    pub retries_per_proxy: u32,
    /// Backoff base; attempt `n` waits `n * backoff_base_ms`.
    pub backoff_base_ms: u64,
    /// How long an exhausted proxy is excluded.
    pub cooldown_secs: u64,
    /// Consecutive failed fetches before the breaker trips.
    pub failure_threshold: u32,
    /// How long a tripped breaker rejects calls.
    pub trip_secs: u64,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
}

impl FetcherConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn trip_duration(&self) -> Duration {
        Duration::from_secs(self.trip_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.retries_per_proxy == 0 {
            return Err(crate::Error::config("fetcher.retries_per_proxy must be > 0"));
        }
        if self.failure_threshold == 0 {
            return Err(crate::Error::config("fetcher.failure_threshold must be > 0"));
        }
        if self.request_timeout_secs == 0 {
            return Err(crate::Error::config(
                "fetcher.request_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            retries_per_proxy: 2,
            backoff_base_ms: 500,
            cooldown_secs: 60,
            failure_threshold: 3,
            trip_secs: 120,
            request_timeout_secs: 15,
        }
    }
}

/// Market data feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceFeedConfig {
    /// CoinGecko-compatible API base URL.
    pub base_url: String,
    /// Quote currency.
    pub vs_currency: String,
    /// Polling period for live subscriptions.
    pub poll_interval_secs: u64,
    /// Coins the watcher binary subscribes to.
    pub watchlist: Vec<String>,
}

impl PriceFeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            vs_currency: "usd".to_string(),
            poll_interval_secs: 60,
            watchlist: vec![
                "bitcoin".to_string(),
                "ethereum".to_string(),
                "solana".to_string(),
            ],
        }
    }
}

/// News feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsFeedConfig {
    /// CryptoCompare-compatible API base URL.
    pub base_url: String,
    /// Article language.
    pub language: String,
    /// Maximum number of articles returned.
    pub limit: usize,
}

impl Default for NewsFeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://min-api.cryptocompare.com/data/v2".to_string(),
            language: "EN".to_string(),
            limit: 20,
        }
    }
}

/// A relay route.
///
/// `url_template` must contain `{url}` (replaced by the percent-encoded
/// target) or `{raw_url}` (replaced verbatim).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub url_template: String,
}

impl ProxyConfig {
    pub fn new(name: impl Into<String>, url_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url_template: url_template.into(),
        }
    }

    /// The public relays the dashboard ships with.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("corsproxy", "https://corsproxy.io/?url={url}"),
            Self::new("allorigins", "https://api.allorigins.win/get?url={url}"),
            Self::new("codetabs", "https://api.codetabs.com/v1/proxy?quest={url}"),
            Self::new("thingproxy", "https://thingproxy.freeboard.io/fetch/{raw_url}"),
        ]
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub filter: String,
    /// Also write a daily rolling log file.
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "coinfeed=info".to_string(),
            file: false,
        }
    }
}
