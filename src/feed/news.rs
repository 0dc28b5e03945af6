//! News client.

use tracing::{debug, warn};

use crate::api::{CryptoComparePolicy, DataConverter, RawNewsResponse, ResilientFetcher};
use crate::config::{Config, NewsFeedConfig};
use crate::error::Result;
use crate::state::{Article, fallback};

/// Latest crypto headlines, fetched on demand.
pub struct NewsFeed {
    fetcher: ResilientFetcher,
    config: NewsFeedConfig,
}

impl NewsFeed {
    pub fn new(fetcher: ResilientFetcher, config: NewsFeedConfig) -> Self {
        Self { fetcher, config }
    }

    /// Create a feed using the CryptoCompare policy and the configured relays.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = ResilientFetcher::builder(CryptoComparePolicy::new(&config.news.base_url))
            .config(config.fetcher.clone())
            .proxies(config.proxies.clone())
            .build()?;
        Ok(Self::new(fetcher, config.news.clone()))
    }

    /// Newest articles first, or the fixed headlines on failure.
    pub async fn fetch_latest_articles(&self) -> Vec<Article> {
        match self.try_fetch_latest_articles().await {
            Ok(articles) => articles,
            Err(e) => {
                warn!("News unavailable, using fallback: {}", e);
                fallback::articles()
            }
        }
    }

    pub async fn try_fetch_latest_articles(&self) -> Result<Vec<Article>> {
        let path = format!("/news/?lang={}", urlencoding::encode(&self.config.language));
        let response: RawNewsResponse = self.fetcher.fetch(&path).await?;

        let mut articles = DataConverter::convert_articles(response);
        articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        articles.truncate(self.config.limit);

        debug!("Fetched {} articles", articles.len());
        Ok(articles)
    }

    /// The underlying fetcher, for diagnostics.
    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }
}
