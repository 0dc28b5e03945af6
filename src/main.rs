//! coinfeed - watch crypto prices through resilient relays
//!
//! Subscribes to the configured watchlist, logs every price and connection
//! status change, and prints the latest headlines on startup.

use coinfeed::config::{LoggingConfig, log_dir};
use coinfeed::{Config, ConnectionStatus, Feeds, Result};
use tokio::time::Instant;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Headlines logged at startup.
const HEADLINES: usize = 5;

fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.filter.as_str().into());

    let (file_layer, guard) = if config.file {
        let dir = log_dir()?;
        std::fs::create_dir_all(&dir)?;
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "coinfeed.log"));
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_or_default()?;

    // Initialize logging; the guard flushes the file log on exit
    let _log_guard = init_logging(&config.logging)?;
    info!("Starting coinfeed {}", env!("CARGO_PKG_VERSION"));

    let feeds = Feeds::from_config(&config)?;

    for article in feeds
        .news
        .fetch_latest_articles()
        .await
        .into_iter()
        .take(HEADLINES)
    {
        info!("[{}] {} ({})", article.source, article.title, article.url);
    }

    let mut prices = StreamMap::new();
    for coin_id in &config.prices.watchlist {
        prices.insert(coin_id.clone(), feeds.prices.subscribe_prices(coin_id.as_str())?);
    }
    let mut status = feeds.prices.subscribe_status();

    loop {
        tokio::select! {
            Some((coin_id, coin)) = prices.next(), if !prices.is_empty() => {
                info!(
                    "{} ({}) {} {} ({}{}%)",
                    coin.symbol,
                    coin_id,
                    coin.price,
                    config.prices.vs_currency.to_uppercase(),
                    if coin.is_up() { "+" } else { "" },
                    coin.change_24h_pct
                );
            }
            Some(state) = status.next() => match state.status {
                ConnectionStatus::Active => info!("Connection active"),
                ConnectionStatus::Disconnected => warn!("Connection lost, retrying on next poll"),
                ConnectionStatus::Suspended => {
                    let secs = state
                        .retry_in(Instant::now())
                        .map(|d| d.as_secs())
                        .unwrap_or_default();
                    warn!("Connection suspended, resuming in {}s", secs);
                }
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutting down");
                break;
            }
        }
    }

    feeds.prices.stop_all()?;
    Ok(())
}
