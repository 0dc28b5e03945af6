//! Market data client.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio_stream::Stream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::scheduler::{Command, PollingScheduler, SchedulerState, markets_path};
use crate::api::{CoinGeckoPolicy, DataConverter, RawMarketChart, RawMarketCoin, ResilientFetcher};
use crate::config::{Config, PriceFeedConfig};
use crate::error::{Error, Result};
use crate::events::{ConnectionState, FetchOutcome, StatusPublisher, StatusStream};
use crate::state::{CoinSnapshot, PricePoint, Timeframe, fallback};

/// Live prices, snapshots and history for a dashboard.
///
/// Owns one fetcher (and so one breaker and one cooldown table), one status
/// publisher and one polling task. Must be created within a Tokio runtime.
pub struct PriceFeed {
    fetcher: Arc<ResilientFetcher>,
    publisher: Arc<StatusPublisher>,
    commands: mpsc::UnboundedSender<Command>,
    scheduler_state: watch::Receiver<SchedulerState>,
    config: PriceFeedConfig,
}

impl PriceFeed {
    /// Create a feed around an existing fetcher.
    pub fn new(fetcher: ResilientFetcher, config: PriceFeedConfig) -> Self {
        let fetcher = Arc::new(fetcher);
        let publisher = Arc::new(StatusPublisher::new());
        let handle = PollingScheduler::spawn(
            fetcher.clone(),
            publisher.clone(),
            config.vs_currency.clone(),
            config.poll_interval(),
        );

        Self {
            fetcher,
            publisher,
            commands: handle.commands,
            scheduler_state: handle.state,
            config,
        }
    }

    /// Create a feed using the CoinGecko policy and the configured relays.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = ResilientFetcher::builder(CoinGeckoPolicy::new(&config.prices.base_url))
            .config(config.fetcher.clone())
            .proxies(config.proxies.clone())
            .build()?;
        Ok(Self::new(fetcher, config.prices.clone()))
    }

    /// Listen for connection status. The current state arrives first.
    pub fn subscribe_status(&self) -> StatusStream {
        self.publisher.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.publisher.current()
    }

    /// Receive live updates for `coin_id`. Dropping the subscription
    /// unsubscribes.
    pub fn subscribe_prices(&self, coin_id: impl Into<String>) -> Result<PriceSubscription> {
        let coin_id = coin_id.into();
        if coin_id.trim().is_empty() {
            return Err(Error::invalid_input("coin id must not be empty"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.commands
            .send(Command::Subscribe {
                coin_id: coin_id.clone(),
                id,
                tx,
            })
            .map_err(|_| Error::channel("price scheduler has stopped"))?;

        Ok(PriceSubscription {
            coin_id,
            id,
            rx,
            commands: self.commands.clone(),
        })
    }

    /// Current snapshot for `ids`, or the fixed fallback set on failure.
    pub async fn fetch_snapshot(&self, ids: &[String]) -> Vec<CoinSnapshot> {
        match self.try_fetch_snapshot(ids).await {
            Ok(coins) => coins,
            Err(e) => {
                warn!("Snapshot unavailable, using fallback: {}", e);
                fallback::snapshot()
            }
        }
    }

    /// Current snapshot for `ids`.
    pub async fn try_fetch_snapshot(&self, ids: &[String]) -> Result<Vec<CoinSnapshot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let path = markets_path(ids, &self.config.vs_currency);
        let raw: Vec<RawMarketCoin> = self.reported(self.fetcher.fetch(&path).await)?;
        Ok(DataConverter::convert_coins(raw))
    }

    /// Price history for `coin_id`, or a synthetic series on failure.
    pub async fn fetch_history(&self, coin_id: &str, timeframe: Timeframe) -> Vec<PricePoint> {
        match self.try_fetch_history(coin_id, timeframe).await {
            Ok(points) => points,
            Err(e) => {
                warn!("History for '{}' unavailable, using fallback: {}", coin_id, e);
                fallback::history(coin_id, timeframe)
            }
        }
    }

    /// Price history for `coin_id`, oldest first.
    pub async fn try_fetch_history(
        &self,
        coin_id: &str,
        timeframe: Timeframe,
    ) -> Result<Vec<PricePoint>> {
        if coin_id.trim().is_empty() {
            return Err(Error::invalid_input("coin id must not be empty"));
        }

        let path = history_path(coin_id, &self.config.vs_currency, timeframe);
        let chart: RawMarketChart = self.reported(self.fetcher.fetch(&path).await)?;
        let points = DataConverter::convert_chart(chart, timeframe);
        debug!("Fetched {} {} points for '{}'", points.len(), timeframe, coin_id);
        Ok(points)
    }

    /// Close the breaker and poll right away.
    pub fn reconnect(&self) -> Result<()> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| Error::channel("price scheduler has stopped"))
    }

    /// Drop every price subscription and stop polling.
    pub fn stop_all(&self) -> Result<()> {
        self.commands
            .send(Command::StopAll)
            .map_err(|_| Error::channel("price scheduler has stopped"))
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        *self.scheduler_state.borrow()
    }

    /// The underlying fetcher, for diagnostics.
    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }

    pub fn config(&self) -> &PriceFeedConfig {
        &self.config
    }

    /// Report the outcome of a one-shot fetch to status listeners.
    fn reported<T>(&self, result: Result<T>) -> Result<T> {
        let outcome = match &result {
            Ok(_) => FetchOutcome::Success,
            Err(_) => FetchOutcome::Failure {
                tripped_until: self.fetcher.tripped_until(),
            },
        };
        self.publisher.report(outcome);
        result
    }
}

fn history_path(coin_id: &str, vs_currency: &str, timeframe: Timeframe) -> String {
    let mut path = format!(
        "/coins/{}/market_chart?vs_currency={}&days={}",
        urlencoding::encode(coin_id),
        urlencoding::encode(vs_currency),
        timeframe.days()
    );
    if let Some(interval) = timeframe.interval() {
        path.push_str("&interval=");
        path.push_str(interval);
    }
    path
}

/// Live updates for one coin.
///
/// The stream ends when the feed stops all subscriptions or is dropped.
#[derive(Debug)]
pub struct PriceSubscription {
    coin_id: String,
    id: Uuid,
    rx: mpsc::UnboundedReceiver<CoinSnapshot>,
    commands: mpsc::UnboundedSender<Command>,
}

impl PriceSubscription {
    pub fn coin_id(&self) -> &str {
        &self.coin_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the next update.
    pub async fn recv(&mut self) -> Option<CoinSnapshot> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<CoinSnapshot> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Stream for PriceSubscription {
    type Item = CoinSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PriceSubscription {
    fn drop(&mut self) {
        // Scheduler already gone if this fails
        let _ = self.commands.send(Command::Unsubscribe {
            coin_id: std::mem::take(&mut self.coin_id),
            id: self.id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedTransport;
    use crate::api::{CircuitState, HttpResponse};
    use crate::config::{FetcherConfig, ProxyConfig};
    use crate::events::ConnectionStatus;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::assert_err;

    const MARKETS: &str = r#"[
        {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 67000.5,
         "price_change_percentage_24h": 1.5}
    ]"#;

    fn feed_with(transport: Arc<ScriptedTransport>, fetcher_config: FetcherConfig) -> PriceFeed {
        let fetcher = ResilientFetcher::builder(CoinGeckoPolicy::new("https://api.test"))
            .config(fetcher_config)
            .proxies(vec![ProxyConfig::new("relay", "https://relay.test/{raw_url}")])
            .transport(transport)
            .build()
            .unwrap();
        PriceFeed::new(fetcher, PriceFeedConfig::default())
    }

    fn feed(transport: Arc<ScriptedTransport>) -> PriceFeed {
        feed_with(
            transport,
            FetcherConfig {
                retries_per_proxy: 1,
                cooldown_secs: 0,
                ..Default::default()
            },
        )
    }

    /// Let the scheduler task drain its queue.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_starts_and_fetches_immediately() {
        let transport = ScriptedTransport::always(MARKETS);
        let feed = feed(transport.clone());
        assert_eq!(feed.scheduler_state(), SchedulerState::Stopped);

        let mut sub = feed.subscribe_prices("bitcoin").unwrap();
        let coin = sub.recv().await.unwrap();

        assert_eq!(coin.price, dec!(67000.5));
        assert_eq!(transport.call_count(), 1);
        assert!(transport.calls()[0].contains("/coins/markets?vs_currency=usd&ids=bitcoin"));
        assert_eq!(feed.scheduler_state(), SchedulerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_interval() {
        let transport = ScriptedTransport::always(MARKETS);
        let feed = feed(transport.clone());

        let mut sub = feed.subscribe_prices("bitcoin").unwrap();
        sub.recv().await.unwrap();
        let start = Instant::now();
        sub.recv().await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribing_last_stops_polling() {
        let transport = ScriptedTransport::always(MARKETS);
        let feed = feed(transport.clone());

        let mut sub = feed.subscribe_prices("bitcoin").unwrap();
        sub.recv().await.unwrap();
        drop(sub);
        settle().await;
        assert_eq!(feed.scheduler_state(), SchedulerState::Stopped);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_subscriber_keeps_receiving() {
        let transport = ScriptedTransport::always(MARKETS);
        let feed = feed(transport.clone());

        let first = feed.subscribe_prices("bitcoin").unwrap();
        let mut second = feed.subscribe_prices("bitcoin").unwrap();
        first.unsubscribe();
        settle().await;

        assert_eq!(feed.scheduler_state(), SchedulerState::Running);
        while second.try_recv().is_some() {}

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(second.recv().await.unwrap().id, "bitcoin");
        assert_eq!(feed.scheduler_state(), SchedulerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_reaches_only_returned_coins() {
        let transport = ScriptedTransport::always(MARKETS);
        let feed = feed(transport.clone());

        let mut eth = feed.subscribe_prices("ethereum").unwrap();
        settle().await;
        let mut btc_a = feed.subscribe_prices("bitcoin").unwrap();
        settle().await;
        let mut btc_b = feed.subscribe_prices("bitcoin").unwrap();
        settle().await;
        let before = transport.call_count();
        while btc_a.try_recv().is_some() {}
        while btc_b.try_recv().is_some() {}

        // One tick, one batched call
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.call_count(), before + 1);
        assert!(transport.calls().last().unwrap().contains("ids=bitcoin,ethereum"));

        let a = btc_a.try_recv().unwrap();
        let b = btc_b.try_recv().unwrap();
        assert_eq!(a.price, dec!(67000.5));
        assert_eq!(b.price, dec!(67000.5));
        assert!(btc_a.try_recv().is_none());
        assert!(btc_b.try_recv().is_none());
        assert!(eth.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_coin_in_response_delivered_once() {
        let transport = ScriptedTransport::always(
            r#"[
                {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 67000.5},
                {"id": "bitcoin", "symbol": "btc", "name": "Bitcoin", "current_price": 67100}
            ]"#,
        );
        let feed = feed(transport);

        let mut sub = feed.subscribe_prices("bitcoin").unwrap();
        assert_eq!(sub.recv().await.unwrap().price, dec!(67100));
        settle().await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_suspends_then_restarts_once() {
        let transport = ScriptedTransport::failing();
        let feed = feed(transport.clone());
        let mut status = feed.subscribe_status();
        assert_eq!(status.recv().await.unwrap().status, ConnectionStatus::Active);

        let _sub = feed.subscribe_prices("bitcoin").unwrap();
        settle().await;
        assert_eq!(status.recv().await.unwrap().status, ConnectionStatus::Disconnected);

        // Failures two and three trip the breaker
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.call_count(), 3);
        let suspended = status.recv().await.unwrap();
        assert_eq!(suspended.status, ConnectionStatus::Suspended);
        let until = suspended.suspended_until.unwrap();
        assert_eq!(feed.scheduler_state(), SchedulerState::Suspended { until });
        assert_eq!(feed.fetcher().circuit_state(), CircuitState::Open);

        // Nothing is attempted while suspended
        tokio::time::sleep_until(until - Duration::from_millis(1)).await;
        assert_eq!(transport.call_count(), 3);

        // One restart at the end of the trip
        tokio::time::sleep_until(until + Duration::from_millis(1)).await;
        assert_eq!(transport.call_count(), 4);
        assert_eq!(feed.scheduler_state(), SchedulerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_while_suspended_waits_for_restart() {
        let transport = ScriptedTransport::failing();
        let feed = feed(transport.clone());

        let _sub = feed.subscribe_prices("bitcoin").unwrap();
        tokio::time::sleep(Duration::from_secs(121)).await;
        let SchedulerState::Suspended { .. } = feed.scheduler_state() else {
            panic!("expected suspended, got {}", feed.scheduler_state());
        };

        let _eth = feed.subscribe_prices("ethereum").unwrap();
        settle().await;
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_breaker_and_polls() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = healthy.clone();
        let transport = ScriptedTransport::new(move |_| {
            if flag.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(HttpResponse::ok(MARKETS))
            } else {
                Err(Error::network("down"))
            }
        });
        let feed = feed(transport.clone());

        let mut sub = feed.subscribe_prices("bitcoin").unwrap();
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(feed.fetcher().circuit_state(), CircuitState::Open);

        healthy.store(true, std::sync::atomic::Ordering::SeqCst);
        feed.reconnect().unwrap();
        assert_eq!(sub.recv().await.unwrap().id, "bitcoin");
        assert_eq!(feed.fetcher().circuit_state(), CircuitState::Closed);
        assert_eq!(feed.scheduler_state(), SchedulerState::Running);
        assert!(feed.connection_state().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_ends_streams() {
        let transport = ScriptedTransport::always(MARKETS);
        let feed = feed(transport.clone());

        let mut sub = feed.subscribe_prices("bitcoin").unwrap();
        sub.recv().await.unwrap();
        feed.stop_all().unwrap();

        assert_eq!(sub.recv().await, None);
        assert_eq!(feed.scheduler_state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_falls_back_when_upstream_down() {
        let transport = ScriptedTransport::failing();
        let feed = feed(transport);

        let coins = feed.fetch_snapshot(&["bitcoin".to_string()]).await;
        assert!(coins.iter().any(|c| c.id == "bitcoin"));
        assert_eq!(feed.connection_state().status, ConnectionStatus::Disconnected);

        assert_err!(feed.try_fetch_snapshot(&["bitcoin".to_string()]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_with_no_ids_skips_network() {
        let transport = ScriptedTransport::failing();
        let feed = feed(transport.clone());

        assert_eq!(feed.try_fetch_snapshot(&[]).await.unwrap(), Vec::new());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_history() {
        let transport = ScriptedTransport::always(
            r#"{"prices": [[1711843200000, 69702.31], [1711846800000, 69800.0]]}"#,
        );
        let feed = feed(transport.clone());

        let points = feed.fetch_history("bitcoin", Timeframe::Year).await;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value, dec!(69702.31));
        assert!(
            transport.calls()[0]
                .ends_with("/coins/bitcoin/market_chart?vs_currency=usd&days=365&interval=daily")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_falls_back() {
        let feed = feed(ScriptedTransport::failing());
        let points = feed.fetch_history("bitcoin", Timeframe::Day).await;
        assert_eq!(points.len(), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_rejects_empty_id() {
        let feed = feed(ScriptedTransport::always(MARKETS));
        assert!(matches!(
            feed.subscribe_prices("  "),
            Err(Error::InvalidInput(_))
        ));
    }
}
