//! Relay-routed fetcher with retry, cooldown and circuit breaking.

use crate::config::{FetcherConfig, ProxyConfig};
use crate::error::{Error, Result, RetryClass};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::policy::{EmbeddedSignal, UpstreamPolicy};
use super::proxy::{ProxyDescriptor, ProxyRegistry};
use super::transport::{HttpTransport, ReqwestTransport};

/// Builder for creating a fetcher.
pub struct ResilientFetcherBuilder {
    policy: Arc<dyn UpstreamPolicy>,
    transport: Option<Arc<dyn HttpTransport>>,
    proxies: Vec<ProxyConfig>,
    config: FetcherConfig,
}

impl ResilientFetcherBuilder {
    /// Create a new builder for `policy` with default config and relays.
    pub fn new(policy: impl UpstreamPolicy + 'static) -> Self {
        Self {
            policy: Arc::new(policy),
            transport: None,
            proxies: ProxyConfig::defaults(),
            config: FetcherConfig::default(),
        }
    }

    /// Set the retry/cooldown/breaker configuration.
    pub fn config(mut self, config: FetcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the relay routes.
    pub fn proxies(mut self, proxies: Vec<ProxyConfig>) -> Self {
        self.proxies = proxies;
        self
    }

    /// Use a specific transport instead of a fresh reqwest client.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the fetcher.
    pub fn build(self) -> Result<ResilientFetcher> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.request_timeout())?),
        };
        let proxies = ProxyRegistry::from_config(&self.proxies)?.with_cooldown(self.config.cooldown());
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig::from(&self.config));

        Ok(ResilientFetcher {
            policy: self.policy,
            transport,
            state: Mutex::new(FetcherState { proxies, breaker }),
            config: self.config,
        })
    }
}

/// State the fetcher alone mutates.
#[derive(Debug)]
struct FetcherState {
    proxies: ProxyRegistry,
    breaker: CircuitBreaker,
}

/// Performs logical fetches through the proxy/retry/breaker stack.
///
/// Proxies are tried strictly one after another, so a fetch never has more
/// than one request in flight.
pub struct ResilientFetcher {
    policy: Arc<dyn UpstreamPolicy>,
    transport: Arc<dyn HttpTransport>,
    state: Mutex<FetcherState>,
    config: FetcherConfig,
}

impl ResilientFetcher {
    /// Start building a fetcher for `policy`.
    pub fn builder(policy: impl UpstreamPolicy + 'static) -> ResilientFetcherBuilder {
        ResilientFetcherBuilder::new(policy)
    }

    /// Name of the upstream, for logs.
    pub fn upstream(&self) -> &str {
        self.policy.name()
    }

    /// Absolute upstream URL for `path`.
    pub fn target_url(&self, path: &str) -> String {
        format!("{}{}", self.policy.base_url(), path)
    }

    /// Fetch `path` and decode it into `T`, with the configured retry budget.
    pub async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.fetch_with_retries(path, self.config.retries_per_proxy)
            .await
    }

    /// Fetch `path` with `retries_per_proxy` attempts on each proxy.
    pub async fn fetch_with_retries<T: DeserializeOwned>(
        &self,
        path: &str,
        retries_per_proxy: u32,
    ) -> Result<T> {
        let target = self.target_url(path);

        let candidates = {
            let state = self.lock_state();
            let now = Instant::now();
            state.breaker.guard(now)?;
            state.proxies.candidates(now)
        };
        let candidates = match candidates {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("{}: {}", self.upstream(), e);
                self.record_failure();
                return Err(e);
            }
        };

        let mut last_error = Error::NoProxiesAvailable;
        for proxy in &candidates {
            match self.try_proxy(proxy, &target, retries_per_proxy).await {
                Ok(value) => {
                    self.record_success(proxy.name());
                    return Ok(value);
                }
                Err(e) => {
                    warn!("{}: proxy '{}' failed: {}", self.upstream(), proxy.name(), e);
                    self.lock_state()
                        .proxies
                        .mark_exhausted(proxy.name(), Instant::now());
                    last_error = e;
                }
            }
        }

        self.record_failure();
        Err(last_error)
    }

    /// Run up to `retries` attempts against a single proxy.
    async fn try_proxy<T: DeserializeOwned>(
        &self,
        proxy: &ProxyDescriptor,
        target: &str,
        retries: u32,
    ) -> Result<T> {
        let url = proxy.build_url(target);
        let attempts = retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(proxy, &url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.retry_class() == RetryClass::SameProxy && attempt < attempts => {
                    let backoff = self.config.backoff_base() * attempt;
                    debug!(
                        "{}: attempt {}/{} via '{}' failed ({}), retrying in {:?}",
                        self.upstream(),
                        attempt,
                        attempts,
                        proxy.name(),
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request through one proxy, validated and decoded.
    async fn attempt<T: DeserializeOwned>(&self, proxy: &ProxyDescriptor, url: &str) -> Result<T> {
        let timeout = self.config.request_timeout();
        let response = tokio::time::timeout(timeout, self.transport.get(url))
            .await
            .map_err(|_| Error::Timeout(timeout.as_secs()))??;

        if !response.is_success() {
            return Err(Error::from_status(proxy.name(), response.status));
        }

        let body: Value = serde_json::from_str(&response.body)
            .map_err(|e| Error::malformed(format!("{} returned non-JSON: {e}", proxy.name())))?;

        // A relay can answer 200 while the upstream behind it did not
        if let Some(status) = self.policy.envelope_status(&body)
            && !(200..300).contains(&status)
        {
            return Err(Error::from_status(proxy.name(), status));
        }

        let payload = self.policy.unwrap_envelope(body)?;

        match self.policy.embedded_signal(&payload) {
            Some(EmbeddedSignal::RateLimited) => {
                return Err(Error::RateLimited {
                    proxy: proxy.name().to_string(),
                });
            }
            Some(EmbeddedSignal::Error(message)) => return Err(Error::Upstream(message)),
            None => {}
        }

        serde_json::from_value(payload).map_err(|e| Error::malformed(e.to_string()))
    }

    fn record_success(&self, proxy: &str) {
        let mut state = self.lock_state();
        state.proxies.mark_success(proxy);
        state.breaker.record_success();
    }

    fn record_failure(&self) {
        let mut state = self.lock_state();
        if state.breaker.record_failure(Instant::now()) {
            warn!(
                "{}: circuit breaker tripped for {}s",
                self.upstream(),
                self.config.trip_secs
            );
        }
    }

    /// Close the breaker immediately (user-initiated reconnect).
    pub fn reset_circuit(&self) {
        info!("{}: circuit breaker reset", self.upstream());
        self.lock_state().breaker.reset();
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock_state().breaker.state(Instant::now())
    }

    /// When the breaker closes again, if it is open now.
    pub fn tripped_until(&self) -> Option<Instant> {
        self.lock_state().breaker.tripped_until(Instant::now())
    }

    pub fn failure_count(&self) -> u32 {
        self.lock_state().breaker.failure_count()
    }

    pub fn cooldown_until(&self, proxy: &str) -> Option<Instant> {
        self.lock_state().proxies.cooldown_until(proxy)
    }

    pub fn last_working_proxy(&self) -> Option<String> {
        self.lock_state().proxies.last_working().map(str::to_string)
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Lock the state mutex, recovering from poison.
    ///
    /// A poisoned lock only means a panic elsewhere; the counters are still
    /// usable.
    fn lock_state(&self) -> MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Fetcher state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::policy::CoinGeckoPolicy;
    use crate::api::testing::{HangingTransport, ScriptedTransport};
    use crate::api::transport::HttpResponse;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    const COINS: &str = r#"[{"id":"bitcoin","price":1}]"#;

    fn two_proxies() -> Vec<ProxyConfig> {
        vec![
            ProxyConfig::new("a", "https://a.example/{raw_url}"),
            ProxyConfig::new("b", "https://b.example/{raw_url}"),
        ]
    }

    fn fetcher(transport: Arc<ScriptedTransport>, config: FetcherConfig) -> ResilientFetcher {
        ResilientFetcher::builder(CoinGeckoPolicy::new("https://api.test"))
            .config(config)
            .proxies(two_proxies())
            .transport(transport)
            .build()
            .unwrap()
    }

    fn single_attempt() -> FetcherConfig {
        FetcherConfig {
            retries_per_proxy: 1,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_decoded_payload() {
        let transport = ScriptedTransport::always(COINS);
        let fetcher = fetcher(transport.clone(), FetcherConfig::default());

        let value: Value = assert_ok!(fetcher.fetch("/coins").await);
        assert_eq!(value[0]["id"], "bitcoin");
        assert_eq!(transport.calls(), vec!["https://a.example/https://api.test/coins"]);
        assert_eq!(fetcher.last_working_proxy().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_proxies_fail_cools_each_down() {
        let transport = ScriptedTransport::failing();
        let fetcher = fetcher(transport.clone(), single_attempt());
        let start = Instant::now();

        let result: Result<Value> = fetcher.fetch("/coins").await;
        assert!(matches!(result, Err(Error::Network(_))));

        assert_eq!(transport.call_count(), 2);
        assert_eq!(fetcher.cooldown_until("a"), Some(start + Duration::from_secs(60)));
        assert_eq!(fetcher.cooldown_until("b"), Some(start + Duration::from_secs(60)));
        assert_eq!(fetcher.failure_count(), 1);
        assert_eq!(fetcher.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_same_proxy_with_backoff() {
        let transport = ScriptedTransport::new(|_| Ok(HttpResponse::new(502, "bad gateway")));
        let fetcher = fetcher(transport.clone(), FetcherConfig::default());
        let start = Instant::now();

        let result: Result<Value> = fetcher.fetch("/coins").await;
        assert!(matches!(result, Err(Error::Status { status: 502, .. })));

        // Two attempts on each proxy, 500ms backoff after each first attempt
        assert_eq!(transport.call_count(), 4);
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_trips_and_rejects_without_network() {
        let transport = ScriptedTransport::failing();
        // Short cooldown so every fetch sees both proxies again
        let config = FetcherConfig {
            cooldown_secs: 0,
            ..single_attempt()
        };
        let fetcher = fetcher(transport.clone(), config);

        for _ in 0..3 {
            let result: Result<Value> = fetcher.fetch("/coins").await;
            assert_err!(result);
        }
        assert_eq!(fetcher.circuit_state(), CircuitState::Open);
        assert_eq!(
            fetcher.tripped_until(),
            Some(Instant::now() + Duration::from_secs(120))
        );
        assert_eq!(fetcher.failure_count(), 0);

        let calls_before = transport.call_count();
        let result: Result<Value> = fetcher.fetch("/coins").await;
        assert!(matches!(
            result,
            Err(Error::CircuitOpen { retry_in_secs: 120 })
        ));
        assert_eq!(transport.call_count(), calls_before);
        // A rejected guard is not a failure
        assert_eq!(fetcher.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_moves_to_next_proxy_immediately() {
        let transport = ScriptedTransport::new(|url| {
            if url.starts_with("https://a.example") {
                Ok(HttpResponse::new(429, "slow down"))
            } else {
                Ok(HttpResponse::ok(COINS))
            }
        });
        let fetcher = fetcher(transport.clone(), FetcherConfig::default());
        let start = Instant::now();

        let value: Value = assert_ok!(fetcher.fetch("/coins").await);
        assert_eq!(value[0]["id"], "bitcoin");

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("https://a.example"));
        assert!(calls[1].starts_with("https://b.example"));
        // No backoff was spent on the rate-limited proxy
        assert_eq!(Instant::now(), start);
        assert_eq!(fetcher.cooldown_until("a"), Some(start + Duration::from_secs(60)));
        assert_eq!(fetcher.last_working_proxy().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedded_rate_limit_is_treated_as_429() {
        let transport = ScriptedTransport::new(|url| {
            if url.starts_with("https://a.example") {
                Ok(HttpResponse::ok(
                    r#"{"status":{"error_code":429,"error_message":"Rate Limit exceeded"}}"#,
                ))
            } else {
                Ok(HttpResponse::ok(COINS))
            }
        });
        let fetcher = fetcher(transport.clone(), FetcherConfig::default());

        let _: Value = assert_ok!(fetcher.fetch("/coins").await);
        assert_eq!(transport.call_count(), 2);
        assert!(fetcher.cooldown_until("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_aborts_proxy() {
        let transport = ScriptedTransport::new(|_| Ok(HttpResponse::new(404, "")));
        let fetcher = fetcher(transport.clone(), FetcherConfig::default());

        let result: Result<Value> = fetcher.fetch("/coins").await;
        assert!(matches!(result, Err(Error::NonRetriable { status: 404, .. })));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_breaker_and_prefers_proxy() {
        let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = healthy.clone();
        let transport = ScriptedTransport::new(move |url| {
            if flag.load(std::sync::atomic::Ordering::SeqCst) && url.starts_with("https://b.example")
            {
                Ok(HttpResponse::ok(COINS))
            } else {
                Err(Error::network("reset by peer"))
            }
        });
        let config = FetcherConfig {
            cooldown_secs: 0,
            ..single_attempt()
        };
        let fetcher = fetcher(transport.clone(), config);

        for _ in 0..2 {
            let result: Result<Value> = fetcher.fetch("/coins").await;
            assert_err!(result);
        }
        assert_eq!(fetcher.failure_count(), 2);

        healthy.store(true, std::sync::atomic::Ordering::SeqCst);
        let _: Value = assert_ok!(fetcher.fetch("/coins").await);
        assert_eq!(fetcher.failure_count(), 0);
        assert_eq!(fetcher.cooldown_until("b"), None);
        assert_eq!(fetcher.last_working_proxy().as_deref(), Some("b"));

        // b now goes first
        let before = transport.call_count();
        let _: Value = assert_ok!(fetcher.fetch("/coins").await);
        assert_eq!(transport.call_count(), before + 1);
        assert!(transport.calls()[before].starts_with("https://b.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_cooling_counts_as_failure() {
        let transport = ScriptedTransport::failing();
        let fetcher = fetcher(transport.clone(), single_attempt());

        let first: Result<Value> = fetcher.fetch("/coins").await;
        assert_err!(first);
        let calls = transport.call_count();

        let second: Result<Value> = fetcher.fetch("/coins").await;
        assert!(matches!(second, Err(Error::NoProxiesAvailable)));
        assert_eq!(transport.call_count(), calls);
        assert_eq!(fetcher.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_counts_as_failure() {
        let transport = ScriptedTransport::always(r#"{"unexpected":"object"}"#);
        let fetcher = fetcher(transport.clone(), single_attempt());

        let result: Result<Vec<Value>> = fetcher.fetch("/coins").await;
        assert!(matches!(result, Err(Error::MalformedResponse(_))));
        assert_eq!(fetcher.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwraps_relay_envelope() {
        let transport = ScriptedTransport::always(
            r#"{"contents":"[{\"id\":\"bitcoin\",\"price\":1}]","status":{"http_code":200}}"#,
        );
        let fetcher = fetcher(transport, FetcherConfig::default());

        let value: Vec<Value> = assert_ok!(fetcher.fetch("/coins").await);
        assert_eq!(value.len(), 1);
        assert_eq!(value[0]["id"], "bitcoin");
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reset_closes_circuit() {
        let transport = ScriptedTransport::failing();
        let config = FetcherConfig {
            failure_threshold: 1,
            ..single_attempt()
        };
        let fetcher = fetcher(transport, config);

        let result: Result<Value> = fetcher.fetch("/coins").await;
        assert_err!(result);
        assert_eq!(fetcher.circuit_state(), CircuitState::Open);

        fetcher.reset_circuit();
        assert_eq!(fetcher.circuit_state(), CircuitState::Closed);
        assert_eq!(fetcher.tripped_until(), None);
    }

    fn single_proxy_fetcher(transport: Arc<dyn HttpTransport>) -> ResilientFetcher {
        ResilientFetcher::builder(CoinGeckoPolicy::new("https://api.test"))
            .proxies(vec![ProxyConfig::new("relay", "https://relay.example/?url={url}")])
            .transport(transport)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_enveloped_not_found_aborts_proxy() {
        let transport = ScriptedTransport::always(
            r#"{"contents":"<html>Not Found</html>","status":{"http_code":404}}"#,
        );
        let fetcher = single_proxy_fetcher(transport.clone());
        let start = Instant::now();

        let result: Result<Value> = fetcher.fetch("/coins").await;
        assert!(matches!(
            result,
            Err(Error::NonRetriable { status: 404, ref proxy }) if proxy == "relay"
        ));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(fetcher.cooldown_until("relay"), Some(start + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enveloped_rate_limit_moves_on() {
        let transport = ScriptedTransport::new(|url| {
            if url.starts_with("https://a.example") {
                Ok(HttpResponse::ok(r#"{"contents":"slow down","status":{"http_code":429}}"#))
            } else {
                Ok(HttpResponse::ok(COINS))
            }
        });
        let fetcher = fetcher(transport.clone(), FetcherConfig::default());

        let value: Value = assert_ok!(fetcher.fetch("/coins").await);
        assert_eq!(value[0]["id"], "bitcoin");
        assert_eq!(transport.call_count(), 2);
        assert_eq!(fetcher.last_working_proxy().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_request_times_out_and_retries_same_proxy() {
        let transport = HangingTransport::new();
        let fetcher = single_proxy_fetcher(transport.clone());
        let start = Instant::now();

        let result: Result<Value> = fetcher.fetch("/coins").await;
        assert!(matches!(result, Err(Error::Timeout(15))));

        // Two 15s attempts with one 500ms backoff between them
        assert_eq!(transport.call_count(), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30_500) && elapsed < Duration::from_millis(30_600));
        assert_eq!(
            fetcher.cooldown_until("relay"),
            Some(Instant::now() + Duration::from_secs(60))
        );
        assert_eq!(fetcher.failure_count(), 1);
    }
}
