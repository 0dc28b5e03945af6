//! Upstream access through interchangeable HTTP relays.
//!
//! This module provides the relay-routed fetcher, the circuit breaker and
//! cooldown bookkeeping it relies on, and conversion of provider payloads to
//! domain records.

mod circuit_breaker;
mod client;
mod converter;
mod policy;
mod proxy;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ResilientFetcher, ResilientFetcherBuilder};
pub use converter::{
    DataConverter, RawArticle, RawMarketChart, RawMarketCoin, RawNewsResponse, RawSourceInfo,
};
pub use policy::{
    CoinGeckoPolicy, CryptoComparePolicy, EmbeddedSignal, UpstreamPolicy, contents_envelope_status,
    unwrap_contents_envelope,
};
pub use proxy::{ProxyDescriptor, ProxyRegistry};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};
