//! Per-upstream response policies.
//!
//! A [`ResilientFetcher`](super::ResilientFetcher) is generic over the
//! upstream it talks to. Each upstream supplies three things: a base URL,
//! a way to strip relay envelopes off the body, and a detector for errors
//! the provider reports inside an HTTP 200.

use serde_json::Value;
use std::fmt::Debug;

use crate::error::{Error, Result};

/// An error the provider embedded in an otherwise successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddedSignal {
    /// Treated exactly like HTTP 429.
    RateLimited,
    /// Any other provider-reported error.
    Error(String),
}

/// Upstream-specific behavior plugged into the fetcher.
pub trait UpstreamPolicy: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Base URL that request paths are appended to.
    fn base_url(&self) -> &str;

    /// Strip relay envelopes off a parsed body.
    fn unwrap_envelope(&self, body: Value) -> Result<Value> {
        unwrap_contents_envelope(body)
    }

    /// HTTP status a relay reports for the upstream inside its envelope.
    fn envelope_status(&self, body: &Value) -> Option<u16> {
        contents_envelope_status(body)
    }

    /// Detect an error reported inside the payload.
    fn embedded_signal(&self, payload: &Value) -> Option<EmbeddedSignal>;
}

/// Unwrap the `{"contents": ...}` envelope generic relays put around the
/// real payload. `contents` may be a JSON document encoded as a string.
pub fn unwrap_contents_envelope(body: Value) -> Result<Value> {
    match body {
        Value::Object(mut map) if map.contains_key("contents") => {
            match map.remove("contents").unwrap_or(Value::Null) {
                Value::String(raw) => serde_json::from_str(&raw)
                    .map_err(|e| Error::malformed(format!("envelope contents: {e}"))),
                inner => Ok(inner),
            }
        }
        other => Ok(other),
    }
}

/// Upstream status from a `{"contents": ..., "status": {"http_code": N}}`
/// envelope, if the body is one and carries it.
pub fn contents_envelope_status(body: &Value) -> Option<u16> {
    if body.get("contents").is_none() {
        return None;
    }
    body.pointer("/status/http_code")
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
}

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("throttl")
}

/// CoinGecko market data API.
#[derive(Debug, Clone)]
pub struct CoinGeckoPolicy {
    base_url: String,
}

impl CoinGeckoPolicy {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl UpstreamPolicy for CoinGeckoPolicy {
    fn name(&self) -> &str {
        "coingecko"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn embedded_signal(&self, payload: &Value) -> Option<EmbeddedSignal> {
        // {"status": {"error_code": 429, "error_message": "..."}}
        if let Some(status) = payload.get("status")
            && let Some(code) = status.get("error_code").and_then(Value::as_u64)
        {
            let message = status
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return if code == 429 || mentions_rate_limit(message) {
                Some(EmbeddedSignal::RateLimited)
            } else {
                Some(EmbeddedSignal::Error(format!("{code}: {message}")))
            };
        }

        // {"error": "..."}
        let message = payload.get("error").and_then(Value::as_str)?;
        if mentions_rate_limit(message) {
            Some(EmbeddedSignal::RateLimited)
        } else {
            Some(EmbeddedSignal::Error(message.to_string()))
        }
    }
}

/// CryptoCompare news API.
#[derive(Debug, Clone)]
pub struct CryptoComparePolicy {
    base_url: String,
}

impl CryptoComparePolicy {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl UpstreamPolicy for CryptoComparePolicy {
    fn name(&self) -> &str {
        "cryptocompare"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn embedded_signal(&self, payload: &Value) -> Option<EmbeddedSignal> {
        // {"Response": "Error", "Message": "..."}
        if payload.get("Response").and_then(Value::as_str) != Some("Error") {
            return None;
        }
        let message = payload
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        if mentions_rate_limit(message) {
            Some(EmbeddedSignal::RateLimited)
        } else {
            Some(EmbeddedSignal::Error(message.to_string()))
        }
    }
}
