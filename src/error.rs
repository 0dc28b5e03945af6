//! Error types for coinfeed.

use thiserror::Error;

/// HTTP statuses that abort the current proxy without further retries.
pub const NON_RETRIABLE_STATUSES: [u16; 4] = [401, 403, 404, 429];

/// The main error type for coinfeed.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors (config files, log directory, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel communication errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Invalid input or state
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The circuit breaker rejected the call before any request was made.
    #[error("Circuit open, retry in {retry_in_secs}s")]
    CircuitOpen { retry_in_secs: u64 },

    /// Every proxy is cooling down.
    #[error("No proxies available")]
    NoProxiesAvailable,

    /// Upstream refused the request in a way retrying the same route won't fix.
    #[error("Upstream rejected request via {proxy}: HTTP {status}")]
    NonRetriable { proxy: String, status: u16 },

    /// Rate limited, either by HTTP 429 or by a signal embedded in the payload.
    #[error("Rate limited via {proxy}")]
    RateLimited { proxy: String },

    /// Any other non-success HTTP status.
    #[error("HTTP {status} via {proxy}")]
    Status { proxy: String, status: u16 },

    /// Network connectivity errors
    #[error("Network error: {0}")]
    Network(String),

    /// The request exceeded the configured timeout.
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// The provider reported an error inside a successful response.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The payload did not have the expected shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Alias for Result with our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How the fetcher reacts to an error raised by a single attempt.
///
/// | Class | Same proxy again? | Next proxy? |
/// |-------|-------------------|-------------|
/// | `SameProxy` | Yes, after backoff | Once attempts run out |
/// | `NextProxy` | No | Yes |
/// | `Terminal` | No | No |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Transient failure on this route: retry it.
    SameProxy,
    /// This route is refusing us: abandon it for this fetch.
    NextProxy,
    /// Nothing below the fetch boundary can fix this.
    Terminal,
}

impl Error {
    /// Create a new config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new channel error.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a new invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new malformed response error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    /// Classify a non-success HTTP status returned through `proxy`.
    pub fn from_status(proxy: &str, status: u16) -> Self {
        match status {
            429 => Self::RateLimited {
                proxy: proxy.to_string(),
            },
            s if NON_RETRIABLE_STATUSES.contains(&s) => Self::NonRetriable {
                proxy: proxy.to_string(),
                status: s,
            },
            s => Self::Status {
                proxy: proxy.to_string(),
                status: s,
            },
        }
    }

    /// Returns the retry classification for this error.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::NonRetriable { .. } | Self::RateLimited { .. } => RetryClass::NextProxy,
            Self::Status { .. }
            | Self::Network(_)
            | Self::Timeout(_)
            | Self::Upstream(_)
            | Self::MalformedResponse(_)
            | Self::Serialization(_) => RetryClass::SameProxy,
            _ => RetryClass::Terminal,
        }
    }

    /// Check if this error is recoverable (user can retry).
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Config(_) | Self::InvalidInput(_) | Self::Io(_)
        )
    }
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
