//! Connection status for coinfeed.
//!
//! Fetch outcomes are folded into a [`ConnectionState`] and pushed to every
//! listener. A new listener gets the current state straight away.

use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::{debug, warn};

/// Health of the upstream as seen by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    /// The last fetch succeeded.
    #[default]
    Active,
    /// The circuit breaker is open; no requests until it closes.
    Suspended,
    /// The last fetch failed but the breaker is still closed.
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Status plus, when suspended, the instant the breaker closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub suspended_until: Option<Instant>,
}

impl ConnectionState {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn suspended(until: Instant) -> Self {
        Self {
            status: ConnectionStatus::Suspended,
            suspended_until: Some(until),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            suspended_until: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }

    /// Time left until a suspension ends, measured from `now`.
    pub fn retry_in(&self, now: Instant) -> Option<Duration> {
        self.suspended_until
            .map(|until| until.saturating_duration_since(now))
    }
}

/// Result of one logical fetch, as far as status is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    /// `tripped_until` is set when the failure left the breaker open.
    Failure { tripped_until: Option<Instant> },
}

impl From<FetchOutcome> for ConnectionState {
    fn from(outcome: FetchOutcome) -> Self {
        match outcome {
            FetchOutcome::Success => Self::active(),
            FetchOutcome::Failure {
                tripped_until: Some(until),
            } => Self::suspended(until),
            FetchOutcome::Failure { tripped_until: None } => Self::disconnected(),
        }
    }
}

struct PublisherInner {
    current: ConnectionState,
    listeners: Vec<mpsc::UnboundedSender<ConnectionState>>,
}

/// Derives the connection state and notifies listeners.
///
/// A report that leaves the state unchanged is not re-sent, except for
/// `Suspended`, which listeners see on every failed attempt.
pub struct StatusPublisher {
    inner: Mutex<PublisherInner>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PublisherInner {
                current: ConnectionState::default(),
                listeners: Vec::new(),
            }),
        }
    }

    /// The latest derived state.
    pub fn current(&self) -> ConnectionState {
        self.lock().current
    }

    /// Register a listener. The current state is delivered immediately.
    pub fn subscribe(&self) -> StatusStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // Receiver is alive, so this cannot fail
        let _ = tx.send(inner.current);
        inner.listeners.push(tx);
        StatusStream { rx }
    }

    /// Fold `outcome` into the state and notify listeners if needed.
    pub fn report(&self, outcome: FetchOutcome) -> ConnectionState {
        let state = ConnectionState::from(outcome);
        let mut inner = self.lock();

        let changed = inner.current != state;
        inner.current = state;

        if changed || state.status == ConnectionStatus::Suspended {
            debug!("Connection status: {}", state.status);
            inner.listeners.retain(|tx| tx.send(state).is_ok());
        }

        state
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        let mut inner = self.lock();
        inner.listeners.retain(|tx| !tx.is_closed());
        inner.listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, PublisherInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Status publisher mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a status subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct StatusStream {
    rx: mpsc::UnboundedReceiver<ConnectionState>,
}

impl StatusStream {
    /// Wait for the next state. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<ConnectionState> {
        self.rx.recv().await
    }

    /// Next queued state, if any.
    pub fn try_recv(&mut self) -> Option<ConnectionState> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Stream for StatusStream {
    type Item = ConnectionState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
