//! Polling loop for subscribed coins.
//!
//! The scheduler is a single task that owns the subscription registry. Every
//! change arrives as a [`Command`], and the task alone decides when to poll,
//! so polls never overlap and each outcome is applied before the next one
//! starts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::subscriptions::{SubscriberId, SubscriptionRegistry};
use crate::api::{DataConverter, RawMarketCoin, ResilientFetcher};
use crate::events::{FetchOutcome, StatusPublisher};
use crate::state::CoinSnapshot;

/// Lifecycle of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    /// No subscriptions, no timer.
    #[default]
    Stopped,
    /// Polling every interval.
    Running,
    /// The breaker is open; polling restarts once at `until`.
    Suspended { until: Instant },
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Suspended { until } => {
                let left = until.saturating_duration_since(Instant::now());
                write!(f, "suspended ({}s left)", left.as_secs())
            }
        }
    }
}

/// Messages handled by the scheduler task.
#[derive(Debug)]
pub enum Command {
    Subscribe {
        coin_id: String,
        id: SubscriberId,
        tx: mpsc::UnboundedSender<CoinSnapshot>,
    },
    Unsubscribe {
        coin_id: String,
        id: SubscriberId,
    },
    /// Close the breaker and poll now.
    Reconnect,
    /// Drop every subscription and stop.
    StopAll,
}

/// Path of the batched markets call for `ids`.
pub fn markets_path(ids: &[String], vs_currency: &str) -> String {
    let ids: Vec<String> = ids
        .iter()
        .map(|id| urlencoding::encode(id).into_owned())
        .collect();
    format!(
        "/coins/markets?vs_currency={}&ids={}",
        urlencoding::encode(vs_currency),
        ids.join(",")
    )
}

/// Handles for talking to a running scheduler task.
pub struct SchedulerHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub state: watch::Receiver<SchedulerState>,
}

pub struct PollingScheduler {
    fetcher: Arc<ResilientFetcher>,
    publisher: Arc<StatusPublisher>,
    registry: SubscriptionRegistry,
    vs_currency: String,
    interval: Duration,
    state: SchedulerState,
    state_tx: watch::Sender<SchedulerState>,
    next_tick: Option<Instant>,
}

impl PollingScheduler {
    /// Spawn the scheduler task. Must be called within a Tokio runtime.
    ///
    /// The task ends once every command sender is dropped.
    pub fn spawn(
        fetcher: Arc<ResilientFetcher>,
        publisher: Arc<StatusPublisher>,
        vs_currency: impl Into<String>,
        interval: Duration,
    ) -> SchedulerHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SchedulerState::Stopped);

        let scheduler = Self {
            fetcher,
            publisher,
            registry: SubscriptionRegistry::new(),
            vs_currency: vs_currency.into(),
            interval,
            state: SchedulerState::Stopped,
            state_tx,
            next_tick: None,
        };
        tokio::spawn(scheduler.run(command_rx));

        SchedulerHandle { commands, state }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                () = sleep_until(self.next_tick) => self.tick().await,
            }
        }
        debug!("{}: scheduler task finished", self.fetcher.upstream());
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { coin_id, id, tx } => {
                debug!("Subscribe {} to '{}'", id, coin_id);
                self.registry.insert(coin_id, id, tx);
                match self.state {
                    SchedulerState::Stopped => {
                        self.start();
                        self.poll().await;
                    }
                    SchedulerState::Running => self.poll().await,
                    // Picked up by the scheduled restart
                    SchedulerState::Suspended { .. } => {}
                }
            }
            Command::Unsubscribe { coin_id, id } => {
                debug!("Unsubscribe {} from '{}'", id, coin_id);
                self.registry.remove(&coin_id, id);
                if self.registry.is_empty() {
                    self.stop();
                }
            }
            Command::Reconnect => {
                info!("{}: manual reconnect", self.fetcher.upstream());
                self.fetcher.reset_circuit();
                if self.registry.is_empty() {
                    self.stop();
                } else {
                    self.start();
                    self.poll().await;
                }
            }
            Command::StopAll => {
                self.registry.clear();
                self.stop();
            }
        }
    }

    async fn tick(&mut self) {
        if self.registry.is_empty() {
            self.stop();
            return;
        }

        if let SchedulerState::Suspended { .. } = self.state {
            info!("{}: resuming polling", self.fetcher.upstream());
        }
        self.start();
        self.poll().await;
    }

    /// One batched fetch for every subscribed coin.
    async fn poll(&mut self) {
        let ids = self.registry.keys();
        if ids.is_empty() {
            return;
        }

        let path = markets_path(&ids, &self.vs_currency);
        match self.fetcher.fetch::<Vec<RawMarketCoin>>(&path).await {
            Ok(raw) => {
                // Last entry wins if a coin is listed twice
                let coins: BTreeMap<String, CoinSnapshot> = DataConverter::convert_coins(raw)
                    .into_iter()
                    .map(|coin| (coin.id.clone(), coin))
                    .collect();
                debug!("Polled {} of {} coins", coins.len(), ids.len());
                for coin in coins.values() {
                    self.registry.fan_out(coin);
                }
                self.publisher.report(FetchOutcome::Success);
            }
            Err(e) => {
                warn!("{}: poll failed: {}", self.fetcher.upstream(), e);
                let tripped_until = self.fetcher.tripped_until();
                self.publisher
                    .report(FetchOutcome::Failure { tripped_until });

                if let Some(until) = tripped_until {
                    self.suspend(until);
                }
            }
        }
    }

    /// Enter `Running` with the next tick one interval from now.
    fn start(&mut self) {
        self.next_tick = Some(Instant::now() + self.interval);
        self.set_state(SchedulerState::Running);
    }

    fn suspend(&mut self, until: Instant) {
        self.next_tick = Some(until);
        self.set_state(SchedulerState::Suspended { until });
    }

    fn stop(&mut self) {
        self.next_tick = None;
        self.set_state(SchedulerState::Stopped);
    }

    fn set_state(&mut self, state: SchedulerState) {
        if self.state != state {
            info!("{}: scheduler {}", self.fetcher.upstream(), state);
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
