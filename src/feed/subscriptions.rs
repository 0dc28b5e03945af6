//! Per-coin subscriber bookkeeping.

use std::collections::BTreeMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::CoinSnapshot;

/// Identifies one subscriber.
pub type SubscriberId = Uuid;

type Subscriber = (SubscriberId, mpsc::UnboundedSender<CoinSnapshot>);

/// Coin id to subscribers, in subscription order.
///
/// A coin id is present only while at least one subscriber holds it.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    coins: BTreeMap<String, Vec<Subscriber>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        coin_id: impl Into<String>,
        id: SubscriberId,
        tx: mpsc::UnboundedSender<CoinSnapshot>,
    ) {
        self.coins.entry(coin_id.into()).or_default().push((id, tx));
    }

    /// Remove one subscriber. Returns whether it was registered.
    pub fn remove(&mut self, coin_id: &str, id: SubscriberId) -> bool {
        let Some(subscribers) = self.coins.get_mut(coin_id) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            self.coins.remove(coin_id);
        }
        removed
    }

    /// Subscribed coin ids, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.coins.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn subscriber_count(&self, coin_id: &str) -> usize {
        self.coins.get(coin_id).map(Vec::len).unwrap_or(0)
    }

    /// Deliver `coin` to everyone subscribed to it.
    ///
    /// Subscribers whose receiving end is gone are pruned. Returns how many
    /// deliveries succeeded.
    pub fn fan_out(&mut self, coin: &CoinSnapshot) -> usize {
        let Some(subscribers) = self.coins.get_mut(&coin.id) else {
            return 0;
        };

        subscribers.retain(|(_, tx)| tx.send(coin.clone()).is_ok());
        let delivered = subscribers.len();

        if subscribers.is_empty() {
            self.coins.remove(&coin.id);
        }
        delivered
    }

    /// Drop every subscription, which ends every subscriber's stream.
    pub fn clear(&mut self) {
        self.coins.clear();
    }
}
