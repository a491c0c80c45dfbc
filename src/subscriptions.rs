//! Subscription tracking and push-event routing.
//!
//! The registry lives inside the supervisor task; callers receive events
//! through per-subscription unbounded channels, never by touching the
//! registry directly. At most one live subscription exists per topic.
//!
//! Market-data events arrive with the instrument either as an object
//! field (`Level1UpdateEvent`) or buried in positional row arrays
//! (`Level2UpdateEvent`, ticker, trades); routing knows both shapes but
//! never interprets the rest of the payload.
use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::NdaxError;

/// Identity of one subscription stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKey {
    Level1 { instrument_id: i64 },
    Level2 { instrument_id: i64 },
    Ticker { instrument_id: i64 },
    Trades { instrument_id: i64 },
    AccountEvents { account_id: i64 },
}

impl TopicKey {
    pub(crate) fn subscribe_method(&self) -> &'static str {
        match self {
            TopicKey::Level1 { .. } => "SubscribeLevel1",
            TopicKey::Level2 { .. } => "SubscribeLevel2",
            TopicKey::Ticker { .. } => "SubscribeTicker",
            TopicKey::Trades { .. } => "SubscribeTrades",
            TopicKey::AccountEvents { .. } => "SubscribeAccountEvents",
        }
    }

    /// The wire unsubscribe, where the gateway has one. Account-event
    /// subscriptions only end with the session.
    pub(crate) fn unsubscribe_method(&self) -> Option<&'static str> {
        match self {
            TopicKey::Level1 { .. } => Some("UnsubscribeLevel1"),
            TopicKey::Level2 { .. } => Some("UnsubscribeLevel2"),
            TopicKey::Ticker { .. } => Some("UnsubscribeTicker"),
            TopicKey::Trades { .. } => Some("UnsubscribeTrades"),
            TopicKey::AccountEvents { .. } => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            TopicKey::Level1 { instrument_id } => format!("Level1/{instrument_id}"),
            TopicKey::Level2 { instrument_id } => format!("Level2/{instrument_id}"),
            TopicKey::Ticker { instrument_id } => format!("Ticker/{instrument_id}"),
            TopicKey::Trades { instrument_id } => format!("Trades/{instrument_id}"),
            TopicKey::AccountEvents { account_id } => format!("AccountEvents/{account_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe sent, no ack or push seen yet.
    Pending,
    /// Confirmed by an ack or a first matching push.
    Active,
    /// Unsubscribed locally; no further dispatch, awaiting server
    /// confirmation before removal.
    Cancelled,
}

#[derive(Debug)]
struct SubscriptionEntry {
    state: SubscriptionState,
    /// The original subscribe payload, kept for replay after reconnect.
    payload: Value,
    events: mpsc::UnboundedSender<Value>,
}

/// Outcome of routing one push event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Delivered,
    /// No live subscription matched; the caller surfaces this through
    /// the unhandled-event diagnostic channel.
    NoSubscriber,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<TopicKey, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription in `Pending` state. A key that is
    /// already Pending or Active is a caller error; a Cancelled leftover
    /// is replaced.
    pub fn insert(
        &mut self,
        key: TopicKey,
        payload: Value,
        events: mpsc::UnboundedSender<Value>,
    ) -> Result<(), NdaxError> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.state != SubscriptionState::Cancelled {
                return Err(NdaxError::DuplicateSubscription(key.describe()));
            }
        }
        self.entries.insert(
            key,
            SubscriptionEntry {
                state: SubscriptionState::Pending,
                payload,
                events,
            },
        );
        Ok(())
    }

    pub fn mark_active(&mut self, key: &TopicKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.state == SubscriptionState::Pending {
                debug!("subscriptions.active topic={}", key.describe());
                entry.state = SubscriptionState::Active;
            }
        }
    }

    /// Optimistic unsubscribe: dispatch stops immediately, the entry
    /// stays as a Cancelled tombstone until the server confirms (or the
    /// confirmation request times out). Returns the stored payload for
    /// the wire unsubscribe.
    pub fn cancel(&mut self, key: &TopicKey) -> Result<Value, NdaxError> {
        match self.entries.get_mut(key) {
            Some(entry) if entry.state != SubscriptionState::Cancelled => {
                entry.state = SubscriptionState::Cancelled;
                Ok(entry.payload.clone())
            }
            _ => Err(NdaxError::NotSubscribed(key.describe())),
        }
    }

    /// Drop a Cancelled tombstone once the server has confirmed. A key
    /// that was re-subscribed in the meantime is left alone.
    pub fn remove_if_cancelled(&mut self, key: &TopicKey) {
        if let Some(entry) = self.entries.get(key) {
            if entry.state == SubscriptionState::Cancelled {
                self.entries.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn state_of(&self, key: &TopicKey) -> Option<SubscriptionState> {
        self.entries.get(key).map(|e| e.state)
    }

    /// Deliver a correlated snapshot (the subscribe reply) to its topic.
    pub fn deliver_snapshot(&mut self, key: &TopicKey, payload: Value) {
        self.mark_active(key);
        if let Some(entry) = self.entries.get(key) {
            if entry.state == SubscriptionState::Active {
                let _ = entry.events.send(payload);
            }
        }
    }

    /// Route a push event by method name to the matching live
    /// subscription.
    pub fn dispatch(&mut self, event_method: &str, payload: &Value) -> Dispatch {
        let Some(key) = self.route(event_method, payload) else {
            return Dispatch::NoSubscriber;
        };
        self.mark_active(&key);
        match self.entries.get(&key) {
            Some(entry) if entry.state == SubscriptionState::Active => {
                if entry.events.send(payload.clone()).is_err() {
                    // Receiver is gone; treat like an unsubscribe.
                    warn!(
                        "subscriptions.dispatch receiver_dropped topic={}",
                        key.describe()
                    );
                    self.entries.remove(&key);
                    return Dispatch::NoSubscriber;
                }
                Dispatch::Delivered
            }
            _ => Dispatch::NoSubscriber,
        }
    }

    /// All replayable subscriptions after a reconnect, reset to Pending.
    /// The gateway does not persist subscriptions across socket drops.
    pub fn replayable(&mut self) -> Vec<(TopicKey, Value)> {
        let mut out = Vec::new();
        for (key, entry) in &mut self.entries {
            if entry.state != SubscriptionState::Cancelled {
                entry.state = SubscriptionState::Pending;
                out.push((*key, entry.payload.clone()));
            }
        }
        out
    }

    /// Drop everything; closing the senders ends every caller stream.
    pub fn close_all(&mut self) {
        self.entries.clear();
    }

    fn route(&self, event_method: &str, payload: &Value) -> Option<TopicKey> {
        match event_method {
            "Level1UpdateEvent" => object_instrument(payload).map(|id| TopicKey::Level1 {
                instrument_id: id,
            }),
            // Level 2 deltas are rows of
            // [MDUpdateId, Accounts, Time, Action, LastTradePrice,
            //  Orders, Price, ProductPairCode, Quantity, Side].
            "Level2UpdateEvent" => row_field(payload, 7)
                .or_else(|| object_instrument(payload))
                .map(|id| TopicKey::Level2 { instrument_id: id }),
            // Ticker rows: [Time, High, Low, Open, Close, Volume,
            //  InsideBidPrice, InsideAskPrice, InstrumentId].
            "TickerDataUpdateEvent" => row_field(payload, 8)
                .or_else(|| object_instrument(payload))
                .map(|id| TopicKey::Ticker { instrument_id: id }),
            // Trade rows: [TradeId, ProductPairCode, Quantity, Price, ...].
            "TradeDataUpdateEvent" => row_field(payload, 1)
                .or_else(|| object_instrument(payload))
                .map(|id| TopicKey::Trades { instrument_id: id }),
            "AccountPositionEvent"
            | "OrderStateEvent"
            | "OrderTradeEvent"
            | "NewOrderRejectEvent"
            | "CancelOrderRejectEvent"
            | "CancelAllOrdersRejectEvent"
            | "CancelReplaceOrderRejectEvent"
            | "PendingDepositUpdate"
            | "TransactionEvent"
            | "DepositTicketUpdateEvent"
            | "WithdrawTicketUpdateEvent"
            | "AccountInfoUpdateEvent" => self.route_account_event(payload),
            _ => None,
        }
    }

    /// Account-scoped events carry `AccountId` in most payloads; when it
    /// is absent, a sole account-events subscription gets the event.
    fn route_account_event(&self, payload: &Value) -> Option<TopicKey> {
        if let Some(id) = payload.get("AccountId").and_then(Value::as_i64) {
            let key = TopicKey::AccountEvents { account_id: id };
            if self.entries.contains_key(&key) {
                return Some(key);
            }
        }
        let mut account_keys = self
            .entries
            .keys()
            .filter(|k| matches!(k, TopicKey::AccountEvents { .. }));
        match (account_keys.next(), account_keys.next()) {
            (Some(only), None) => Some(*only),
            _ => None,
        }
    }
}

fn object_instrument(payload: &Value) -> Option<i64> {
    payload.get("InstrumentId").and_then(Value::as_i64)
}

/// Pull an integer out of the first row of a positional row array.
fn row_field(payload: &Value, index: usize) -> Option<i64> {
    payload
        .as_array()?
        .first()?
        .as_array()?
        .get(index)?
        .as_i64()
}
