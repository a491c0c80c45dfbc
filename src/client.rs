//! The public NDAX client.
//!
//! [`NdaxClient`] is a thin façade over the supervisor task: it owns the
//! command channel, the state watch, and the join handle, and exposes
//! typed wrappers for the gateway operations. All wrappers funnel into
//! [`NdaxClient::call`], so anything the gateway supports is reachable
//! even without a wrapper.
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::errors::NdaxError;
use crate::frame::Frame;
use crate::models::OrderRequest;
use crate::subscriptions::TopicKey;
use crate::websocket::{spawn_supervisor, Command, ConnectionState, TypedStream};

/// How long `stop()` waits for the supervisor to acknowledge and exit.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A WebSocket session against the NDAX gateway.
///
/// ```no_run
/// use ndax_sdk::{Credentials, NdaxClient, SessionConfig};
///
/// # async fn example() -> Result<(), ndax_sdk::NdaxError> {
/// let config = SessionConfig::default()
///     .with_credentials(Credentials::new("user", "pass"))
///     .with_account_id(77);
/// let mut client = NdaxClient::new(config);
/// client.start()?;
/// client.authenticate().await?;
/// let positions = client.get_account_positions().await?;
/// println!("{positions}");
/// client.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct NdaxClient {
    config: SessionConfig,
    cmd_tx: Option<mpsc::Sender<Command>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    unhandled_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    task: Option<JoinHandle<()>>,
}

impl NdaxClient {
    pub fn new(config: SessionConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            cmd_tx: None,
            state_tx: Arc::new(state_tx),
            state_rx,
            unhandled_rx: None,
            task: None,
        }
    }

    /// Spawn the connection supervisor. Idempotent; requests issued
    /// before the session is authenticated are queued and flushed once
    /// it is.
    pub fn start(&mut self) -> Result<(), NdaxError> {
        if self.cmd_tx.is_some() {
            return Ok(());
        }
        let url = self.config.validated_url()?;
        debug!("client.start url={url}");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (unhandled_tx, unhandled_rx) = mpsc::unbounded_channel();
        let task = spawn_supervisor(
            self.config.clone(),
            url,
            cmd_rx,
            Arc::clone(&self.state_tx),
            unhandled_tx,
        );
        self.cmd_tx = Some(cmd_tx);
        self.unhandled_rx = Some(unhandled_rx);
        self.task = Some(task);
        Ok(())
    }

    /// Stop the session: close the socket, fail anything outstanding
    /// with `SessionClosed`, suppress reconnection. Idempotent.
    pub async fn stop(&mut self) {
        let Some(cmd_tx) = self.cmd_tx.take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if cmd_tx.send(Command::Stop { ack: ack_tx }).await.is_ok() {
            let _ = tokio::time::timeout(STOP_GRACE, ack_rx).await;
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(STOP_GRACE, task).await;
        }
        debug!("client.stop done");
    }

    /// Current session state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// A watch receiver for observing state transitions.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the login handshake (or anonymous ready-check) has
    /// completed. Returns the handshake failure if the session is
    /// terminally failed.
    pub async fn authenticate(&self) -> Result<(), NdaxError> {
        if self.cmd_tx.is_none() {
            return Err(NdaxError::NotConnected);
        }
        let mut rx = self.state_rx.clone();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Authenticated => return Ok(()),
                ConnectionState::Failed => {
                    return Err(NdaxError::AuthenticationFailed(
                        "session terminally failed".into(),
                    ));
                }
                ConnectionState::Stopped => return Err(NdaxError::SessionClosed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(NdaxError::SessionClosed);
            }
        }
    }

    /// Issue a raw gateway request and await its correlated reply.
    /// Payloads are method-specific objects; the reply is the decoded
    /// inner payload, or `Rejected` when the gateway reports failure.
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value, NdaxError> {
        let cmd_tx = self.cmd_tx.as_ref().ok_or(NdaxError::NotConnected)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Call {
                method: method.to_string(),
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NdaxError::SessionClosed)?;
        reply_rx.await.map_err(|_| NdaxError::SessionClosed)?
    }

    /// Raw frames the supervisor could not route to any subscription.
    /// Take once; intended for diagnostics.
    pub fn unhandled_events(&mut self) -> Option<TypedStream<Frame>> {
        self.unhandled_rx.take().map(TypedStream::new)
    }

    // -----------------------------------------------------------------------
    // Market data
    // -----------------------------------------------------------------------

    /// All products on the OMS.
    pub async fn get_products(&self) -> Result<Value, NdaxError> {
        self.call("GetProducts", json!({ "OMSId": self.config.oms_id }))
            .await
    }

    /// Best bid/offer snapshot for one instrument.
    pub async fn get_level1(&self, instrument_id: i64) -> Result<Value, NdaxError> {
        self.call(
            "GetLevel1",
            json!({ "OMSId": self.config.oms_id, "InstrumentId": instrument_id }),
        )
        .await
    }

    /// Order book snapshot, `depth` rows per side.
    pub async fn get_l2_snapshot(
        &self,
        instrument_id: i64,
        depth: i64,
    ) -> Result<Value, NdaxError> {
        self.call(
            "GetL2Snapshot",
            json!({
                "OMSId": self.config.oms_id,
                "InstrumentId": instrument_id,
                "Depth": depth,
            }),
        )
        .await
    }

    /// OHLCV history between two ISO-8601 timestamps at `interval`
    /// seconds per candle.
    pub async fn get_ticker_history(
        &self,
        instrument_id: i64,
        interval: i64,
        from_date: &str,
        to_date: &str,
    ) -> Result<Value, NdaxError> {
        self.call(
            "GetTickerHistory",
            json!({
                "OMSId": self.config.oms_id,
                "InstrumentId": instrument_id,
                "Interval": interval,
                "FromDate": from_date,
                "ToDate": to_date,
            }),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Account (require `account_id`)
    // -----------------------------------------------------------------------

    /// Balances for every product on the account.
    pub async fn get_account_positions(&self) -> Result<Value, NdaxError> {
        self.call("GetAccountPositions", self.account_payload()?).await
    }

    pub async fn get_account_info(&self) -> Result<Value, NdaxError> {
        self.call("GetAccountInfo", self.account_payload()?).await
    }

    pub async fn get_open_orders(&self) -> Result<Value, NdaxError> {
        self.call("GetOpenOrders", self.account_payload()?).await
    }

    pub async fn get_open_trade_reports(&self) -> Result<Value, NdaxError> {
        self.call("GetOpenTradeReports", self.account_payload()?).await
    }

    /// End the authenticated session server-side. The connection itself
    /// stays up; use [`NdaxClient::stop`] to tear it down.
    pub async fn log_out(&self) -> Result<Value, NdaxError> {
        self.call("LogOut", json!({})).await
    }

    // -----------------------------------------------------------------------
    // Trading
    // -----------------------------------------------------------------------

    /// Place an order. The request is validated locally first; a limit
    /// price is required for limit types and rejected for market types.
    pub async fn send_order(&self, order: &OrderRequest) -> Result<Value, NdaxError> {
        let account_id = self.config.require_account_id()?;
        let payload = order.to_payload(self.config.oms_id, account_id)?;
        self.call("SendOrder", payload).await
    }

    pub async fn cancel_order(&self, order_id: i64) -> Result<Value, NdaxError> {
        let account_id = self.config.require_account_id()?;
        self.call(
            "CancelOrder",
            json!({
                "OMSId": self.config.oms_id,
                "AccountId": account_id,
                "OrderId": order_id,
            }),
        )
        .await
    }

    pub async fn cancel_all_orders(&self) -> Result<Value, NdaxError> {
        self.call("CancelAllOrders", self.account_payload()?).await
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Best bid/offer updates for one instrument. The first item is the
    /// snapshot carried by the subscribe reply.
    pub async fn subscribe_level1(
        &self,
        instrument_id: i64,
    ) -> Result<TypedStream<Value>, NdaxError> {
        self.subscribe_topic(
            TopicKey::Level1 { instrument_id },
            json!({ "OMSId": self.config.oms_id, "InstrumentId": instrument_id }),
        )
        .await
    }

    /// Order book deltas, `depth` rows per side.
    pub async fn subscribe_level2(
        &self,
        instrument_id: i64,
        depth: i64,
    ) -> Result<TypedStream<Value>, NdaxError> {
        self.subscribe_topic(
            TopicKey::Level2 { instrument_id },
            json!({
                "OMSId": self.config.oms_id,
                "InstrumentId": instrument_id,
                "Depth": depth,
            }),
        )
        .await
    }

    /// Candles every `interval` seconds, preceded by the last
    /// `include_last_count` historical ones.
    pub async fn subscribe_ticker(
        &self,
        instrument_id: i64,
        interval: i64,
        include_last_count: i64,
    ) -> Result<TypedStream<Value>, NdaxError> {
        self.subscribe_topic(
            TopicKey::Ticker { instrument_id },
            json!({
                "OMSId": self.config.oms_id,
                "InstrumentId": instrument_id,
                "Interval": interval,
                "IncludeLastCount": include_last_count,
            }),
        )
        .await
    }

    /// Public trade prints, preceded by the last `include_last_count`
    /// historical ones.
    pub async fn subscribe_trades(
        &self,
        instrument_id: i64,
        include_last_count: i64,
    ) -> Result<TypedStream<Value>, NdaxError> {
        self.subscribe_topic(
            TopicKey::Trades { instrument_id },
            json!({
                "OMSId": self.config.oms_id,
                "InstrumentId": instrument_id,
                "IncludeLastCount": include_last_count,
            }),
        )
        .await
    }

    /// Order-state, trade, position, and deposit/withdraw events for the
    /// configured account.
    pub async fn subscribe_account_events(&self) -> Result<TypedStream<Value>, NdaxError> {
        let account_id = self.config.require_account_id()?;
        self.subscribe_topic(
            TopicKey::AccountEvents { account_id },
            json!({ "OMSId": self.config.oms_id, "AccountId": account_id }),
        )
        .await
    }

    pub async fn unsubscribe_level1(&self, instrument_id: i64) -> Result<(), NdaxError> {
        self.unsubscribe_topic(TopicKey::Level1 { instrument_id }).await
    }

    pub async fn unsubscribe_level2(&self, instrument_id: i64) -> Result<(), NdaxError> {
        self.unsubscribe_topic(TopicKey::Level2 { instrument_id }).await
    }

    pub async fn unsubscribe_ticker(&self, instrument_id: i64) -> Result<(), NdaxError> {
        self.unsubscribe_topic(TopicKey::Ticker { instrument_id }).await
    }

    pub async fn unsubscribe_trades(&self, instrument_id: i64) -> Result<(), NdaxError> {
        self.unsubscribe_topic(TopicKey::Trades { instrument_id }).await
    }

    /// The gateway has no wire unsubscribe for account events; this ends
    /// the local stream.
    pub async fn unsubscribe_account_events(&self) -> Result<(), NdaxError> {
        let account_id = self.config.require_account_id()?;
        self.unsubscribe_topic(TopicKey::AccountEvents { account_id })
            .await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn subscribe_topic(
        &self,
        key: TopicKey,
        payload: Value,
    ) -> Result<TypedStream<Value>, NdaxError> {
        let cmd_tx = self.cmd_tx.as_ref().ok_or(NdaxError::NotConnected)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Subscribe {
                key,
                payload,
                events: events_tx,
                ack: ack_tx,
            })
            .await
            .map_err(|_| NdaxError::SessionClosed)?;
        ack_rx.await.map_err(|_| NdaxError::SessionClosed)??;
        Ok(TypedStream::new(events_rx))
    }

    async fn unsubscribe_topic(&self, key: TopicKey) -> Result<(), NdaxError> {
        let cmd_tx = self.cmd_tx.as_ref().ok_or(NdaxError::NotConnected)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Unsubscribe { key, ack: ack_tx })
            .await
            .map_err(|_| NdaxError::SessionClosed)?;
        ack_rx.await.map_err(|_| NdaxError::SessionClosed)?
    }

    fn account_payload(&self) -> Result<Value, NdaxError> {
        let account_id = self.config.require_account_id()?;
        Ok(json!({ "OMSId": self.config.oms_id, "AccountId": account_id }))
    }
}

// No Drop impl: dropping the client drops `cmd_tx`, the supervisor sees
// the closed command channel and shuts itself down like a stop.
