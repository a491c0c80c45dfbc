//! Connection supervision for the NDAX gateway.
//!
//! One background tokio task owns the socket and every piece of session
//! state: the sequence allocator, the pending-request table, the
//! subscription registry, and the auth sequencer. The public client
//! talks to it over an mpsc command channel and reads results through
//! oneshot replies and per-subscription streams, so nothing here needs a
//! lock and writes to the socket are serialized by construction.
//!
//! Lifecycle: connect → authenticate → flush queued calls and replay
//! subscriptions → serve. An unexpected close enters exponential backoff
//! with jitter and reconnects; a caller stop is deterministic and
//! suppresses reconnect. Authentication failure is fatal to the session
//! and never retried with the same credentials.
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::Stream;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::auth::{AuthSequencer, AuthStage, AuthStep};
use crate::config::SessionConfig;
use crate::errors::NdaxError;
use crate::frame::Frame;
use crate::models::StandardReply;
use crate::pending::{PendingRequestTable, Responder, SequenceAllocator};
use crate::subscriptions::{Dispatch, SubscriptionRegistry, TopicKey};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMsg>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How often the pending table is swept for timed-out requests.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the random jitter added to each backoff delay.
const BACKOFF_JITTER_MS: u64 = 250;

/// Observable session state, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    AwaitingTwoFactor,
    Authenticated,
    /// Recovery exhausted or authentication rejected; terminal.
    Failed,
    /// Stopped by the caller; terminal.
    Stopped,
}

/// A typed stream of push payloads for one subscription. Ends when the
/// subscription is cancelled or the session stops.
pub struct TypedStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> TypedStream<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }
}

impl<T> fmt::Debug for TypedStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedStream").finish_non_exhaustive()
    }
}

impl<T> Stream for TypedStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Commands from the public API to the supervisor
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Call {
        method: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value, NdaxError>>,
    },
    Subscribe {
        key: TopicKey,
        payload: Value,
        events: mpsc::UnboundedSender<Value>,
        ack: oneshot::Sender<Result<(), NdaxError>>,
    },
    Unsubscribe {
        key: TopicKey,
        ack: oneshot::Sender<Result<(), NdaxError>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

struct QueuedCall {
    method: String,
    payload: Value,
    reply: oneshot::Sender<Result<Value, NdaxError>>,
}

/// Why the connected loop ended.
enum LoopExit {
    /// Caller stop or client dropped; no reconnect.
    Stopped,
    /// Socket closed or errored; candidate for reconnect.
    Dropped(String),
    /// Handshake rejected; terminal, no reconnect.
    AuthFailed(NdaxError),
}

pub(crate) struct Supervisor {
    config: SessionConfig,
    url: String,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    unhandled_tx: mpsc::UnboundedSender<Frame>,
    sequences: SequenceAllocator,
    pending: PendingRequestTable,
    registry: SubscriptionRegistry,
    auth: AuthSequencer,
    queued: VecDeque<QueuedCall>,
    attempts: usize,
}

pub(crate) fn spawn_supervisor(
    config: SessionConfig,
    url: String,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    unhandled_tx: mpsc::UnboundedSender<Frame>,
) -> tokio::task::JoinHandle<()> {
    let supervisor = Supervisor {
        pending: PendingRequestTable::new(config.request_timeout),
        auth: AuthSequencer::new(config.credentials.clone()),
        config,
        url,
        cmd_rx,
        state_tx,
        unhandled_tx,
        sequences: SequenceAllocator::new(),
        registry: SubscriptionRegistry::new(),
        queued: VecDeque::new(),
        attempts: 0,
    };
    tokio::spawn(supervisor.run())
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            match self.connect().await {
                Ok(ws) => {
                    let opened_at = Instant::now();
                    let (sink, stream) = ws.split();

                    match self.run_connected(sink, stream).await {
                        LoopExit::Stopped => {
                            self.shutdown();
                            return;
                        }
                        LoopExit::AuthFailed(e) => {
                            self.fail_session(e);
                            return;
                        }
                        LoopExit::Dropped(reason) => {
                            warn!("ws.dropped reason={reason}");
                            self.set_state(ConnectionState::Disconnected);
                            self.fail_inflight(&reason);
                            if opened_at.elapsed() >= self.config.ws.stable_threshold {
                                self.attempts = 0;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("ws.connect_failed url={} error={e}", self.url);
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            self.attempts += 1;
            let max = self.config.ws.max_attempts;
            if max > 0 && self.attempts >= max {
                self.fail_session(NdaxError::ConnectionLost(format!(
                    "gave up after {} reconnect attempts",
                    self.attempts
                )));
                return;
            }
            if !self.backoff().await {
                self.shutdown();
                return;
            }
        }
    }

    async fn connect(
        &mut self,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, NdaxError> {
        debug!("ws.connect url={}", self.url);
        let attempt = tokio_tungstenite::connect_async(&self.url);
        let (stream, _) = tokio::time::timeout(self.config.ws.connect_timeout, attempt)
            .await
            .map_err(|_| NdaxError::WebSocketError("connection timeout".into()))??;
        Ok(stream)
    }

    /// The connected loop: read frames, serve commands, sweep timeouts.
    async fn run_connected(&mut self, mut sink: WsSink, mut stream: WsStream) -> LoopExit {
        self.set_state(ConnectionState::AwaitingAuth);
        self.auth.reset();
        let step = self.auth.on_connected();
        if let Some(exit) = self.apply_auth_step(&mut sink, step).await {
            return exit;
        }

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(WsMsg::Text(text))) => match Frame::decode(&text) {
                        Ok(frame) => {
                            if let Some(exit) = self.handle_frame(&mut sink, frame).await {
                                return exit;
                            }
                        }
                        // A single bad frame never tears down the connection.
                        Err(e) => warn!("ws.frame_dropped reason={e}"),
                    },
                    Some(Ok(WsMsg::Ping(data))) => {
                        let _ = sink.send(WsMsg::Pong(data)).await;
                    }
                    Some(Ok(WsMsg::Close(_))) => return LoopExit::Dropped("server closed".into()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return LoopExit::Dropped(e.to_string()),
                    None => return LoopExit::Dropped("stream ended".into()),
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Call { method, payload, reply }) => {
                        if self.auth.is_authenticated() {
                            if let Err(e) = self
                                .send_request(&mut sink, &method, &payload, Responder::Caller(reply))
                                .await
                            {
                                return LoopExit::Dropped(e.to_string());
                            }
                        } else {
                            self.enqueue(QueuedCall { method, payload, reply });
                        }
                    }
                    Some(Command::Subscribe { key, payload, events, ack }) => {
                        match self.registry.insert(key, payload.clone(), events) {
                            Ok(()) => {
                                let _ = ack.send(Ok(()));
                                if self.auth.is_authenticated() {
                                    if let Err(e) = self
                                        .send_request(
                                            &mut sink,
                                            key.subscribe_method(),
                                            &payload,
                                            Responder::Subscription(key),
                                        )
                                        .await
                                    {
                                        return LoopExit::Dropped(e.to_string());
                                    }
                                }
                                // Pre-auth subscriptions go out with the
                                // post-auth replay.
                            }
                            Err(e) => {
                                let _ = ack.send(Err(e));
                            }
                        }
                    }
                    Some(Command::Unsubscribe { key, ack }) => {
                        match self.registry.cancel(&key) {
                            Ok(payload) => {
                                let _ = ack.send(Ok(()));
                                match key.unsubscribe_method() {
                                    Some(method) if self.auth.is_authenticated() => {
                                        if let Err(e) = self
                                            .send_request(
                                                &mut sink,
                                                method,
                                                &payload,
                                                Responder::Unsubscribe(key),
                                            )
                                            .await
                                        {
                                            return LoopExit::Dropped(e.to_string());
                                        }
                                    }
                                    _ => self.registry.remove_if_cancelled(&key),
                                }
                            }
                            Err(e) => {
                                let _ = ack.send(Err(e));
                            }
                        }
                    }
                    Some(Command::Stop { ack }) => {
                        let _ = sink.send(WsMsg::Close(None)).await;
                        let _ = ack.send(());
                        return LoopExit::Stopped;
                    }
                    None => return LoopExit::Stopped,
                },

                _ = sweep.tick() => {
                    if let Some(exit) = self.sweep_expired() {
                        return exit;
                    }
                }
            }
        }
    }

    /// Route one decoded frame: a correlated reply if its id is pending,
    /// otherwise an unsolicited push event.
    async fn handle_frame(&mut self, sink: &mut WsSink, frame: Frame) -> Option<LoopExit> {
        // Membership in the pending table decides reply-vs-event, not the
        // frame's `m` discriminator.
        if !self.pending.contains(frame.sequence) {
            self.handle_event(frame);
            return None;
        }
        let Some(entry) = self.pending.resolve(frame.sequence) else {
            return None;
        };

        debug!("ws.reply method={} seq={}", frame.method, frame.sequence);
        let payload = match frame.payload_value() {
            Ok(p) => p,
            Err(e) => {
                match entry.responder {
                    Responder::Caller(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    Responder::Auth(_) => {
                        return Some(LoopExit::AuthFailed(NdaxError::AuthenticationFailed(
                            format!("unreadable handshake reply: {e}"),
                        )));
                    }
                    Responder::Subscription(_) | Responder::Unsubscribe(_) => {
                        warn!("ws.reply_dropped method={} reason={e}", frame.method);
                    }
                }
                return None;
            }
        };

        match entry.responder {
            Responder::Caller(tx) => {
                let result = match StandardReply::rejection(&payload) {
                    Some(reply) => Err(NdaxError::Rejected {
                        code: reply.errorcode,
                        message: reply.errormsg.unwrap_or_default(),
                    }),
                    None => Ok(payload),
                };
                let _ = tx.send(result);
                None
            }
            Responder::Auth(stage) => {
                let step = self.auth.on_response(stage, &payload);
                self.apply_auth_step(sink, step).await
            }
            Responder::Subscription(key) => {
                // The subscribe reply doubles as the ack and the initial
                // snapshot.
                self.registry.deliver_snapshot(&key, payload);
                None
            }
            Responder::Unsubscribe(key) => {
                self.registry.remove_if_cancelled(&key);
                None
            }
        }
    }

    /// A server-initiated push. Unmatched events land on the diagnostic
    /// channel; they are never silently dropped.
    fn handle_event(&mut self, frame: Frame) {
        match frame.payload_value() {
            Ok(payload) => {
                if self.registry.dispatch(&frame.method, &payload) == Dispatch::NoSubscriber {
                    warn!("ws.event_unhandled method={} seq={}", frame.method, frame.sequence);
                    let _ = self.unhandled_tx.send(frame);
                }
            }
            Err(e) => warn!("ws.event_dropped method={} reason={e}", frame.method),
        }
    }

    async fn apply_auth_step(&mut self, sink: &mut WsSink, step: AuthStep) -> Option<LoopExit> {
        match step {
            AuthStep::SendCredentials(req) => {
                let payload = match serde_json::to_value(&req) {
                    Ok(p) => p,
                    Err(e) => return Some(LoopExit::AuthFailed(e.into())),
                };
                match self
                    .send_request(
                        sink,
                        "AuthenticateUser",
                        &payload,
                        Responder::Auth(AuthStage::Credentials),
                    )
                    .await
                {
                    Ok(()) => None,
                    Err(e) => Some(LoopExit::Dropped(e.to_string())),
                }
            }
            AuthStep::SendTwoFactor(req) => {
                self.set_state(ConnectionState::AwaitingTwoFactor);
                let payload = match serde_json::to_value(&req) {
                    Ok(p) => p,
                    Err(e) => return Some(LoopExit::AuthFailed(e.into())),
                };
                match self
                    .send_request(
                        sink,
                        "Authenticate2FA",
                        &payload,
                        Responder::Auth(AuthStage::TwoFactor),
                    )
                    .await
                {
                    Ok(()) => None,
                    Err(e) => Some(LoopExit::Dropped(e.to_string())),
                }
            }
            AuthStep::Authenticated | AuthStep::Anonymous => {
                match self.become_ready(sink).await {
                    Ok(()) => None,
                    Err(e) => Some(LoopExit::Dropped(e.to_string())),
                }
            }
            AuthStep::Failed(e) => Some(LoopExit::AuthFailed(e)),
        }
    }

    /// The session is authenticated: flush calls queued while offline and
    /// replay every surviving subscription.
    async fn become_ready(&mut self, sink: &mut WsSink) -> Result<(), NdaxError> {
        self.set_state(ConnectionState::Authenticated);
        info!(
            "ws.ready queued_calls={} pending={}",
            self.queued.len(),
            self.pending.len()
        );

        while let Some(QueuedCall { method, payload, reply }) = self.queued.pop_front() {
            self.send_request(sink, &method, &payload, Responder::Caller(reply))
                .await?;
        }

        for (key, payload) in self.registry.replayable() {
            self.send_request(
                sink,
                key.subscribe_method(),
                &payload,
                Responder::Subscription(key),
            )
            .await?;
        }
        Ok(())
    }

    /// Allocate a sequence id, register the pending entry, write the
    /// frame. A write failure leaves the entry for `fail_inflight`.
    async fn send_request(
        &mut self,
        sink: &mut WsSink,
        method: &str,
        payload: &Value,
        responder: Responder,
    ) -> Result<(), NdaxError> {
        let sequence = self.sequences.allocate();
        let frame = Frame::request(sequence, method, payload)?;
        let text = frame.encode()?;
        debug!("ws.send method={method} seq={sequence}");
        self.pending.insert(sequence, method, responder);
        sink.send(WsMsg::Text(text))
            .await
            .map_err(|e| NdaxError::WebSocketError(e.to_string()))
    }

    fn enqueue(&mut self, call: QueuedCall) {
        if self.queued.len() >= self.config.call_queue_limit {
            warn!("ws.queue_full method={}", call.method);
            let _ = call.reply.send(Err(NdaxError::NotConnected));
            return;
        }
        debug!("ws.queued method={} depth={}", call.method, self.queued.len() + 1);
        self.queued.push_back(call);
    }

    /// Time out overdue requests. A handshake timeout is fatal.
    fn sweep_expired(&mut self) -> Option<LoopExit> {
        let now = Instant::now();
        for (sequence, entry) in self.pending.expire(now) {
            warn!("ws.timeout method={} seq={sequence}", entry.method);
            match entry.responder {
                Responder::Caller(tx) => {
                    let _ = tx.send(Err(NdaxError::RequestTimeout(entry.method)));
                }
                Responder::Auth(_) => {
                    return Some(LoopExit::AuthFailed(NdaxError::AuthenticationFailed(
                        format!("{} received no reply", entry.method),
                    )));
                }
                // The topic may still activate via a push; leave it.
                Responder::Subscription(_) => {}
                // Grace period over; drop the tombstone.
                Responder::Unsubscribe(key) => self.registry.remove_if_cancelled(&key),
            }
        }
        None
    }

    /// Requests in flight on a dropped connection cannot be correlated
    /// anymore; fail them now. Queued (unsent) calls survive for the
    /// post-reconnect flush, as do subscriptions.
    fn fail_inflight(&mut self, reason: &str) {
        for (_, entry) in self.pending.drain() {
            match entry.responder {
                Responder::Caller(tx) => {
                    let _ = tx.send(Err(NdaxError::ConnectionLost(reason.to_string())));
                }
                Responder::Unsubscribe(key) => self.registry.remove_if_cancelled(&key),
                Responder::Auth(_) | Responder::Subscription(_) => {}
            }
        }
    }

    /// Terminal failure: everything outstanding errors out and the
    /// session reports `Failed`.
    fn fail_session(&mut self, cause: NdaxError) {
        error!("ws.failed cause={cause}");
        let description = cause.to_string();
        let auth_failure = matches!(cause, NdaxError::AuthenticationFailed(_) | NdaxError::MissingConfig(_));
        for (_, entry) in self.pending.drain() {
            if let Responder::Caller(tx) = entry.responder {
                let _ = tx.send(Err(Self::terminal_error(auth_failure, &description)));
            }
        }
        while let Some(call) = self.queued.pop_front() {
            let _ = call.reply.send(Err(Self::terminal_error(auth_failure, &description)));
        }
        self.registry.close_all();
        self.set_state(ConnectionState::Failed);
    }

    fn terminal_error(auth_failure: bool, description: &str) -> NdaxError {
        if auth_failure {
            NdaxError::AuthenticationFailed(description.to_string())
        } else {
            NdaxError::ConnectionLost(description.to_string())
        }
    }

    /// Caller-initiated stop: deterministic, no reconnect, best effort
    /// only for anything still outstanding.
    fn shutdown(&mut self) {
        info!("ws.stopped pending={} queued={}", self.pending.len(), self.queued.len());
        for (_, entry) in self.pending.drain() {
            if let Responder::Caller(tx) = entry.responder {
                let _ = tx.send(Err(NdaxError::SessionClosed));
            }
        }
        while let Some(call) = self.queued.pop_front() {
            let _ = call.reply.send(Err(NdaxError::SessionClosed));
        }
        self.registry.close_all();
        self.set_state(ConnectionState::Stopped);
    }

    /// Exponential backoff with jitter. Commands arriving while waiting
    /// are served offline; returns `false` when a stop came in.
    async fn backoff(&mut self) -> bool {
        let exponent = self.attempts.saturating_sub(1).min(10) as u32;
        let mut delay = self
            .config
            .ws
            .base_delay
            .saturating_mul(1u32 << exponent);
        if delay > self.config.ws.max_delay {
            delay = self.config.ws.max_delay;
        }
        delay += Duration::from_millis(rand::random::<u64>() % BACKOFF_JITTER_MS);

        info!(
            "ws.backoff attempt={}/{} delay={delay:?}",
            self.attempts,
            self.config.ws.max_attempts
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_offline_command(cmd) {
                            return false;
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    /// Serve a command while disconnected: calls queue up, subscriptions
    /// register for the post-reconnect replay, unsubscribes are local.
    fn handle_offline_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Call { method, payload, reply } => {
                self.enqueue(QueuedCall { method, payload, reply });
            }
            Command::Subscribe { key, payload, events, ack } => {
                let _ = ack.send(self.registry.insert(key, payload, events));
            }
            Command::Unsubscribe { key, ack } => match self.registry.cancel(&key) {
                Ok(_) => {
                    self.registry.remove_if_cancelled(&key);
                    let _ = ack.send(Ok(()));
                }
                Err(e) => {
                    let _ = ack.send(Err(e));
                }
            },
            Command::Stop { ack } => {
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}
