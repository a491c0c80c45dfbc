//! Rust SDK for the NDAX WebSocket gateway.
//!
//! NDAX runs on an AlphaPoint gateway where every message, in both
//! directions, is one JSON envelope: `{"m", "i", "n", "o"}` with a
//! message-type code, a sequence number, a method name, and a
//! string-encoded payload. This crate hides the envelope and the session
//! mechanics behind [`NdaxClient`]:
//!
//! - request/reply correlation by sequence number, with timeouts
//! - the login handshake, including time-based two-factor codes
//! - automatic reconnection with exponential backoff and jitter
//! - subscription replay after reconnect, and routing of push events to
//!   per-topic streams
//!
//! Calls issued before the session is ready are queued and flushed once
//! authentication completes. Configuration is supplied by the caller;
//! the SDK never reads environment variables.
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use ndax_sdk::{NdaxClient, SessionConfig};
//!
//! # async fn example() -> Result<(), ndax_sdk::NdaxError> {
//! // Anonymous session: public market data only.
//! let mut client = NdaxClient::new(SessionConfig::default());
//! client.start()?;
//!
//! let mut level1 = client.subscribe_level1(1).await?;
//! while let Some(tick) = level1.next().await {
//!     println!("{tick}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod errors;
pub mod frame;
pub mod models;
pub mod totp;

mod auth;
mod pending;
mod subscriptions;
mod websocket;

pub use client::NdaxClient;
pub use config::{
    Credentials, SessionConfig, WsConfig, DEFAULT_DEPTH, DEFAULT_GATEWAY_URL,
    DEFAULT_INCLUDE_LAST_COUNT, DEFAULT_OMS_ID, DEFAULT_TICKER_INTERVAL,
};
pub use errors::NdaxError;
pub use frame::{Frame, MessageType};
pub use models::{
    AuthenticateResponse, OrderRequest, OrderType, Side, StandardReply, TimeInForce,
};
pub use subscriptions::{SubscriptionState, TopicKey};
pub use websocket::{ConnectionState, TypedStream};
