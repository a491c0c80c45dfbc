//! Error types for the NDAX SDK.
//!
//! The taxonomy separates per-frame decode problems (never fatal to the
//! connection), per-request failures surfaced to the issuing caller, and
//! connection-level failures that drive the supervisor's state machine.
use thiserror::Error;

/// The primary error type for the NDAX SDK.
#[derive(Error, Debug)]
pub enum NdaxError {
    /// Outer envelope of an incoming frame could not be decoded.
    /// Scoped to the one frame; the connection survives.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The envelope was fine but the inner `o` payload was not valid JSON.
    /// Scoped to the one frame.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// No response arrived within the configured deadline. The request is
    /// forgotten; a late reply for its id is ignored.
    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    /// The login handshake failed at some step. Fatal to the current
    /// connection and never retried with the same credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A live subscription already exists for this topic.
    #[error("Duplicate subscription: {0}")]
    DuplicateSubscription(String),

    /// Unsubscribe for a topic that has no live subscription.
    #[error("Not subscribed: {0}")]
    NotSubscribed(String),

    /// Call attempted while disconnected and the offline queue is full
    /// or the session was never started.
    #[error("Not connected")]
    NotConnected,

    /// A privileged operation was invoked without its required
    /// caller-supplied setting. Raised before any network activity.
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    /// The session was stopped by the caller while this request or
    /// subscription was still outstanding.
    #[error("Session closed")]
    SessionClosed,

    /// The connection dropped and automatic recovery was exhausted or
    /// disabled.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The gateway rejected the request (standard reply with
    /// `result: false`).
    #[error("Request rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// Order parameters are inconsistent with the order type, for
    /// example a market order carrying a limit price.
    #[error("Invalid order params: {0}")]
    InvalidOrderParams(String),

    // Transport errors
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("JSON error: {0}")]
    JsonError(String),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for NdaxError {
    fn from(err: serde_json::Error) -> Self {
        NdaxError::JsonError(err.to_string())
    }
}

impl From<url::ParseError> for NdaxError {
    fn from(err: url::ParseError) -> Self {
        NdaxError::Other(format!("URL parse error: {err}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NdaxError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NdaxError::WebSocketError(err.to_string())
    }
}
