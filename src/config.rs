//! Caller-supplied configuration for an NDAX session.
//!
//! The SDK never reads environment variables; every setting arrives
//! through [`SessionConfig`]. Privileged operations check for their
//! required fields up front and fail with
//! [`NdaxError::MissingConfig`](crate::NdaxError::MissingConfig) before
//! any network activity.
use std::time::Duration;

use crate::errors::NdaxError;

/// Production WebSocket gateway.
pub const DEFAULT_GATEWAY_URL: &str = "wss://api.ndax.io/WSGateway/";

/// The OMS id NDAX runs under.
pub const DEFAULT_OMS_ID: i64 = 1;

/// Default order book depth for level 2 snapshots and subscriptions.
pub const DEFAULT_DEPTH: i64 = 10;

/// Default ticker candle interval, in seconds.
pub const DEFAULT_TICKER_INTERVAL: i64 = 60;

/// Default number of historical entries preceding a ticker or trades
/// subscription.
pub const DEFAULT_INCLUDE_LAST_COUNT: i64 = 100;

/// Login credentials. The TOTP secret is only needed for accounts with
/// two-factor authentication enabled.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Base32-encoded shared secret for the time-based one-time code.
    pub totp_secret: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            totp_secret: None,
        }
    }

    pub fn with_totp_secret(mut self, secret: impl Into<String>) -> Self {
        self.totp_secret = Some(secret.into());
        self
    }
}

/// Configuration for connection and reconnection behavior.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Timeout for the initial TCP + WebSocket handshake (default: 10s).
    pub connect_timeout: Duration,
    /// Base delay between reconnect attempts (default: 1s).
    pub base_delay: Duration,
    /// Maximum delay between reconnect attempts (default: 30s).
    pub max_delay: Duration,
    /// Maximum number of consecutive reconnect attempts
    /// (default: 10, 0 = infinite).
    pub max_attempts: usize,
    /// A connection that stays open at least this long resets the
    /// reconnect attempt counter (default: 30s).
    pub stable_threshold: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            stable_threshold: Duration::from_secs(30),
        }
    }
}

/// Configuration for a single [`NdaxClient`](crate::NdaxClient) session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket gateway URL.
    pub url: String,
    /// Login credentials. Without them the session is anonymous and only
    /// public market-data operations are available.
    pub credentials: Option<Credentials>,
    /// Numeric account id, required for account and trading operations.
    pub account_id: Option<i64>,
    /// OMS id, `1` for NDAX.
    pub oms_id: i64,
    /// Deadline for a correlated response (default: 30s).
    pub request_timeout: Duration,
    /// Capacity of the queue holding calls issued while the session is
    /// not yet connected and authenticated (default: 64). Overflow fails
    /// fast with `NotConnected`.
    pub call_queue_limit: usize,
    pub ws: WsConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            credentials: None,
            account_id: None,
            oms_id: DEFAULT_OMS_ID,
            request_timeout: Duration::from_secs(30),
            call_queue_limit: 64,
            ws: WsConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_account_id(mut self, account_id: i64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_ws(mut self, ws: WsConfig) -> Self {
        self.ws = ws;
        self
    }

    /// The account id, or `MissingConfig` for privileged operations
    /// invoked without one.
    pub(crate) fn require_account_id(&self) -> Result<i64, NdaxError> {
        self.account_id
            .ok_or_else(|| NdaxError::MissingConfig("account_id is not set".into()))
    }

    /// Validate the gateway URL before connecting.
    pub(crate) fn validated_url(&self) -> Result<String, NdaxError> {
        let parsed = url::Url::parse(&self.url)?;
        match parsed.scheme() {
            "ws" | "wss" => Ok(self.url.clone()),
            other => Err(NdaxError::MissingConfig(format!(
                "gateway URL must be ws:// or wss://, got {other}://"
            ))),
        }
    }
}
