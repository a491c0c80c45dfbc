//! Data models for NDAX gateway payloads.
//!
//! Request payloads are fully typed with the gateway's PascalCase field
//! names. Push payloads (level 1/2 snapshots and deltas, ticks, account
//! events) are deliberately forwarded to the caller as raw
//! `serde_json::Value` — this SDK does not interpret market data.
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::NdaxError;

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Payload for `AuthenticateUser`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthenticateUserRequest {
    pub user_name: String,
    pub password: String,
}

/// Payload for `Authenticate2FA`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TwoFactorRequest {
    pub code: String,
}

/// Reply payload for either authentication step.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthenticateResponse {
    #[serde(rename = "Authenticated")]
    pub authenticated: bool,
    #[serde(rename = "Requires2FA")]
    pub requires_two_factor: bool,
    #[serde(rename = "TwoFAType")]
    pub two_fa_type: Option<String>,
    #[serde(rename = "SessionToken")]
    pub session_token: Option<String>,
    #[serde(rename = "UserId")]
    pub user_id: Option<i64>,
    #[serde(rename = "errormsg")]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Standard reply
// ---------------------------------------------------------------------------

/// The gateway's generic `{result, errormsg, errorcode, detail}` reply
/// shape, used to signal rejection of a request.
#[derive(Debug, Clone, Deserialize)]
pub struct StandardReply {
    pub result: bool,
    pub errormsg: Option<String>,
    #[serde(default)]
    pub errorcode: i64,
    pub detail: Option<String>,
}

impl StandardReply {
    /// Detect a rejection in a reply payload. Only object payloads with
    /// an explicit `result: false` count; data-bearing replies (arrays,
    /// snapshots) pass through untouched. A rejection whose other fields
    /// are off-shape still rejects, with whatever can be salvaged.
    pub fn rejection(payload: &Value) -> Option<StandardReply> {
        let obj = payload.as_object()?;
        if obj.get("result")? != &Value::Bool(false) {
            return None;
        }
        Some(
            serde_json::from_value(payload.clone()).unwrap_or_else(|_| StandardReply {
                result: false,
                errormsg: obj.get("errormsg").and_then(Value::as_str).map(String::from),
                errorcode: obj.get("errorcode").and_then(Value::as_i64).unwrap_or(0),
                detail: obj.get("detail").and_then(Value::as_str).map(String::from),
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order side, with the gateway's wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn code(self) -> i64 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

/// Order type. Whether a limit price belongs on the wire is decided per
/// type, never defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

impl OrderType {
    pub fn code(self) -> i64 {
        match self {
            OrderType::Market => 1,
            OrderType::Limit => 2,
            OrderType::StopMarket => 3,
            OrderType::StopLimit => 4,
        }
    }

    /// Types that carry a limit price on the wire.
    pub fn takes_limit_price(self) -> bool {
        matches!(self, OrderType::Limit | OrderType::StopLimit)
    }
}

/// Time in force, with the gateway's wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    GoodTilCanceled,
    ImmediateOrCancel,
    FillOrKill,
}

impl TimeInForce {
    pub fn code(self) -> i64 {
        match self {
            TimeInForce::GoodTilCanceled => 1,
            TimeInForce::ImmediateOrCancel => 3,
            TimeInForce::FillOrKill => 4,
        }
    }
}

/// A new order for `SendOrder`.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub instrument_id: i64,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub use_display_quantity: bool,
}

impl OrderRequest {
    /// A market order; no price.
    pub fn market(instrument_id: i64, side: Side, quantity: Decimal) -> Self {
        Self {
            instrument_id,
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            time_in_force: TimeInForce::GoodTilCanceled,
            use_display_quantity: false,
        }
    }

    /// A limit order at the given price.
    pub fn limit(instrument_id: i64, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            instrument_id,
            side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(price),
            time_in_force: TimeInForce::GoodTilCanceled,
            use_display_quantity: false,
        }
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    /// Reject price/type mismatches before anything reaches the wire.
    pub fn validate(&self) -> Result<(), NdaxError> {
        if self.quantity <= Decimal::ZERO {
            return Err(NdaxError::InvalidOrderParams(
                "quantity must be positive".into(),
            ));
        }
        match (self.order_type.takes_limit_price(), self.limit_price) {
            (true, None) => Err(NdaxError::InvalidOrderParams(format!(
                "{:?} order requires a limit price",
                self.order_type
            ))),
            (false, Some(_)) => Err(NdaxError::InvalidOrderParams(format!(
                "{:?} order must not carry a limit price",
                self.order_type
            ))),
            (true, Some(p)) if p <= Decimal::ZERO => Err(NdaxError::InvalidOrderParams(
                "limit price must be positive".into(),
            )),
            _ => Ok(()),
        }
    }

    /// The `SendOrder` payload. `LimitPrice` is present only for
    /// price-bearing order types.
    pub fn to_payload(&self, oms_id: i64, account_id: i64) -> Result<Value, NdaxError> {
        self.validate()?;
        let mut payload = json!({
            "OMSId": oms_id,
            "AccountId": account_id,
            "InstrumentId": self.instrument_id,
            "TimeInForce": self.time_in_force.code(),
            "Side": self.side.code(),
            "OrderType": self.order_type.code(),
            "UseDisplayQuantity": self.use_display_quantity,
            "Quantity": decimal_number(self.quantity)?,
        });
        if let Some(price) = self.limit_price {
            payload["LimitPrice"] = decimal_number(price)?;
        }
        Ok(payload)
    }
}

/// The gateway wants JSON numbers, not decimal strings.
fn decimal_number(value: Decimal) -> Result<Value, NdaxError> {
    let f = value
        .to_f64()
        .ok_or_else(|| NdaxError::InvalidOrderParams(format!("{value} is not representable")))?;
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| NdaxError::InvalidOrderParams(format!("{value} is not a finite number")))
}
