//! Wire envelope codec for the NDAX gateway.
//!
//! Every frame on the socket is a JSON object
//! `{"m": int, "i": int, "n": string, "o": string}` where `o` is itself a
//! JSON-encoded object specific to the method `n`. The same envelope
//! shape carries requests, replies, and server-initiated events; whether
//! an incoming frame answers an outstanding request is decided by
//! pending-table membership of `i`, not by `m`.
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::NdaxError;

/// The `m` discriminator. Unrecognized codes are forward-compatible
/// unknowns, never a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Reply,
    SubscribeToEvent,
    Event,
    UnsubscribeFromEvent,
    Error,
    Unknown(i64),
}

impl MessageType {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => MessageType::Request,
            1 => MessageType::Reply,
            2 => MessageType::SubscribeToEvent,
            3 => MessageType::Event,
            4 => MessageType::UnsubscribeFromEvent,
            5 => MessageType::Error,
            other => MessageType::Unknown(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            MessageType::Request => 0,
            MessageType::Reply => 1,
            MessageType::SubscribeToEvent => 2,
            MessageType::Event => 3,
            MessageType::UnsubscribeFromEvent => 4,
            MessageType::Error => 5,
            MessageType::Unknown(other) => other,
        }
    }
}

/// One decoded gateway frame. The inner payload stays a string until a
/// consumer asks for it, so a bad payload only fails that one frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MessageType,
    pub sequence: u64,
    pub method: String,
    pub payload: String,
}

impl Frame {
    /// Build an outgoing request frame, serializing the payload object
    /// into the inner `o` string.
    pub fn request(
        sequence: u64,
        method: impl Into<String>,
        payload: &impl Serialize,
    ) -> Result<Self, NdaxError> {
        Ok(Self {
            kind: MessageType::Request,
            sequence,
            method: method.into(),
            payload: serde_json::to_string(payload)?,
        })
    }

    /// Serialize into envelope text for the socket.
    pub fn encode(&self) -> Result<String, NdaxError> {
        let envelope = serde_json::json!({
            "m": self.kind.code(),
            "i": self.sequence,
            "n": self.method,
            "o": self.payload,
        });
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode an incoming frame. Invalid outer JSON or missing required
    /// fields (`n`, `i`) yield `MalformedFrame`; the inner payload is not
    /// touched here.
    pub fn decode(text: &str) -> Result<Self, NdaxError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| NdaxError::MalformedFrame(format!("invalid envelope JSON: {e}")))?;

        let obj = value
            .as_object()
            .ok_or_else(|| NdaxError::MalformedFrame("envelope is not an object".into()))?;

        let sequence = obj
            .get("i")
            .and_then(Value::as_u64)
            .ok_or_else(|| NdaxError::MalformedFrame("missing or non-integer field `i`".into()))?;

        let method = obj
            .get("n")
            .and_then(Value::as_str)
            .ok_or_else(|| NdaxError::MalformedFrame("missing or non-string field `n`".into()))?
            .to_string();

        // `m` is informational; an absent or odd value must not kill the frame.
        let kind = MessageType::from_code(obj.get("m").and_then(Value::as_i64).unwrap_or(-1));

        let payload = match obj.get("o") {
            Some(Value::String(s)) => s.clone(),
            // Some gateway builds send `o` as a bare object.
            Some(other) if other.is_object() || other.is_array() => other.to_string(),
            _ => "{}".to_string(),
        };

        Ok(Self {
            kind,
            sequence,
            method,
            payload,
        })
    }

    /// Parse the inner payload as loose JSON. An empty payload string
    /// decodes as an empty object.
    pub fn payload_value(&self) -> Result<Value, NdaxError> {
        if self.payload.is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.payload).map_err(|e| {
            NdaxError::MalformedPayload(format!("{} payload is not valid JSON: {e}", self.method))
        })
    }

    /// Parse the inner payload into a typed model.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, NdaxError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            NdaxError::MalformedPayload(format!("{} payload did not match schema: {e}", self.method))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_encodes_payload_as_inner_string() {
        let frame = Frame::request(2, "GetProducts", &json!({ "OMSId": 1 })).unwrap();
        let text = frame.encode().unwrap();

        let outer: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(outer["m"], 0);
        assert_eq!(outer["i"], 2);
        assert_eq!(outer["n"], "GetProducts");
        // `o` rides as a string, not a nested object.
        let inner: Value = serde_json::from_str(outer["o"].as_str().unwrap()).unwrap();
        assert_eq!(inner["OMSId"], 1);
    }

    #[test]
    fn test_decode_reply_frame() {
        let text = r#"{"m":1,"i":4,"n":"GetLevel1","o":"{\"BestBid\":41000.5}"}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.kind, MessageType::Reply);
        assert_eq!(frame.sequence, 4);
        assert_eq!(frame.method, "GetLevel1");
        assert_eq!(frame.payload_value().unwrap()["BestBid"], 41000.5);
    }

    #[test]
    fn test_decode_tolerates_bare_object_payload() {
        let text = r#"{"m":3,"i":0,"n":"Level1UpdateEvent","o":{"InstrumentId":5}}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.payload_value().unwrap()["InstrumentId"], 5);
    }

    #[test]
    fn test_decode_missing_fields_is_malformed() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(NdaxError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::decode(r#"{"m":1,"o":"{}"}"#),
            Err(NdaxError::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::decode(r#"{"m":1,"i":2,"o":"{}"}"#),
            Err(NdaxError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_message_code_survives_decode() {
        let text = r#"{"m":42,"i":6,"n":"FutureThing","o":"{}"}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.kind, MessageType::Unknown(42));
        assert_eq!(frame.kind.code(), 42);
    }

    #[test]
    fn test_missing_payload_decodes_as_empty_object() {
        let text = r#"{"m":1,"i":2,"n":"LogOut"}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.payload_value().unwrap(), json!({}));
    }

    #[test]
    fn test_bad_inner_payload_fails_only_on_access() {
        let text = r#"{"m":1,"i":2,"n":"GetProducts","o":"{broken"}"#;
        let frame = Frame::decode(text).unwrap();
        assert!(matches!(
            frame.payload_value(),
            Err(NdaxError::MalformedPayload(_))
        ));
    }
}
