//! Wire format for the control-surface protocol.
//!
//! Every message in either direction is a versioned [`Envelope`]; the only
//! exception is the minimal keep-alive shape ([`KeepAlive`]), which is
//! recognized before generic decoding.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Envelope format version stamped on every outgoing message.
pub const PROTOCOL_VERSION: &str = "1.0";

/// `source` value for envelopes produced by the host.
pub const HOST_SOURCE: &str = "cart-host";

/// `source` value for envelopes produced by a control-surface client.
pub const SURFACE_SOURCE: &str = "control-surface";

/// WebSocket close code for a deliberate shutdown. A close with this code
/// must never trigger client-side reconnection.
pub const CLEAN_SHUTDOWN_CODE: u16 = 1000;

/// Error codes carried by `errorResponse` and failed `${action}Response`
/// envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    MissingAction,
    UnknownAction,
    ExecutionError,
    InvalidVolume,
    InvalidPosition,
    InvalidTabNumber,
}

/// A single protocol message. Immutable once constructed.
///
/// `payload` shape is determined solely by `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub source: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Envelope {
    /// Build an envelope stamped with the current UTC timestamp.
    pub fn new(source: &str, action: &str, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            timestamp: now_rfc3339(),
            source: source.to_string(),
            action: action.to_string(),
            payload,
        }
    }

    /// Build the `${action}Response` envelope confirming a command was
    /// accepted. `payload` must already carry `success`.
    pub fn response(source: &str, action: &str, payload: Value) -> Self {
        Self::new(source, &format!("{action}Response"), payload)
    }

    /// Build a failed `${action}Response` envelope.
    pub fn action_failure(source: &str, action: &str, code: ErrorCode, message: &str) -> Self {
        Self::response(
            source,
            action,
            serde_json::json!({
                "success": false,
                "error": { "message": message, "code": code },
            }),
        )
    }

    /// Build a generic `errorResponse` envelope, used when no action name is
    /// available to answer under (parse failures, unknown actions).
    pub fn error_response(source: &str, code: ErrorCode, message: &str, action: Option<&str>) -> Self {
        let mut payload = serde_json::json!({
            "success": false,
            "error": { "message": message, "code": code },
        });
        if let Some(action) = action {
            payload["action"] = Value::String(action.to_string());
        }
        Self::new(source, "errorResponse", payload)
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an inbound message. Fails closed: JSON parse failures yield
    /// [`Error::Parse`], a message without a usable `action` yields
    /// [`Error::MissingAction`]. Missing `version`/`timestamp`/`source` are
    /// tolerated since only `action` selects behavior.
    pub fn decode(raw: &str) -> Result<Envelope> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| Error::Parse(err.to_string()))?;
        let Some(obj) = value.as_object() else {
            return Err(Error::Parse("expected a JSON object".to_string()));
        };
        match obj.get("action").and_then(Value::as_str) {
            Some(action) if !action.is_empty() => {}
            _ => return Err(Error::MissingAction),
        }
        serde_json::from_value(value).map_err(|err| Error::Parse(err.to_string()))
    }
}

/// Minimal keep-alive shape: `{"type":"ping","timestamp":<epoch-ms>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAlive {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl KeepAlive {
    /// Recognize an inbound ping. Returns `None` for anything else so the
    /// caller falls through to generic envelope decoding.
    pub fn parse_ping(raw: &str) -> Option<KeepAlive> {
        Self::parse_kind(raw, "ping")
    }

    /// Recognize a pong reply on the client side.
    pub fn parse_pong(raw: &str) -> Option<KeepAlive> {
        Self::parse_kind(raw, "pong")
    }

    fn parse_kind(raw: &str, kind: &str) -> Option<KeepAlive> {
        let parsed: KeepAlive = serde_json::from_str(raw).ok()?;
        (parsed.kind == kind).then_some(parsed)
    }

    pub fn ping() -> KeepAlive {
        KeepAlive {
            kind: "ping".to_string(),
            timestamp: epoch_ms(),
        }
    }

    pub fn pong() -> KeepAlive {
        KeepAlive {
            kind: "pong".to_string(),
            timestamp: epoch_ms(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Current UTC time as the RFC 3339 string stamped on envelopes.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}
