//! Shared frame model and codecs for the persistent RPC transport.
//!
//! This crate owns the wire representation exchanged over a multiplexed
//! connection. Every frame carries the request id it belongs to, so many
//! calls and subscriptions can interleave on one socket. Payloads stay
//! flexible (`serde_json::Value`); the binary encoding is protobuf, and a JSON
//! text encoding is available for peers that speak text frames.
//!
//! LIFECYCLE
//! =========
//! - query / mutation: `request → done` or `request → error`
//! - subscription: `request → item* → done` or `request → item* → error`
//! - cancellation: client sends `cancel`, server acknowledges with `cancel`

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame data key for remote error codes.
pub const FRAME_CODE: &str = "code";

/// Frame data key for remote error messages.
pub const FRAME_MESSAGE: &str = "message";

/// Code used when an error frame carries no usable code.
pub const UNKNOWN_ERROR_CODE: i32 = 500;

/// Error returned by the decoding functions.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `status` integer on the wire does not map to a known [`Status`] variant.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
    /// The `kind` integer on the wire does not map to a known [`Kind`] variant.
    #[error("invalid procedure kind: {0}")]
    InvalidKind(i32),
    /// A text frame was not valid frame JSON.
    #[error("failed to decode JSON frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lifecycle status of a frame in a request/response exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Initial request frame sent by the client.
    Request,
    /// One subscription event (non-terminal).
    Item,
    /// Successful terminal response, or stream completion for subscriptions.
    Done,
    /// Error terminal response.
    Error,
    /// Cancel request (client to server) or cancel acknowledgment (server to client).
    Cancel,
}

impl Status {
    /// Terminal statuses end the exchange for their request id.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancel)
    }

    /// Convert status into wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Request => WireStatus::Request as i32,
            Self::Item => WireStatus::Item as i32,
            Self::Done => WireStatus::Done as i32,
            Self::Error => WireStatus::Error as i32,
            Self::Cancel => WireStatus::Cancel as i32,
        }
    }

    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireStatus::try_from(value) {
            Ok(WireStatus::Request) => Ok(Self::Request),
            Ok(WireStatus::Item) => Ok(Self::Item),
            Ok(WireStatus::Done) => Ok(Self::Done),
            Ok(WireStatus::Error) => Ok(Self::Error),
            Ok(WireStatus::Cancel) => Ok(Self::Cancel),
            Err(_) => Err(CodecError::InvalidStatus(value)),
        }
    }
}

/// Procedure kind carried by request frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Query,
    Mutation,
    Subscription,
}

impl Kind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }

    /// Convert kind into wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Query => WireKind::Query as i32,
            Self::Mutation => WireKind::Mutation as i32,
            Self::Subscription => WireKind::Subscription as i32,
        }
    }

    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireKind::try_from(value) {
            Ok(WireKind::Query) => Ok(Self::Query),
            Ok(WireKind::Mutation) => Ok(Self::Mutation),
            Ok(WireKind::Subscription) => Ok(Self::Subscription),
            Err(_) => Err(CodecError::InvalidKind(value)),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-level error reported by the server for one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Read an error payload leniently: missing or mistyped fields fall back
    /// to [`UNKNOWN_ERROR_CODE`] and a generic message.
    #[must_use]
    pub fn from_data(data: &Value) -> Self {
        let code = data
            .get(FRAME_CODE)
            .and_then(Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .unwrap_or(UNKNOWN_ERROR_CODE);
        let message = data
            .get(FRAME_MESSAGE)
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_owned();
        Self { code, message }
    }

    #[must_use]
    pub fn to_data(&self) -> Value {
        serde_json::json!({ FRAME_CODE: self.code, FRAME_MESSAGE: self.message })
    }
}

/// A single message on the multiplexed wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Request id, unique per connection while the exchange is open.
    pub id: u64,
    /// Procedure name. Empty on cancel frames.
    #[serde(default)]
    pub procedure: String,
    /// Procedure kind; set on request frames only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    /// Lifecycle position of the frame.
    pub status: Status,
    /// Input, output, event or error payload depending on `status`.
    #[serde(default)]
    pub data: Value,
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Frame {
    /// Create a request frame for a procedure call.
    pub fn request(id: u64, kind: Kind, procedure: impl Into<String>, data: Value) -> Self {
        Self { id, procedure: procedure.into(), kind: Some(kind), status: Status::Request, data }
    }

    /// Create a cancel frame targeting a previously submitted request.
    #[must_use]
    pub fn cancel(id: u64) -> Self {
        Self { id, procedure: String::new(), kind: None, status: Status::Cancel, data: Value::Null }
    }

    /// Create an item response carrying one subscription event.
    #[must_use]
    pub fn item(&self, data: Value) -> Self {
        self.reply(Status::Item, data)
    }

    /// Create an empty done response (stream completion).
    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Value::Null)
    }

    /// Create a done response carrying a call result.
    #[must_use]
    pub fn done_with(&self, data: Value) -> Self {
        self.reply(Status::Done, data)
    }

    /// Create an error response. Terminal.
    #[must_use]
    pub fn error(&self, err: &RemoteError) -> Self {
        self.reply(Status::Error, err.to_data())
    }

    /// Acknowledge a cancel request. Terminal.
    #[must_use]
    pub fn cancel_ack(&self) -> Self {
        self.reply(Status::Cancel, Value::Null)
    }

    /// Error payload of an error frame.
    #[must_use]
    pub fn remote_error(&self) -> RemoteError {
        RemoteError::from_data(&self.data)
    }

    fn reply(&self, status: Status, data: Value) -> Self {
        Self { id: self.id, procedure: self.procedure.clone(), kind: None, status, data }
    }
}

// =============================================================================
// CODECS
// =============================================================================

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec<u8> cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::InvalidStatus`] / [`CodecError::InvalidKind`] for
/// out-of-range enum values.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    wire_to_frame(wire)
}

/// Encode a frame as JSON text.
#[must_use]
pub fn encode_text(frame: &Frame) -> String {
    // A Frame only holds JSON-representable values.
    serde_json::to_string(frame).unwrap_or_default()
}

/// Decode a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] when the text is not a valid frame.
pub fn decode_text(text: &str) -> Result<Frame, CodecError> {
    Ok(serde_json::from_str(text)?)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        id: frame.id,
        procedure: frame.procedure.clone(),
        kind: frame.kind.map(Kind::as_i32),
        status: frame.status.as_i32(),
        data: Some(json_to_proto_value(&frame.data)),
    }
}

fn wire_to_frame(wire: WireFrame) -> Result<Frame, CodecError> {
    Ok(Frame {
        id: wire.id,
        procedure: wire.procedure,
        kind: wire.kind.map(Kind::from_i32).transpose()?,
        status: Status::from_i32(wire.status)?,
        data: wire.data.map_or(Value::Null, |v| proto_to_json_value(&v)),
    })
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => number_to_json(*v),
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

/// Protobuf numbers are always doubles. Integral values inside the exactly
/// representable range come back as JSON integers so typed decoders that
/// expect integers keep working.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn number_to_json(v: f64) -> Value {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if v.fract() == 0.0 && v.abs() <= MAX_EXACT {
        return Value::Number(serde_json::Number::from(v as i64));
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(uint64, tag = "1")]
    id: u64,
    #[prost(string, tag = "2")]
    procedure: String,
    #[prost(enumeration = "WireKind", optional, tag = "3")]
    kind: Option<i32>,
    #[prost(enumeration = "WireStatus", tag = "4")]
    status: i32,
    #[prost(message, optional, tag = "5")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireStatus {
    Request = 0,
    Done = 1,
    Error = 2,
    Cancel = 3,
    Item = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireKind {
    Query = 0,
    Mutation = 1,
    Subscription = 2,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
