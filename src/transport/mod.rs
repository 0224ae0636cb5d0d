//! Transports: the pluggable layer that moves calls and events.
//!
//! SYSTEM CONTEXT
//! ==============
//! `http` is the request/response variant (one exchange per call),
//! `persistent` multiplexes every call and subscription of a client over one
//! connection, and `link` provides the frame-level connections it runs on
//! (WebSocket and in-process memory).
//!
//! Replies are nested results: the outer `Result` is the transport outcome,
//! the inner one is the server's answer. The client flattens them into
//! [`RpcError`](crate::error::RpcError).

pub mod http;
pub mod link;
pub mod persistent;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::{ConfigError, RemoteError, TransportError};
use crate::procedure::ProcedureKind;

pub use http::HttpTransport;
pub use link::{Link, MemoryLink, WebSocketLink};
pub use persistent::PersistentTransport;

/// Correlates a request with its response or events. Allocated by the client,
/// monotonic, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One outbound call, already encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub kind: ProcedureKind,
    pub procedure: String,
    pub input: Value,
}

/// The server's answer to one request, or one subscription event.
pub type Reply = Result<Value, RemoteError>;

/// Subscription events in server emission order. The stream ends when the
/// server completes the subscription.
pub type EventStream = BoxStream<'static, Result<Reply, TransportError>>;

/// Which transport variant a client runs on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    RequestResponse,
    Persistent,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestResponse => "request-response",
            Self::Persistent => "persistent",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "request-response" | "http" => Ok(Self::RequestResponse),
            "persistent" | "ws" => Ok(Self::Persistent),
            other => Err(ConfigError::UnknownTransportKind(other.to_owned())),
        }
    }
}

/// Capability set every transport provides.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Deliver a query or mutation and wait for its reply.
    ///
    /// Dropping the returned future cancels the call.
    async fn send_request(&self, request: Request) -> Result<Reply, TransportError>;

    /// Open a subscription stream.
    async fn open_stream(&self, request: Request) -> Result<EventStream, TransportError>;

    /// Stop an open call or subscription. Unknown or finished ids are ignored.
    async fn cancel(&self, id: RequestId);

    /// Tear the transport down. Pending calls fail with `Disconnected`.
    async fn close(&self);
}
