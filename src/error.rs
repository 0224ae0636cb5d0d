//! Error taxonomy for RPC calls.
//!
//! DESIGN
//! ======
//! `TransportError` covers network-layer failures, plus a response body that
//! is not JSON at all, which the client reports as a decode failure of the
//! procedure it was calling. `RpcError` is what a
//! caller branches on: an encode failure (caller bug), a decode failure
//! (shape mismatch), an application error reported by the server, or a
//! transport failure. Both are `Clone` so one coalesced result can be handed
//! to every waiter.

pub use frames::RemoteError;

/// Network-layer failure of a transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection was lost or closed before the exchange finished.
    #[error("connection lost")]
    Disconnected,
    /// No reply arrived before the configured deadline.
    #[error("request timed out")]
    Timeout,
    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Unknown(String),
    /// The peer answered with a body that is not JSON.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Error returned to the originator of a procedure call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// The input could not be encoded. Not retried.
    #[error("failed to encode input for `{procedure}`: {message}")]
    Serialization { procedure: String, message: String },
    /// The output did not match the declared type of the procedure.
    #[error("output of `{procedure}` does not match its declared type: {message}")]
    Deserialization { procedure: String, message: String },
    /// The server rejected the call. Surfaced verbatim.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RpcError {
    /// Whether the failure came from the network layer.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Normalize a transport failure of a call to `procedure`. A malformed
    /// response is a decode failure, not a network one.
    pub(crate) fn from_transport(procedure: &str, err: TransportError) -> Self {
        match err {
            TransportError::Malformed(message) => Self::Deserialization { procedure: procedure.to_owned(), message },
            other => Self::Transport(other),
        }
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        Self::Remote { code: err.code, message: err.message }
    }
}

/// Invalid client configuration.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing endpoint; pass --endpoint or set RPC_ENDPOINT")]
    MissingEndpoint,
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("unknown transport kind `{0}` (expected `request-response` or `persistent`)")]
    UnknownTransportKind(String),
    #[error("invalid request timeout `{0}`")]
    InvalidTimeout(String),
}
