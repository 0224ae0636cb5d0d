//! Request/response transport over HTTP.
//!
//! Each call is one HTTP exchange; connection pooling is left to `reqwest`.
//!
//! - query:    `GET  {endpoint}/{name}?input={json}`
//! - mutation: `POST {endpoint}/{name}` with a JSON body
//!
//! A 2xx body is the procedure output. Any other status carries a
//! `{code, message}` body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{EventStream, Reply, Request, RequestId, Transport, TransportKind};
use crate::error::{RemoteError, TransportError};
use crate::procedure::ProcedureKind;

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build a transport for `endpoint` (e.g. `http://localhost:9000/rpc`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(endpoint: &str, timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| TransportError::Unknown(e.to_string()))?;
        Ok(Self::with_client(client, endpoint))
    }

    /// Build a transport around an existing `reqwest` client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, procedure: &str) -> String {
        format!("{}/{procedure}", self.endpoint)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RequestResponse
    }

    async fn send_request(&self, request: Request) -> Result<Reply, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }

        let url = self.url(&request.procedure);
        let builder = match request.kind {
            ProcedureKind::Query => {
                let builder = self.client.get(url);
                if request.input.is_null() {
                    builder
                } else {
                    builder.query(&[("input", request.input.to_string())])
                }
            }
            ProcedureKind::Mutation => self.client.post(url).json(&request.input),
            ProcedureKind::Subscription => return Err(unsupported_subscription()),
        };

        debug!(id = %request.id, procedure = %request.procedure, kind = %request.kind, "rpc: http request");
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        if status.is_success() {
            return parse_body(&body).map(Ok);
        }
        Ok(Err(remote_error(status.as_u16(), &body)))
    }

    async fn open_stream(&self, _request: Request) -> Result<EventStream, TransportError> {
        Err(unsupported_subscription())
    }

    async fn cancel(&self, _id: RequestId) {}

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn unsupported_subscription() -> TransportError {
    TransportError::Unknown("the request-response transport does not support subscriptions".to_owned())
}

/// Empty bodies decode as `null`. Anything else must be JSON.
fn parse_body(body: &[u8]) -> Result<Value, TransportError> {
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| TransportError::Malformed(e.to_string()))
}

fn remote_error(status: u16, body: &[u8]) -> RemoteError {
    match serde_json::from_slice::<RemoteError>(body) {
        Ok(err) => err,
        Err(_) => RemoteError::new(i32::from(status), String::from_utf8_lossy(body).into_owned()),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Disconnected
    } else {
        TransportError::Unknown(err.to_string())
    }
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
