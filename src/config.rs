//! Client configuration parsed from environment variables or flags.

use std::time::Duration;

use reqwest::Url;

use crate::error::ConfigError;
use crate::transport::TransportKind;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Path segment of the persistent endpoint below an HTTP endpoint.
const PERSISTENT_PATH: &str = "ws";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server endpoint, e.g. `http://localhost:9000/rpc`.
    pub endpoint: String,
    pub transport: TransportKind,
    /// Upper bound on one query or mutation. `None` disables it.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Config for `endpoint` with the default transport and timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEndpoint`] unless `endpoint` is an
    /// absolute `http`, `https`, `ws` or `wss` URL.
    pub fn new(endpoint: &str) -> Result<Self, ConfigError> {
        let endpoint = validate_endpoint(endpoint)?;
        Ok(Self {
            endpoint,
            transport: TransportKind::default(),
            request_timeout: Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
        })
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build config from environment variables.
    ///
    /// Required:
    /// - `RPC_ENDPOINT`
    ///
    /// Optional:
    /// - `RPC_TRANSPORT`: `request-response` (default) or `persistent`
    /// - `RPC_REQUEST_TIMEOUT_SECS`: default 30; `0` disables the timeout
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for a missing or invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`], reading values through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`ClientConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let endpoint = lookup("RPC_ENDPOINT").filter(|v| !v.trim().is_empty()).ok_or(ConfigError::MissingEndpoint)?;
        let transport = match lookup("RPC_TRANSPORT") {
            Some(raw) => raw.parse()?,
            None => TransportKind::default(),
        };
        let request_timeout = parse_timeout(lookup("RPC_REQUEST_TIMEOUT_SECS").as_deref())?;

        Ok(Self::new(&endpoint)?.with_transport(transport).with_request_timeout(request_timeout))
    }

    /// URL the persistent transport connects to.
    ///
    /// `http(s)://host/path` maps to `ws(s)://host/path/ws`; `ws(s)` endpoints
    /// are used as given.
    #[must_use]
    pub fn persistent_url(&self) -> String {
        let (scheme, rest) = self.endpoint.split_once("://").unwrap_or(("http", &self.endpoint));
        match scheme {
            "ws" | "wss" => self.endpoint.clone(),
            "https" => format!("wss://{}/{PERSISTENT_PATH}", rest.trim_end_matches('/')),
            _ => format!("ws://{}/{PERSISTENT_PATH}", rest.trim_end_matches('/')),
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidEndpoint { endpoint: endpoint.to_owned(), reason };
    let url = Url::parse(endpoint.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_owned()));
    }
    Ok(endpoint.trim().trim_end_matches('/').to_owned())
}

/// Parse a timeout in whole seconds; `0` disables it, absent means default.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTimeout`] for anything but an integer.
pub fn parse_timeout(raw: Option<&str>) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = raw.map(str::trim) else {
        return Ok(Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)));
    };
    match raw.parse::<u64>() {
        Ok(0) => Ok(None),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
        Err(_) => Err(ConfigError::InvalidTimeout(raw.to_owned())),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
