//! Composition root: transport, client, cache and adapter in one value.
//!
//! LIFECYCLE
//! =========
//! 1. `Rpc::connect(config)` builds the configured transport (opening the
//!    connection for the persistent variant), the client, and the adapter
//! 2. Callers use `client()` for plain calls and `adapter()` for cached ones
//! 3. `shutdown()` cancels live queries and closes the transport
//!
//! There is no process-wide instance; whoever builds the `Rpc` owns it.

use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheAdapter, MemoryCache, ReactiveCache};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::procedure::{Catalogue, CatalogueError, ProcedureKind};
use crate::transport::{HttpTransport, PersistentTransport, Transport, TransportKind};

pub struct Rpc<C: ReactiveCache = MemoryCache> {
    client: Client,
    adapter: CacheAdapter<C>,
}

impl Rpc<MemoryCache> {
    /// Connect with an in-memory cache.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the transport cannot be built or the
    /// persistent connection cannot be opened.
    pub async fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        Self::with_cache(config, Arc::new(MemoryCache::new())).await
    }
}

impl<C: ReactiveCache> Rpc<C> {
    /// Connect with a caller-provided cache.
    ///
    /// # Errors
    ///
    /// See [`Rpc::connect`].
    pub async fn with_cache(config: &ClientConfig, cache: Arc<C>) -> Result<Self, TransportError> {
        let transport: Arc<dyn Transport> = match config.transport {
            // The client applies the request timeout for both variants.
            TransportKind::RequestResponse => Arc::new(HttpTransport::new(&config.endpoint, None)?),
            TransportKind::Persistent => Arc::new(PersistentTransport::connect(&config.persistent_url()).await?),
        };
        info!(endpoint = %config.endpoint, transport = %config.transport, "rpc: client ready");

        let client = Client::from_shared(transport).with_timeout(config.request_timeout);
        Ok(Self::from_client(client, cache))
    }

    /// Wrap an already built client.
    pub fn from_client(client: Client, cache: Arc<C>) -> Self {
        let adapter = CacheAdapter::new(client.clone(), cache);
        Self { client, adapter }
    }

    /// Check the procedure catalogue this client is used with.
    ///
    /// # Errors
    ///
    /// Returns the first invalid or duplicated procedure name.
    pub fn with_catalogue<K: Catalogue>(self) -> Result<Self, CatalogueError> {
        let descriptors = K::validate()?;
        let count = |kind: ProcedureKind| descriptors.iter().filter(|d| d.kind == kind).count();
        info!(
            queries = count(ProcedureKind::Query),
            mutations = count(ProcedureKind::Mutation),
            subscriptions = count(ProcedureKind::Subscription),
            "rpc: catalogue registered"
        );
        Ok(self)
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn adapter(&self) -> &CacheAdapter<C> {
        &self.adapter
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<C> {
        self.adapter.cache()
    }

    /// Cancel live queries and close the transport. Calls still pending
    /// fail with [`TransportError::Disconnected`].
    pub async fn shutdown(self) {
        let live = self.adapter.cancel_live();
        self.client.close().await;
        info!(live, "rpc: shut down");
    }
}
