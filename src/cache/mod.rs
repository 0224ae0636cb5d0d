//! Cache integration: RPC calls as cacheable, invalidatable data sources.
//!
//! SYSTEM CONTEXT
//! ==============
//! The reactive cache itself is external: anything implementing
//! [`ReactiveCache`] can sit behind the adapter. The cache owns freshness
//! and observer notification; the adapter only decides what to fetch,
//! what to push, and what to invalidate. [`MemoryCache`] is a reference
//! implementation built on `tokio::sync::watch`.
//!
//! DESIGN
//! ======
//! - Keys are derived from the procedure name and a canonical rendering of
//!   the encoded input, so structurally equal inputs share an entry.
//! - Concurrent fetches of one key share a single in-flight call.
//! - Live queries are ref-counted per key. The first guard opens the
//!   subscription; the last one cancels it unless the cache still reports
//!   observers. In that case the next pushed event finds the entry idle
//!   once those observers are gone and cancels it, and
//!   [`CacheAdapter::release_idle`] sweeps queries with no further events.
//! - Mutations are never cached. The caller names the keys a successful
//!   mutation makes stale.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::{Client, SubscriptionHandle};
use crate::codec;
use crate::error::RpcError;
use crate::procedure::{MutationProcedure, Procedure, ProcedureKind, QueryProcedure, SubscriptionProcedure};

pub use memory::MemoryCache;

// =============================================================================
// KEYS AND ENTRIES
// =============================================================================

/// Identity of one cache entry: procedure name plus canonical input.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    procedure: String,
    input: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(procedure: &str, input: &Value) -> Self {
        let mut canonical = String::new();
        write_canonical(input, &mut canonical);
        Self { procedure: procedure.to_owned(), input: canonical }
    }

    /// Key for a typed procedure call.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Serialization`] if the input cannot be encoded.
    pub fn of<P: Procedure>(input: &P::Input) -> Result<Self, RpcError> {
        Ok(Self::new(P::NAME, &codec::encode(P::NAME, input)?))
    }

    #[must_use]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Canonical JSON text of the input.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.procedure, self.input)
    }
}

/// JSON text with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Snapshot of one cache entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheEntry {
    /// Last value written, if any.
    pub value: Option<Value>,
    /// Set by invalidation; cleared by the next write.
    pub stale: bool,
    /// Bumped on every write or invalidation.
    pub version: u64,
}

impl CacheEntry {
    /// The value, if present and not stale.
    #[must_use]
    pub fn fresh_value(&self) -> Option<&Value> {
        self.value.as_ref().filter(|_| !self.stale)
    }
}

/// The four operations the adapter needs from a reactive cache.
pub trait ReactiveCache: Send + Sync + 'static {
    fn get_or_create_entry(&self, key: &CacheKey) -> CacheEntry;

    /// Store a value and notify the entry's observers.
    fn update_entry(&self, key: &CacheKey, value: Value);

    /// Mark an entry stale so its next read refetches.
    fn invalidate_entry(&self, key: &CacheKey);

    /// Number of observers currently interested in the entry.
    fn interest(&self, key: &CacheKey) -> usize;

    /// Store a value only if the entry is still at `version`. Returns whether
    /// the value was stored.
    ///
    /// The default checks and writes in two steps; caches that can do both
    /// under one lock should override it.
    fn update_entry_at(&self, key: &CacheKey, value: Value, version: u64) -> bool {
        if self.get_or_create_entry(key).version != version {
            return false;
        }
        self.update_entry(key, value);
        true
    }
}

// =============================================================================
// ADAPTER
// =============================================================================

type SharedFetch = Shared<BoxFuture<'static, Result<Value, RpcError>>>;

struct LiveEntry {
    guards: usize,
    handle: SubscriptionHandle,
}

struct AdapterInner<C> {
    client: Client,
    cache: Arc<C>,
    inflight: Mutex<HashMap<CacheKey, SharedFetch>>,
    live: Mutex<HashMap<CacheKey, LiveEntry>>,
}

impl<C> AdapterInner<C> {
    fn inflight(&self) -> MutexGuard<'_, HashMap<CacheKey, SharedFetch>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> MutexGuard<'_, HashMap<CacheKey, LiveEntry>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: ReactiveCache> AdapterInner<C> {
    /// Cancel the live query for `key` once no guard and no cache observer
    /// remain. Returns whether it was cancelled.
    fn close_if_idle(&self, key: &CacheKey) -> bool {
        let idle = {
            let mut live = self.live();
            let idle = live.get(key).is_some_and(|entry| entry.guards == 0) && self.cache.interest(key) == 0;
            if idle { live.remove(key) } else { None }
        };
        // Cancel outside the lock: it waits for a running callback, and
        // callbacks take the lock.
        let Some(entry) = idle else { return false };
        debug!(%key, "rpc: closing live query");
        entry.handle.cancel();
        true
    }
}

/// Bridges a [`Client`] and a [`ReactiveCache`]. Cheap to clone.
pub struct CacheAdapter<C> {
    inner: Arc<AdapterInner<C>>,
}

impl<C> Clone for CacheAdapter<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C: ReactiveCache> CacheAdapter<C> {
    pub fn new(client: Client, cache: Arc<C>) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                client,
                cache,
                inflight: Mutex::new(HashMap::new()),
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<C> {
        &self.inner.cache
    }

    /// Cache key for a call of `P` with `input`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Serialization`] if the input cannot be encoded.
    pub fn key<P: Procedure>(&self, input: &P::Input) -> Result<CacheKey, RpcError> {
        CacheKey::of::<P>(input)
    }

    /// Run a query and store its output in the cache.
    ///
    /// Concurrent fetches of the same key share one call; every waiter gets
    /// the same result.
    ///
    /// # Errors
    ///
    /// Same as [`Client::query`]. Failed fetches leave the entry untouched.
    pub async fn fetch<P: QueryProcedure>(&self, input: &P::Input) -> Result<P::Output, RpcError> {
        let input = codec::encode(P::NAME, input)?;
        let key = CacheKey::new(P::NAME, &input);
        let value = self.fetch_value(P::NAME, key, input).await?;
        codec::decode(P::NAME, value)
    }

    /// Serve a query from the cache when the entry is fresh, else fetch it.
    ///
    /// # Errors
    ///
    /// Same as [`CacheAdapter::fetch`].
    pub async fn load<P: QueryProcedure>(&self, input: &P::Input) -> Result<P::Output, RpcError> {
        let input = codec::encode(P::NAME, input)?;
        let key = CacheKey::new(P::NAME, &input);
        let entry = self.inner.cache.get_or_create_entry(&key);
        if let Some(value) = entry.fresh_value() {
            debug!(%key, "rpc: cache hit");
            return codec::decode(P::NAME, value.clone());
        }
        let value = self.fetch_value(P::NAME, key, input).await?;
        codec::decode(P::NAME, value)
    }

    async fn fetch_value(&self, procedure: &'static str, key: CacheKey, input: Value) -> Result<Value, RpcError> {
        let fetch = {
            let mut inflight = self.inner.inflight();
            if let Some(existing) = inflight.get(&key) {
                debug!(%key, "rpc: joining in-flight fetch");
                existing.clone()
            } else {
                let fetch = self.start_fetch(procedure, key.clone(), input);
                inflight.insert(key.clone(), fetch.clone());
                fetch
            }
        };

        let result = fetch.clone().await;

        let mut inflight = self.inner.inflight();
        if inflight.get(&key).is_some_and(|current| current.ptr_eq(&fetch)) {
            inflight.remove(&key);
        }
        result
    }

    fn start_fetch(&self, procedure: &'static str, key: CacheKey, input: Value) -> SharedFetch {
        let client = self.inner.client.clone();
        let cache = Arc::clone(&self.inner.cache);
        async move {
            let version = cache.get_or_create_entry(&key).version;
            debug!(%key, version, "rpc: fetching");
            let value = client.call(ProcedureKind::Query, procedure, input).await?;
            // An invalidation landed while the call was in flight, so this
            // value may predate it.
            if !cache.update_entry_at(&key, value.clone(), version) {
                debug!(%key, "rpc: entry changed during fetch; not caching");
            }
            Ok::<_, RpcError>(value)
        }
        .boxed()
        .shared()
    }

    /// Keep the entry for `P(input)` updated from a live subscription for as
    /// long as the returned guard (or a cache observer) is interested.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Serialization`] if the input cannot be encoded.
    /// Later failures invalidate the entry instead.
    pub fn watch<P: SubscriptionProcedure>(&self, input: &P::Input) -> Result<LiveQuery<P, C>, RpcError> {
        let input = codec::encode(P::NAME, input)?;
        let key = CacheKey::new(P::NAME, &input);

        let mut live = self.inner.live();
        match live.get_mut(&key) {
            Some(entry) if entry.handle.is_live() => entry.guards += 1,
            existing => {
                let guards = existing.map_or(0, |entry| entry.guards) + 1;
                self.inner.cache.get_or_create_entry(&key);
                let handle = self.open_live(P::NAME, key.clone(), input);
                live.insert(key.clone(), LiveEntry { guards, handle });
            }
        }
        drop(live);

        Ok(LiveQuery { adapter: self.clone(), key, released: false, _procedure: PhantomData })
    }

    fn open_live(&self, procedure: &'static str, key: CacheKey, input: Value) -> SubscriptionHandle {
        debug!(%key, "rpc: opening live query");
        let on_event = {
            let cache = Arc::clone(&self.inner.cache);
            let adapter = Arc::downgrade(&self.inner);
            let key = key.clone();
            move |value: Value| {
                cache.update_entry(&key, value);
                if let Some(adapter) = adapter.upgrade() {
                    adapter.close_if_idle(&key);
                }
            }
        };
        let on_error = {
            let cache = Arc::clone(&self.inner.cache);
            let key = key.clone();
            move |err: RpcError| {
                warn!(%key, error = %err, "rpc: live query failed");
                cache.invalidate_entry(&key);
            }
        };
        let on_complete = move || debug!(%key, "rpc: live query completed");
        self.inner.client.subscribe_raw(procedure, input, on_event, on_error, on_complete)
    }

    fn release(&self, key: &CacheKey) {
        if let Some(entry) = self.inner.live().get_mut(key) {
            entry.guards = entry.guards.saturating_sub(1);
        }
        self.inner.close_if_idle(key);
    }

    /// Cancel unguarded live queries that no cache observer watches any more,
    /// and forget unguarded ones that have already ended. Returns how many
    /// entries were removed.
    ///
    /// Queries that still receive events close on their own once idle; this
    /// sweeps the ones the server has gone quiet on.
    pub fn release_idle(&self) -> usize {
        let idle: Vec<_> = {
            let mut live = self.inner.live();
            let keys: Vec<_> = live
                .iter()
                .filter(|(key, entry)| {
                    entry.guards == 0 && (!entry.handle.is_live() || self.inner.cache.interest(key) == 0)
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| live.remove(key)).collect()
        };
        for entry in &idle {
            entry.handle.cancel();
        }
        idle.len()
    }

    /// Cancel every live query regardless of interest. Returns how many
    /// were open.
    pub fn cancel_live(&self) -> usize {
        let drained: Vec<_> = self.inner.live().drain().collect();
        for (key, entry) in &drained {
            debug!(%key, "rpc: closing live query");
            entry.handle.cancel();
        }
        drained.len()
    }

    /// Number of live queries currently tracked.
    #[must_use]
    pub fn live_queries(&self) -> usize {
        self.inner.live().len()
    }

    /// Run a mutation; on success, invalidate each key in `invalidate`.
    /// The result is never cached.
    ///
    /// # Errors
    ///
    /// Same as [`Client::mutate`]. Nothing is invalidated on failure.
    pub async fn mutate<P: MutationProcedure>(
        &self,
        input: &P::Input,
        invalidate: &[CacheKey],
    ) -> Result<P::Output, RpcError> {
        let output = self.inner.client.mutate::<P>(input).await?;
        for key in invalidate {
            self.invalidate(key);
        }
        Ok(output)
    }

    pub fn invalidate(&self, key: &CacheKey) {
        debug!(%key, "rpc: invalidating");
        self.inner.cache.invalidate_entry(key);
    }
}

// =============================================================================
// LIVE QUERY GUARD
// =============================================================================

/// Interest in one live query. Dropping the guard releases it.
pub struct LiveQuery<P, C: ReactiveCache> {
    adapter: CacheAdapter<C>,
    key: CacheKey,
    released: bool,
    _procedure: PhantomData<fn() -> P>,
}

impl<P: SubscriptionProcedure, C: ReactiveCache> LiveQuery<P, C> {
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Latest value pushed into the cache, decoded as `P::Output`.
    #[must_use]
    pub fn current(&self) -> Option<Result<P::Output, RpcError>> {
        let entry = self.adapter.inner.cache.get_or_create_entry(&self.key);
        entry.value.map(|value| codec::decode(P::NAME, value))
    }

    /// Release interest now instead of on drop.
    pub fn release(mut self) {
        self.release_once();
    }
}

impl<P, C: ReactiveCache> LiveQuery<P, C> {
    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.adapter.release(&self.key);
        }
    }
}

impl<P, C: ReactiveCache> Drop for LiveQuery<P, C> {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl<P, C: ReactiveCache> fmt::Debug for LiveQuery<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery").field("key", &self.key).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
