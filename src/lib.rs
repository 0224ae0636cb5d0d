//! rpclink: a typed RPC client core.
//!
//! SYSTEM CONTEXT
//! ==============
//! Callers invoke server-defined procedures (queries, mutations,
//! subscriptions) through a pluggable transport, with the input and output
//! types of every procedure checked at compile time. Results can flow into a
//! reactive query cache so observers see changing data without orchestrating
//! refetches themselves.
//!
//! ```text
//! caller ─► Client ─► Transport ─► server
//!              ▲          │
//!              └─ decode ◄┘ reply / event stream
//!                  │
//!           CacheAdapter ─► ReactiveCache ─► observers
//! ```
//!
//! - [`procedure`]: catalogue contract and the [`procedures!`] macro
//! - [`transport`]: request/response (HTTP) and persistent (multiplexed
//!   frames over WebSocket) variants
//! - [`client`]: typed dispatch, subscriptions, error normalization
//! - [`cache`]: cache keys, coalesced fetches, live queries, invalidation
//! - [`bootstrap`]: wires everything from a [`ClientConfig`]

pub mod bootstrap;
pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
mod pending;
pub mod procedure;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use bootstrap::Rpc;
pub use cache::{CacheAdapter, CacheEntry, CacheKey, LiveQuery, MemoryCache, ReactiveCache};
pub use client::{Client, Subscription, SubscriptionHandle};
pub use config::ClientConfig;
pub use error::{ConfigError, RemoteError, RpcError, TransportError};
pub use procedure::{
    Catalogue, MutationProcedure, Procedure, ProcedureDescriptor, ProcedureKind, QueryProcedure,
    SubscriptionProcedure,
};
pub use transport::{RequestId, Transport, TransportKind};
