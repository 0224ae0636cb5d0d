//! Dispatcher: the typed front door of the RPC core.
//!
//! DESIGN
//! ======
//! `Client` turns a procedure and its input into a transport [`Request`],
//! waits for the reply and decodes it against the procedure's declared
//! output type. Error normalization happens here: the transport's nested
//! result is flattened into one [`RpcError`].
//!
//! Subscriptions are delivered by a spawned task per subscription. The task
//! owns the callbacks; the caller keeps a [`SubscriptionHandle`] whose
//! `cancel` flips a shared flag and wakes the task. Every callback runs
//! under the handle's delivery lock, and `cancel` takes that lock once
//! before returning, so it waits for a callback already running on another
//! thread but never on the network.
//!
//! Request ids come from one monotonic counter per client. A client owns its
//! transport, so ids are unique per connection and never reused.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::codec;
use crate::error::{RpcError, TransportError};
use crate::procedure::{MutationProcedure, Procedure, ProcedureKind, QueryProcedure, SubscriptionProcedure};
use crate::transport::{Request, RequestId, Transport, TransportKind};

/// Default upper bound on one query or mutation round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    next_id: Arc<AtomicU64>,
    timeout: Option<Duration>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport.kind())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client over `transport` with the default request timeout.
    pub fn new(transport: impl Transport) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
        Self { transport, next_id: Arc::new(AtomicU64::new(1)), timeout: Some(DEFAULT_REQUEST_TIMEOUT) }
    }

    /// Replace the request timeout. `None` waits indefinitely.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    fn next_id(&self) -> RequestId {
        RequestId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // CALLS
    // =========================================================================

    /// Run a query and decode its output.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Serialization`] if the input cannot be encoded
    /// - [`RpcError::Remote`] if the server rejects the call
    /// - [`RpcError::Transport`] if the transport fails or the timeout elapses
    /// - [`RpcError::Deserialization`] if the output does not match `P::Output`
    pub async fn query<P: QueryProcedure>(&self, input: &P::Input) -> Result<P::Output, RpcError> {
        self.dispatch::<P>(input).await
    }

    /// Run a mutation and decode its output. Never retried.
    ///
    /// # Errors
    ///
    /// Same as [`Client::query`].
    pub async fn mutate<P: MutationProcedure>(&self, input: &P::Input) -> Result<P::Output, RpcError> {
        self.dispatch::<P>(input).await
    }

    async fn dispatch<P: Procedure>(&self, input: &P::Input) -> Result<P::Output, RpcError> {
        let input = codec::encode(P::NAME, input)?;
        let output = self.call(P::KIND, P::NAME, input).await?;
        codec::decode(P::NAME, output)
    }

    /// Untyped query or mutation by name.
    ///
    /// Dropping the returned future cancels the call.
    ///
    /// # Errors
    ///
    /// [`RpcError::Remote`] or [`RpcError::Transport`]; a body that is not
    /// JSON is [`RpcError::Deserialization`]. A subscription kind is rejected
    /// with [`TransportError::Unknown`].
    pub async fn call(&self, kind: ProcedureKind, procedure: &str, input: Value) -> Result<Value, RpcError> {
        if kind == ProcedureKind::Subscription {
            return Err(TransportError::Unknown(format!("`{procedure}` is a subscription; use subscribe")).into());
        }

        let request = Request { id: self.next_id(), kind, procedure: procedure.to_owned(), input };
        let id = request.id;
        let send = self.transport.send_request(request);
        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(reply) => reply,
                Err(_) => {
                    debug!(%id, %procedure, "rpc: request timed out");
                    Err(TransportError::Timeout)
                }
            },
            None => send.await,
        };
        match reply {
            Ok(reply) => Ok(reply?),
            Err(err) => Err(RpcError::from_transport(procedure, err)),
        }
    }

    // =========================================================================
    // SUBSCRIPTIONS
    // =========================================================================

    /// Open a subscription and deliver its events through callbacks.
    ///
    /// Returns immediately. `on_event` receives events in server order;
    /// `on_error` is called at most once and ends the subscription;
    /// `on_complete` is called when the server ends the stream. No callback
    /// fires after [`SubscriptionHandle::cancel`] has returned. Dropping the
    /// handle does not cancel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_with<P, E, F, C>(
        &self,
        input: &P::Input,
        on_event: E,
        on_error: F,
        on_complete: C,
    ) -> SubscriptionHandle
    where
        P: SubscriptionProcedure,
        E: FnMut(P::Output) + Send + 'static,
        F: FnOnce(RpcError) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        match codec::encode(P::NAME, input) {
            Ok(input) => self.spawn_subscription::<P::Output, _, _, _>(P::NAME, input, on_event, on_error, on_complete),
            Err(err) => {
                let handle = SubscriptionHandle::new(self.next_id(), P::NAME);
                handle.state.close();
                on_error(err);
                handle
            }
        }
    }

    /// Open a subscription and receive its events from a channel.
    ///
    /// Dropping the returned [`Subscription`] cancels it.
    pub fn subscribe<P: SubscriptionProcedure>(&self, input: &P::Input) -> Subscription<P::Output> {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = tx.clone();
        let handle = self.subscribe_with::<P, _, _, _>(
            input,
            move |event| {
                let _ = tx.send(Ok(event));
            },
            move |err| {
                let _ = errors.send(Err(err));
            },
            || {},
        );
        Subscription { handle, rx }
    }

    /// Untyped subscription by name; events are raw JSON values.
    pub fn subscribe_raw<E, F, C>(
        &self,
        procedure: &str,
        input: Value,
        on_event: E,
        on_error: F,
        on_complete: C,
    ) -> SubscriptionHandle
    where
        E: FnMut(Value) + Send + 'static,
        F: FnOnce(RpcError) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.spawn_subscription::<Value, _, _, _>(procedure, input, on_event, on_error, on_complete)
    }

    fn spawn_subscription<T, E, F, C>(
        &self,
        procedure: &str,
        input: Value,
        on_event: E,
        on_error: F,
        on_complete: C,
    ) -> SubscriptionHandle
    where
        T: DeserializeOwned + Send + 'static,
        E: FnMut(T) + Send + 'static,
        F: FnOnce(RpcError) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let handle = SubscriptionHandle::new(self.next_id(), procedure);
        let request = Request {
            id: handle.id,
            kind: ProcedureKind::Subscription,
            procedure: procedure.to_owned(),
            input,
        };
        debug!(id = %handle.id, %procedure, "rpc: subscribing");
        let callbacks = Callbacks { on_event, on_error, on_complete };
        tokio::spawn(deliver(Arc::clone(&self.transport), request, Arc::clone(&handle.state), callbacks));
        handle
    }

    /// Close the underlying transport. Pending calls fail with
    /// [`TransportError::Disconnected`].
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

// =============================================================================
// DELIVERY
// =============================================================================

struct Callbacks<E, F, C> {
    on_event: E,
    on_error: F,
    on_complete: C,
}

async fn deliver<T, E, F, C>(
    transport: Arc<dyn Transport>,
    request: Request,
    state: Arc<HandleState>,
    callbacks: Callbacks<E, F, C>,
) where
    T: DeserializeOwned,
    E: FnMut(T),
    F: FnOnce(RpcError),
    C: FnOnce(),
{
    let Callbacks { mut on_event, on_error, on_complete } = callbacks;
    let id = request.id;
    let procedure = request.procedure.clone();

    let mut events = match transport.open_stream(request).await {
        Ok(events) => events,
        Err(err) => {
            state.in_turn(|| state.close().then(|| on_error(RpcError::from_transport(&procedure, err))));
            return;
        }
    };

    loop {
        let event = tokio::select! {
            biased;
            () = state.cancelled() => {
                debug!(%id, %procedure, "rpc: subscription cancelled");
                transport.cancel(id).await;
                return;
            }
            event = events.next() => event,
        };

        match event {
            Some(Ok(Ok(value))) => match codec::decode::<T>(&procedure, value) {
                Ok(event) => {
                    if !state.in_turn(|| state.is_live().then(|| on_event(event)).is_some()) {
                        return;
                    }
                }
                Err(err) => {
                    state.in_turn(|| state.close().then(|| on_error(err)));
                    transport.cancel(id).await;
                    return;
                }
            },
            Some(Ok(Err(remote))) => {
                state.in_turn(|| state.close().then(|| on_error(remote.into())));
                return;
            }
            Some(Err(err)) => {
                state.in_turn(|| state.close().then(|| on_error(RpcError::from_transport(&procedure, err))));
                return;
            }
            None => {
                state.in_turn(|| {
                    state.close().then(|| {
                        debug!(%id, %procedure, "rpc: subscription completed");
                        on_complete();
                    })
                });
                return;
            }
        }
    }
}

#[derive(Debug)]
struct HandleState {
    live: AtomicBool,
    cancel: Notify,
    /// Held while a callback runs.
    turn: Mutex<()>,
    /// Thread currently running a callback, if any.
    delivering_on: Mutex<Option<ThreadId>>,
}

impl HandleState {
    fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            cancel: Notify::new(),
            turn: Mutex::new(()),
            delivering_on: Mutex::new(None),
        }
    }

    fn set_delivering_on(&self, thread: Option<ThreadId>) {
        *self.delivering_on.lock().unwrap_or_else(PoisonError::into_inner) = thread;
    }

    /// Run one callback step under the delivery lock.
    fn in_turn<R>(&self, step: impl FnOnce() -> R) -> R {
        let _turn = self.turn.lock().unwrap_or_else(PoisonError::into_inner);
        self.set_delivering_on(Some(thread::current().id()));
        let out = step();
        self.set_delivering_on(None);
        out
    }

    /// Wait for a callback running on another thread to return. A cancel
    /// issued from inside a callback returns immediately.
    fn wait_turn(&self) {
        let current = *self.delivering_on.lock().unwrap_or_else(PoisonError::into_inner);
        if current != Some(thread::current().id()) {
            drop(self.turn.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Close the handle. Returns whether it was still live.
    fn close(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }

    async fn cancelled(&self) {
        if !self.is_live() {
            return;
        }
        // `notify_one` stores a permit, so a cancel landing between the check
        // above and this await is not lost.
        self.cancel.notified().await;
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Caller-side view of one subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    id: RequestId,
    procedure: Arc<str>,
    state: Arc<HandleState>,
}

impl SubscriptionHandle {
    fn new(id: RequestId, procedure: &str) -> Self {
        Self { id, procedure: Arc::from(procedure), state: Arc::new(HandleState::new()) }
    }

    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    #[must_use]
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Whether events may still be delivered.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Stop the subscription. Idempotent. Once it returns no callback of
    /// this subscription runs again; it only waits for one that is already
    /// running on another thread.
    pub fn cancel(&self) {
        if self.state.close() {
            self.state.cancel.notify_one();
        }
        self.state.wait_turn();
    }
}

/// Channel-backed subscription. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct Subscription<T> {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<Result<T, RpcError>>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the subscription has ended. A terminal
    /// error is yielded once before `None`.
    pub async fn next(&mut self) -> Option<Result<T, RpcError>> {
        self.rx.recv().await
    }

    #[must_use]
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
