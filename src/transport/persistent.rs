//! Persistent transport: every call and subscription of a client multiplexed
//! over one connection.
//!
//! DESIGN
//! ======
//! A single I/O task owns the [`Link`]. It `select!`s between the outbound
//! queue and inbound frames, and routes each inbound frame through the
//! [`PendingTable`] by request id. Callers never touch the link directly:
//! they register a slot, queue a `request` frame, and wait on their slot.
//!
//! LIFECYCLE
//! =========
//! 1. `new` spawns the I/O task around a connected link
//! 2. Calls and subscriptions register slots and queue frames
//! 3. Dropping a pending call or an event stream queues a `cancel` frame
//! 4. Link failure, server close, `close()` or dropping the transport ends
//!    the task, which fails every pending slot with `Disconnected`. No
//!    reconnect is attempted.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use frames::Frame;
use futures_util::stream::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::link::{Link, WebSocketLink};
use super::{EventStream, Reply, Request, RequestId, Transport, TransportKind};
use crate::error::TransportError;
use crate::pending::{PendingTable, Slot};

enum Outbound {
    Frame(Frame),
    Close,
}

struct Shared {
    pending: PendingTable,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Shared {
    fn send(&self, frame: Frame) {
        // A closed queue means the I/O task is gone and the table is torn
        // down, so the caller's slot is already resolved.
        let _ = self.outbound.send(Outbound::Frame(frame));
    }

    fn cancel(&self, id: RequestId) {
        if self.pending.begin_cancel(id) {
            debug!(%id, "rpc: cancelling request");
            self.send(Frame::cancel(id.0));
        }
    }
}

pub struct PersistentTransport {
    shared: Arc<Shared>,
    io: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentTransport {
    /// Start the transport on an already connected link.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(link: impl Link) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared { pending: PendingTable::new(), outbound });
        let io = tokio::spawn(run_io(link, Arc::clone(&shared), outbound_rx));
        Self { shared, io: Mutex::new(Some(io)) }
    }

    /// Open a WebSocket connection to `url` and start the transport on it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] if the connection cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let link = WebSocketLink::connect(url).await?;
        info!(%url, "rpc: persistent transport connected");
        Ok(Self::new(link))
    }

    /// Whether the connection has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.pending.is_closed()
    }

    /// Number of ids awaiting a reply, an event, or a cancel acknowledgement.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }
}

#[async_trait]
impl Transport for PersistentTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Persistent
    }

    async fn send_request(&self, request: Request) -> Result<Reply, TransportError> {
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, Slot::Call(tx))?;
        let mut guard = CancelOnDrop { shared: &self.shared, id, armed: true };

        debug!(%id, procedure = %request.procedure, kind = %request.kind, "rpc: sending request");
        self.shared.send(Frame::request(id.0, request.kind, request.procedure, request.input));

        let reply = rx.await.unwrap_or(Err(TransportError::Disconnected));
        guard.armed = false;
        reply
    }

    async fn open_stream(&self, request: Request) -> Result<EventStream, TransportError> {
        let id = request.id;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.pending.insert(id, Slot::Stream(tx))?;

        debug!(%id, procedure = %request.procedure, "rpc: opening subscription");
        self.shared.send(Frame::request(id.0, request.kind, request.procedure, request.input));

        Ok(Box::pin(EventReceiver { shared: Arc::clone(&self.shared), id, rx }))
    }

    async fn cancel(&self, id: RequestId) {
        self.shared.cancel(id);
    }

    async fn close(&self) {
        let _ = self.shared.outbound.send(Outbound::Close);
        let io = self.io.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
        if let Some(io) = io {
            let _ = io.await;
        }
    }
}

impl Drop for PersistentTransport {
    fn drop(&mut self) {
        // Streams still hold the queue sender, so the task would otherwise
        // outlive the transport.
        let _ = self.shared.outbound.send(Outbound::Close);
    }
}

// =============================================================================
// I/O TASK
// =============================================================================

async fn run_io(mut link: impl Link, shared: Arc<Shared>, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = link.send(frame).await {
                        warn!(error = %e, "rpc: send failed; closing connection");
                        break;
                    }
                }
                // Close requested or the transport dropped.
                Some(Outbound::Close) | None => {
                    link.close().await;
                    break;
                }
            },
            inbound = link.recv() => match inbound {
                Some(Ok(frame)) => shared.pending.route(frame),
                Some(Err(e)) => {
                    warn!(error = %e, "rpc: receive failed; closing connection");
                    break;
                }
                None => {
                    info!("rpc: connection closed by server");
                    break;
                }
            },
        }
    }

    let released = shared.pending.teardown();
    info!(released, "rpc: persistent transport closed");
}

// =============================================================================
// CANCELLATION
// =============================================================================

/// Cancels a call whose future is dropped before the reply arrives.
struct CancelOnDrop<'a> {
    shared: &'a Shared,
    id: RequestId,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel(self.id);
        }
    }
}

/// Subscription events for one id. Dropping it cancels the subscription if
/// the server has not ended it yet.
struct EventReceiver {
    shared: Arc<Shared>,
    id: RequestId,
    rx: mpsc::UnboundedReceiver<Result<Reply, TransportError>>,
}

impl Stream for EventReceiver {
    type Item = Result<Reply, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.shared.cancel(self.id);
    }
}

#[cfg(test)]
#[path = "persistent_test.rs"]
mod tests;
