//! Pending-call table of a multiplexed connection.
//!
//! DESIGN
//! ======
//! Maps request id → resolution slot. Every mutation (insert on send, route
//! on receive, cancel, teardown) goes through one mutex, so the id → slot
//! mapping cannot be corrupted by concurrent callers. The lock is never held
//! across an await.
//!
//! A cancelled id stays in the table as `Cancelling` until the server
//! acknowledges the cancel or ends the exchange, so late frames for it are
//! dropped instead of being misattributed. Ids are never reused anyway;
//! the client allocates them monotonically.

use std::collections::HashMap;
use std::sync::Mutex;

use frames::{Frame, Status};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{Reply, RequestId};

pub(crate) type CallSlot = oneshot::Sender<Result<Reply, TransportError>>;
pub(crate) type StreamSlot = mpsc::UnboundedSender<Result<Reply, TransportError>>;

pub(crate) enum Slot {
    /// Query or mutation waiting for one terminal frame.
    Call(CallSlot),
    /// Subscription receiving items until a terminal frame.
    Stream(StreamSlot),
    /// Cancel sent; waiting for the server to confirm.
    Cancelling,
}

#[derive(Default)]
struct TableState {
    slots: HashMap<RequestId, Slot>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a slot for a freshly allocated id.
    pub(crate) fn insert(&self, id: RequestId, slot: Slot) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Disconnected);
        }
        if state.slots.contains_key(&id) {
            return Err(TransportError::Unknown(format!("request id {id} is already in flight")));
        }
        state.slots.insert(id, slot);
        Ok(())
    }

    /// Route one inbound frame to its slot.
    pub(crate) fn route(&self, frame: Frame) {
        let id = RequestId(frame.id);
        let mut state = self.lock();
        let Some(slot) = state.slots.remove(&id) else {
            warn!(%id, status = ?frame.status, "rpc: frame for unknown request id");
            return;
        };

        match (slot, frame.status) {
            (Slot::Call(tx), Status::Done) => {
                let _ = tx.send(Ok(Ok(frame.data)));
            }
            (Slot::Call(tx), Status::Error) => {
                let _ = tx.send(Ok(Err(frame.remote_error())));
            }
            (Slot::Call(tx), Status::Cancel) => {
                let _ = tx.send(Err(TransportError::Unknown("request cancelled by server".to_owned())));
            }
            (slot @ Slot::Call(_), status) => {
                warn!(%id, ?status, "rpc: unexpected frame for pending call");
                state.slots.insert(id, slot);
            }
            (Slot::Stream(tx), Status::Item) => {
                // A closed receiver means the consumer is gone; its cancel is on the way.
                let _ = tx.send(Ok(Ok(frame.data)));
                state.slots.insert(id, Slot::Stream(tx));
            }
            (Slot::Stream(tx), Status::Error) => {
                let _ = tx.send(Ok(Err(frame.remote_error())));
            }
            // Done or Cancel: dropping the sender completes the stream.
            (Slot::Stream(_), Status::Done | Status::Cancel) => {}
            (slot @ Slot::Stream(_), Status::Request) => {
                warn!(%id, "rpc: unexpected request frame for subscription");
                state.slots.insert(id, slot);
            }
            (Slot::Cancelling, status) if status.is_terminal() => {
                debug!(%id, ?status, "rpc: request id retired");
            }
            (Slot::Cancelling, status) => {
                debug!(%id, ?status, "rpc: dropping frame for cancelled request");
                state.slots.insert(id, Slot::Cancelling);
            }
        }
    }

    /// Mark an open id as cancelled. Returns `false` if the id is not pending
    /// or is already being cancelled, in which case no cancel frame is needed.
    pub(crate) fn begin_cancel(&self, id: RequestId) -> bool {
        let mut state = self.lock();
        match state.slots.get_mut(&id) {
            Some(slot @ (Slot::Call(_) | Slot::Stream(_))) => {
                *slot = Slot::Cancelling;
                true
            }
            Some(Slot::Cancelling) | None => false,
        }
    }

    /// Close the table and fail every open slot with `Disconnected`.
    /// Returns how many calls and subscriptions were released.
    pub(crate) fn teardown(&self) -> usize {
        let slots = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.slots)
        };

        let mut released = 0;
        for (_, slot) in slots {
            match slot {
                Slot::Call(tx) => {
                    let _ = tx.send(Err(TransportError::Disconnected));
                    released += 1;
                }
                Slot::Stream(tx) => {
                    let _ = tx.send(Err(TransportError::Disconnected));
                    released += 1;
                }
                Slot::Cancelling => {}
            }
        }
        released
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub(crate) fn contains(&self, id: RequestId) -> bool {
        self.lock().slots.contains_key(&id)
    }
}

#[cfg(test)]
#[path = "pending_test.rs"]
mod tests;
