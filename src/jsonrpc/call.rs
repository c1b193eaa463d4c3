use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use super::error::{PeerError, Result};
use super::message::NOTIFICATION_ID;
use super::pending::Completion;

/// One outgoing request, completed at most once.
///
/// Exactly one of `reply` / `error` is set once the call has been delivered
/// through its done channel.
#[derive(Debug)]
pub struct Call<R> {
    /// Assigned at send time, never 0 for a call that reached the wire
    pub id: u64,
    pub method: String,
    pub params: Value,
    /// Decoded `result` of the matching response
    pub reply: Option<R>,
    /// Local failure (write error, closed connection, undecodable result)
    pub error: Option<PeerError>,
}

impl<R> Call<R> {
    fn new(method: String, params: Value) -> Self {
        Self {
            id: NOTIFICATION_ID,
            method,
            params,
            reply: None,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<R> {
        match (self.error, self.reply) {
            (Some(error), _) => Err(error),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(PeerError::Protocol(format!(
                "call {} ({}) completed without a reply",
                self.id, self.method
            ))),
        }
    }
}

/// Create a completion channel holding up to `capacity` finished calls.
///
/// # Panics
///
/// A zero capacity can neither hold nor deliver a completion, so it is
/// rejected immediately.
pub fn done_channel<R>(capacity: usize) -> (DoneSender<R>, DoneReceiver<R>) {
    assert!(capacity > 0, "peer: done channel is unbuffered");
    let (tx, rx) = mpsc::channel(capacity);
    (DoneSender { tx, capacity }, DoneReceiver { rx })
}

/// Sending half of a completion channel; may be shared between calls
#[derive(Debug)]
pub struct DoneSender<R> {
    tx: mpsc::Sender<Call<R>>,
    capacity: usize,
}

impl<R> Clone for DoneSender<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<R> DoneSender<R> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking, at-most-once delivery. A full channel drops the call.
    pub(crate) fn deliver(&self, call: Call<R>) {
        match self.tx.try_send(call) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => {
                log::warn!(
                    "Discarding reply of call {} ({}) due to insufficient done channel capacity",
                    call.id, call.method
                );
            }
            Err(TrySendError::Closed(call)) => {
                log::debug!(
                    "Done channel for call {} ({}) was dropped by its owner",
                    call.id, call.method
                );
            }
        }
    }
}

/// Receiving half of a completion channel
#[derive(Debug)]
pub struct DoneReceiver<R> {
    rx: mpsc::Receiver<Call<R>>,
}

impl<R> DoneReceiver<R> {
    /// Wait for the next completed call. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Call<R>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Call<R>, TryRecvError> {
        self.rx.try_recv()
    }
}

/// Returned by `Peer::call` as soon as the call has been written
#[derive(Debug)]
pub struct CallHandle<R> {
    id: u64,
    method: String,
    receiver: Option<DoneReceiver<R>>,
}

impl<R> CallHandle<R> {
    pub(crate) fn new(id: u64, method: String, receiver: Option<DoneReceiver<R>>) -> Self {
        Self {
            id,
            method,
            receiver,
        }
    }

    /// Assigned ID; 0 when the peer was already closed and nothing was sent
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait on the internally created done channel.
    ///
    /// Returns `None` when the caller supplied its own channel (the
    /// completion goes there instead) or when the peer went away.
    pub async fn done(self) -> Option<Call<R>> {
        let mut receiver = self.receiver?;
        receiver.recv().await
    }

    pub fn into_receiver(self) -> Option<DoneReceiver<R>> {
        self.receiver
    }
}

/// A registered call waiting for its response
pub(crate) struct Outstanding<R> {
    call: Call<R>,
    done: DoneSender<R>,
}

impl<R> Outstanding<R> {
    pub(crate) fn new(method: String, params: Value, done: DoneSender<R>) -> Self {
        Self {
            call: Call::new(method, params),
            done,
        }
    }
}

impl<R: DeserializeOwned + Send + 'static> Completion for Outstanding<R> {
    fn set_id(&mut self, id: u64) {
        self.call.id = id;
    }

    fn complete(self: Box<Self>, result: Value) -> Result<()> {
        let Outstanding { mut call, done } = *self;
        match serde_json::from_value::<R>(result) {
            Ok(reply) => {
                call.reply = Some(reply);
                done.deliver(call);
                Ok(())
            }
            Err(e) => {
                let message = format!(
                    "cannot decode result of call {} ({}): {}",
                    call.id, call.method, e
                );
                call.error = Some(PeerError::Protocol(message.clone()));
                done.deliver(call);
                Err(PeerError::Protocol(message))
            }
        }
    }

    fn fail(self: Box<Self>, error: PeerError) {
        let Outstanding { mut call, done } = *self;
        call.error = Some(error);
        done.deliver(call);
    }
}
