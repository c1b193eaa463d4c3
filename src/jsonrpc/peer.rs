use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use super::call::{done_channel, CallHandle, DoneSender, Outstanding};
use super::codec::{JsonLineCodec, WireCodec};
use super::error::{CloseReason, PeerError, Result};
use super::handler::{HandlerRegistry, NotificationHandler};
use super::message::{InboundPayload, OutgoingCall, NOTIFICATION_ID};
use super::pending::PendingCalls;
use crate::config::PeerConfig;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the peer and its reader task
struct Shared {
    // 送信側の排他制御（ID採番と書き込みを同じロックで行う）
    writer: Mutex<BoxedWriter>,
    pending: PendingCalls,
    handlers: HandlerRegistry,
    codec: Arc<dyn WireCodec>,
    handler_permits: Option<Arc<Semaphore>>,
}

/// Bidirectional RPC peer over one line-oriented duplex stream.
///
/// Outgoing calls are correlated with inbound responses by ID; inbound
/// notifications are dispatched to handlers registered with [`Peer::handle`].
/// A single background task owns the read side for the lifetime of the peer.
pub struct Peer {
    shared: Arc<Shared>,
    config: PeerConfig,
    reader_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
}

impl Peer {
    /// Create a peer speaking one JSON value per line.
    ///
    /// Must be called from within a tokio runtime: the reader loop is spawned
    /// immediately.
    pub fn new<R, W>(reader: R, writer: W, config: PeerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_codec(reader, writer, JsonLineCodec, config)
    }

    /// Create a peer with a custom wire codec
    pub fn with_codec<R, W, C>(reader: R, writer: W, codec: C, config: PeerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        C: WireCodec,
    {
        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            pending: PendingCalls::new(),
            handlers: HandlerRegistry::new(),
            codec: Arc::new(codec),
            handler_permits: config
                .max_concurrent_handlers
                .map(|limit| Arc::new(Semaphore::new(limit))),
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(None);

        let reader_handle = tokio::spawn(Self::reader_task(
            shared.clone(),
            reader,
            shutdown_rx,
            closed_tx,
            config.exit_on_protocol_error,
        ));

        Self {
            shared,
            config,
            reader_handle: Some(reader_handle),
            shutdown_tx: Some(shutdown_tx),
            closed_rx,
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Register (or replace) the handler for notifications named `method`
    pub fn handle<H: NotificationHandler>(&self, method: impl Into<String>, handler: H) {
        let method = method.into();
        if self.shared.handlers.register(method.clone(), Arc::new(handler)) {
            log::debug!("Replaced notification handler for {}", method);
        }
    }

    /// Send a call and return without waiting for the reply.
    ///
    /// The finished [`Call`](super::call::Call) is delivered to `done`, or to
    /// a channel of `config.done_capacity` owned by the returned handle when
    /// `done` is `None`. Local failures (serialization, write errors, closed
    /// connection) are reported through that same completion, never here.
    pub fn call<P, R>(
        &self,
        method: &str,
        params: P,
        done: Option<DoneSender<R>>,
    ) -> impl Future<Output = CallHandle<R>> + Send + '_
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, receiver) = match done {
            Some(done) => (done, None),
            None => {
                let (done, receiver) = done_channel(self.config.done_capacity);
                (done, Some(receiver))
            }
        };
        let method = method.to_string();
        let params = serde_json::to_value(params);

        async move {
            let id = self.shared.send_call(method.clone(), params, done).await;
            CallHandle::new(id, method, receiver)
        }
    }

    /// Send a call and wait for its reply
    pub async fn call_sync<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, mut receiver) = done_channel(1);
        self.call(method, params, Some(done)).await;

        match receiver.recv().await {
            Some(call) => call.into_result(),
            None => Err(PeerError::Closed(
                self.close_reason().unwrap_or(CloseReason::Shutdown),
            )),
        }
    }

    /// Send a notification (no `id` on the wire, no reply expected)
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let params = serde_json::to_value(params)?;
        if let Some(reason) = self.shared.pending.close_reason() {
            return Err(PeerError::Closed(reason));
        }

        let mut writer = self.shared.writer.lock().await;
        self.shared
            .write_message(&mut writer, &OutgoingCall::notification(method, params))
            .await
    }

    /// Number of calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Why the read side stopped, if it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed_rx.borrow().clone()
    }

    /// Wait until the read side stops
    pub async fn closed(&self) -> CloseReason {
        let mut closed_rx = self.closed_rx.clone();
        loop {
            let current = closed_rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if closed_rx.changed().await.is_err() {
                return closed_rx.borrow().clone().unwrap_or(CloseReason::Shutdown);
            }
        }
    }

    /// Gracefully shutdown: close the outbound stream, stop the reader and
    /// fail outstanding calls
    pub async fn shutdown(mut self) -> Result<()> {
        log::info!("Shutting down peer");

        let write_result = {
            let mut writer = self.shared.writer.lock().await;
            writer.shutdown().await
        };

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.reader_handle.take() {
            if let Err(e) = handle.await {
                log::error!("Reader task join error: {}", e);
            }
        }

        write_result.map_err(PeerError::from)
    }

    async fn reader_task<R>(
        shared: Arc<Shared>,
        reader: R,
        shutdown_rx: oneshot::Receiver<()>,
        closed_tx: watch::Sender<Option<CloseReason>>,
        exit_on_protocol_error: bool,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        log::debug!("Starting reader loop");
        let reason = shared.read_loop(reader, shutdown_rx).await;

        match &reason {
            CloseReason::StreamEnded => log::info!("Inbound stream reached EOF"),
            CloseReason::Shutdown => log::debug!("Reader loop stopped by shutdown"),
            CloseReason::Transport(e) => log::error!("Error reading inbound stream: {}", e),
            CloseReason::Protocol(e) => log::error!("Protocol violation from remote peer: {}", e),
        }

        let failed = shared.pending.close(reason.clone());
        if failed > 0 {
            log::warn!("Failed {} pending calls: {}", failed, reason);
        }
        let _ = closed_tx.send(Some(reason.clone()));

        if exit_on_protocol_error && matches!(reason, CloseReason::Protocol(_)) {
            std::process::exit(1);
        }
        log::debug!("Reader loop stopped");
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.take() {
            log::debug!("Peer dropped, aborting reader loop");
            handle.abort();
        }
    }
}

impl Shared {
    /// Allocate an ID, register the call and write it, all under the send lock
    /// so that ID order equals wire order.
    async fn send_call<R>(
        &self,
        method: String,
        params: serde_json::Result<Value>,
        done: DoneSender<R>,
    ) -> u64
    where
        R: DeserializeOwned + Send + 'static,
    {
        let mut writer = self.writer.lock().await;

        let (params, encode_error) = match params {
            Ok(params) => (params, None),
            Err(e) => (Value::Null, Some(PeerError::from(e))),
        };

        let entry = Box::new(Outstanding::new(method.clone(), params.clone(), done));
        let Some(id) = self.pending.register(entry) else {
            log::debug!("Peer is closed, call {} was not sent", method);
            return NOTIFICATION_ID;
        };

        let result = match encode_error {
            Some(e) => Err(e),
            None => {
                self.write_message(&mut writer, &OutgoingCall::new(id, method.as_str(), params))
                    .await
            }
        };

        if let Err(e) = result {
            log::error!("Failed to send call {} ({}): {}", id, method, e);
            if let Some(entry) = self.pending.take(id) {
                entry.fail(e);
            }
        }

        id
    }

    async fn write_message(&self, writer: &mut BoxedWriter, message: &OutgoingCall) -> Result<()> {
        let frame = self.codec.encode(message)?;
        log::debug!("Sending: {}", String::from_utf8_lossy(&frame).trim_end());

        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_loop<R>(&self, reader: R, mut shutdown_rx: oneshot::Receiver<()>) -> CloseReason
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = &mut shutdown_rx => return CloseReason::Shutdown,
                read = reader.read_until(b'\n', &mut line) => read,
            };

            match read {
                Ok(0) => return CloseReason::StreamEnded,
                Ok(_) => {
                    if let Err(e) = self.dispatch_line(trim_line_ending(&line)) {
                        return CloseReason::Protocol(e.to_string());
                    }
                }
                Err(e) => return CloseReason::Transport(e.to_string()),
            }
        }
    }

    /// Route one inbound line. An error is a protocol violation.
    fn dispatch_line(&self, line: &[u8]) -> Result<()> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        log::debug!("Received: {}", String::from_utf8_lossy(line));

        match self.codec.decode(line)?.classify() {
            InboundPayload::Response { id, result } => match self.pending.take(id) {
                Some(entry) => entry.complete(result)?,
                None => log::warn!(
                    "Dropping response {} that does not have a corresponding pending call",
                    id
                ),
            },
            InboundPayload::Notification { method, params } => match self.handlers.get(&method) {
                Some(handler) => self.spawn_handler(handler, params),
                None => log::debug!(
                    "Dropping notification because there is no handler for {} registered",
                    method
                ),
            },
            InboundPayload::Unroutable { id } => log::warn!(
                "Dropping message (id {:?}) that has neither a result nor a method",
                id
            ),
        }
        Ok(())
    }

    fn spawn_handler(&self, handler: Arc<dyn NotificationHandler>, params: Value) {
        let permits = self.handler_permits.clone();
        tokio::spawn(async move {
            let _permit = match permits {
                Some(permits) => match permits.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            handler.on_notification(params).await;
        });
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
