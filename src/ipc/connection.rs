//! A live JSON-RPC connection over one byte stream.
//!
//! `RpcConnection` owns two background tasks:
//!
//! - the **read loop**, which decodes frames in arrival order, resolves
//!   pending requests, hands notifications to the dispatcher and spawns one
//!   task per inbound request;
//! - the **writer task**, the only owner of the write half. Every outbound
//!   message is queued to it whole, so concurrent senders never interleave
//!   bytes and a caller that stops waiting cannot leave half a frame behind.
//!
//! A connection is never repaired in place. Once closed (EOF, read error or
//! [`RpcConnection::dispose`]) every outstanding request is rejected and the
//! owner builds a new connection.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcResult};
use crate::ipc::dispatch::{Dispatcher, InboundNotification};
use crate::ipc::framing::ContentLengthCodec;
use crate::ipc::message::Message;
use crate::ipc::pending::PendingRequests;

/// One queued outbound frame plus an optional write acknowledgement.
struct Outbound {
    payload: String,
    ack: Option<oneshot::Sender<RpcResult<()>>>,
}

/// State shared between the handle, the read loop and inbound request tasks.
struct Shared {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    pending: PendingRequests,
    dispatcher: Arc<Dispatcher>,
    /// `None` while open, `Some(reason)` once closed.
    closed_tx: watch::Sender<Option<String>>,
}

impl Shared {
    /// Mark the connection closed and reject everything still pending.
    fn close(&self, reason: &str) {
        let first = self.closed_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason.to_string());
                true
            } else {
                false
            }
        });
        self.pending.dispose(reason);
        if first {
            info!(reason, "RPC connection closed");
        }
    }

    fn closed_reason(&self) -> Option<String> {
        self.closed_tx.borrow().clone()
    }

    /// Queue a message and wait until it has been written and flushed.
    async fn write(&self, message: &Message) -> RpcResult<()> {
        if let Some(reason) = self.closed_reason() {
            return Err(RpcError::Disposed(reason));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound {
                payload: message.serialize(),
                ack: Some(ack_tx),
            })
            .map_err(|_| RpcError::Disposed("Writer task stopped".to_string()))?;

        match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Disposed(
                self.closed_reason()
                    .unwrap_or_else(|| "Writer task stopped".to_string()),
            )),
        }
    }

    /// Route one decoded payload. Runs on the read loop and never awaits.
    fn handle_payload(self: &Arc<Self>, payload: &str) {
        let message = match Message::parse(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping unparsable message");
                return;
            }
        };

        match message {
            Message::Response { id, result } => {
                self.pending.complete(&id, Ok(result));
            }
            Message::ErrorResponse { id, error } => {
                self.pending.complete(&id, Err(error.into()));
            }
            Message::Request { id, method, params } => {
                debug!(method = %method, id = %id, "Inbound request");
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    let reply = shared.dispatcher.handle_request(id, &method, params).await;
                    if let Err(e) = shared.write(&reply).await {
                        warn!(method = %method, error = %e, "Failed to send response");
                    }
                });
            }
            Message::Notification { method, params } => {
                self.dispatcher.handle_notification(&method, params);
            }
        }
    }
}

/// Handle to a running JSON-RPC connection.
///
/// Dropping the handle disposes the connection.
pub struct RpcConnection {
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<Option<String>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl RpcConnection {
    /// Start the read loop and writer task over a split stream.
    ///
    /// Must be called from within a tokio runtime. The dispatcher is fixed
    /// for the lifetime of the connection.
    pub fn start<R, W>(reader: R, writer: W, dispatcher: Dispatcher) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);

        let shared = Arc::new(Shared {
            outbound_tx,
            pending: PendingRequests::new(),
            dispatcher: Arc::new(dispatcher),
            closed_tx,
        });

        let write_task = tokio::spawn(write_loop(
            Arc::downgrade(&shared),
            FramedWrite::new(writer, ContentLengthCodec),
            outbound_rx,
        ));
        let read_task = tokio::spawn(read_loop(
            Arc::clone(&shared),
            FramedRead::new(reader, ContentLengthCodec),
        ));

        Self {
            shared,
            closed_rx,
            read_task,
            write_task,
        }
    }

    /// Send a request and wait for its response.
    ///
    /// No timeout is applied; see [`RpcConnection::send_request_with_timeout`].
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> RpcResult<Value> {
        let (id, rx) = self.shared.pending.register()?;
        let request = Message::request(id.clone(), method, params);

        debug!(method, id = %id, "Sending request");
        if let Err(e) = self.shared.write(&request).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Disposed(
                self.shared
                    .closed_reason()
                    .unwrap_or_else(|| "Result slot dropped".to_string()),
            )),
        }
    }

    /// Send a request, giving up after `limit`.
    ///
    /// On timeout the pending entry stays in the table until a late response
    /// arrives or the connection is disposed.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> RpcResult<Value> {
        match tokio::time::timeout(limit, self.send_request(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout(limit.as_millis() as u64)),
        }
    }

    /// Send a notification. Nothing is tracked and no reply is expected.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        debug!(method, "Sending notification");
        self.shared
            .write(&Message::notification(method, params))
            .await
    }

    /// Subscribe to every raw notification on this connection.
    pub fn notifications(&self) -> broadcast::Receiver<InboundNotification> {
        self.shared.dispatcher.subscribe()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_rx.borrow().is_some()
    }

    /// Wait until the connection closes, returning the reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "Connection dropped".to_string();
            }
        }
    }

    /// Tear the connection down, rejecting all outstanding requests.
    pub fn dispose(&self, reason: &str) {
        self.shared.close(reason);
        self.read_task.abort();
        self.write_task.abort();
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.dispose("Connection disposed");
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut frames: FramedRead<R, ContentLengthCodec>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match frames.next().await {
            Some(Ok(payload)) => shared.handle_payload(&payload),
            Some(Err(e)) => break format!("Read error: {}", e),
            None => break "Connection closed by server".to_string(),
        }
    };
    shared.close(&reason);
}

async fn write_loop<W>(
    shared: std::sync::Weak<Shared>,
    mut sink: FramedWrite<W, ContentLengthCodec>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(Outbound { payload, ack }) = outbound_rx.recv().await {
        let result = sink.send(payload).await;
        let failed = result.is_err();
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if failed {
            if let Some(shared) = shared.upgrade() {
                shared.close("Write failed");
            }
            break;
        }
    }
}
