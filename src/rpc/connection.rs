//! Request/response correlation over one framed duplex channel.
//!
//! `RpcConnection` owns the live transport for one query server process:
//! requests go out with monotonically assigned IDs, a background dispatch
//! task reads every incoming frame and either resolves the matching pending
//! request or routes the notification to its registered handlers.
//!
//! Correlation guarantees:
//! - a response resolves at most one pending request, matched by ID;
//! - requests hit the wire in `send` order, responses may arrive in any order;
//! - cancellation is advisory: the pending entry stays in the table until the
//!   server actually answers, so an ID is never reused while the server may
//!   still reference it;
//! - when the server process exits, every pending request resolves with
//!   `WorkerCrashed` exactly once, and later sends fail with
//!   `ConnectionClosed` instead of hanging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use super::error::{RpcError, RpcResult};
use super::protocol::{
    codes, methods, CancelParams, Incoming, NotificationEnvelope, RequestEnvelope,
    ResponseEnvelope,
};
use super::transport::{FrameReader, FrameWriter};

type BoxedWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;
type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// A request that was sent and not yet resolved.
struct PendingRequest {
    method: String,
    tx: oneshot::Sender<RpcResult<Value>>,
}

struct Shared {
    writer: Mutex<BoxedWriter>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    handlers: Mutex<HashMap<String, Vec<NotificationHandler>>>,
    open: AtomicBool,
    next_id: AtomicU64,
}

/// The live transport + correlation layer bound to one server process.
pub struct RpcConnection {
    shared: Arc<Shared>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl RpcConnection {
    /// Bind a connection to a byte stream pair (the child's stdout/stdin in
    /// production, an in-memory duplex in tests) and start the dispatch task.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: Mutex::new(FrameWriter::new(
                Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        let dispatch_task = Self::spawn_dispatch_task(FrameReader::new(reader), shared.clone());

        Self {
            shared,
            dispatch_task,
        }
    }

    /// Send a request and wait for its response.
    pub async fn send(&self, method: &str, params: Value) -> RpcResult<Value> {
        self.send_with_token(method, params, &CancellationToken::new())
            .await
    }

    /// Send a request, forwarding `cancel` to the server as a best-effort
    /// cancellation notification if it fires while the request is pending.
    ///
    /// Cancellation is cooperative: the future still resolves only when the
    /// server (or the crash-detection path) produces a terminal response. A
    /// request the server acknowledges as cancelled resolves with
    /// [`RpcError::Cancelled`].
    pub async fn send_with_token(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> RpcResult<Value> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }

        let request = RequestEnvelope {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            method: method.to_string(),
            params,
        };
        let id = request.id;
        let payload = serde_json::to_vec(&request).map_err(RpcError::Serialize)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
        }

        // The server may have exited between the open check and the insert,
        // after the dispatch task already drained the table. Re-check so the
        // entry cannot be left behind unresolved.
        if !self.shared.open.load(Ordering::SeqCst) {
            self.shared.pending.lock().await.remove(&id);
            return Err(RpcError::ConnectionClosed);
        }

        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.write_frame(&payload).await {
                self.shared.pending.lock().await.remove(&id);
                return Err(RpcError::Write(e));
            }
        }

        let mut rx = rx;
        tokio::select! {
            resp = &mut rx => return Self::finish(resp),
            _ = cancel.cancelled() => {
                if let Err(e) = self.cancel(id).await {
                    tracing::debug!(id, error = %e, "could not send cancellation");
                }
            }
        }

        // Cancellation requested; keep waiting for the server's terminal
        // response (normally a CANCELLED error) so the ID stays reserved.
        Self::finish(rx.await)
    }

    fn finish(resp: Result<RpcResult<Value>, oneshot::error::RecvError>) -> RpcResult<Value> {
        match resp {
            Ok(outcome) => outcome,
            // Sender dropped without a response: the connection was torn down.
            Err(_) => Err(RpcError::WorkerCrashed),
        }
    }

    /// Send a fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Value) -> RpcResult<()> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }
        let envelope = NotificationEnvelope {
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_vec(&envelope).map_err(RpcError::Serialize)?;
        let mut writer = self.shared.writer.lock().await;
        writer.write_frame(&payload).await.map_err(RpcError::Write)
    }

    /// Send a best-effort cancellation for a pending request by ID.
    pub async fn cancel(&self, id: u64) -> RpcResult<()> {
        let params = serde_json::to_value(CancelParams { id }).map_err(RpcError::Serialize)?;
        self.notify(methods::CANCEL, params).await
    }

    /// Register a handler for an unsolicited notification method.
    ///
    /// Handlers for one method run synchronously, in registration order, for
    /// each notification in arrival order.
    pub async fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut handlers = self.shared.handlers.lock().await;
        handlers
            .entry(method.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Whether the connection can still carry requests.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst) && !self.dispatch_task.is_finished()
    }

    /// Close the connection: refuse further sends and shut down the write
    /// side, which signals EOF to the server. Idempotent.
    pub async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
    }

    fn spawn_dispatch_task(
        mut reader: FrameReader<impl AsyncRead + Send + Unpin + 'static>,
        shared: Arc<Shared>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => match serde_json::from_slice::<Incoming>(&frame) {
                        Ok(Incoming::Response(response)) => {
                            Self::dispatch_response(&shared, response).await;
                        }
                        Ok(Incoming::Notification(note)) => {
                            Self::dispatch_notification(&shared, note).await;
                        }
                        // Protocol violation, non-fatal: drop the message.
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed message from query server");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "query server transport read failed");
                        break;
                    }
                }
            }

            // Server is gone. Refuse new sends, then fail every request that
            // was still waiting -- each exactly once, via its oneshot.
            shared.open.store(false, Ordering::SeqCst);
            let mut pending = shared.pending.lock().await;
            for (id, request) in pending.drain() {
                tracing::debug!(id, method = %request.method, "failing request: server exited");
                let _ = request.tx.send(Err(RpcError::WorkerCrashed));
            }
        })
    }

    async fn dispatch_response(shared: &Shared, response: ResponseEnvelope) {
        let entry = shared.pending.lock().await.remove(&response.id);
        let Some(request) = entry else {
            // Protocol violation, non-fatal.
            tracing::warn!(id = response.id, "dropping response for unknown request id");
            return;
        };

        let outcome = match response.error {
            Some(error) if error.code == codes::CANCELLED => Err(RpcError::Cancelled),
            Some(error) => Err(RpcError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = request.tx.send(outcome);
    }

    async fn dispatch_notification(shared: &Shared, note: NotificationEnvelope) {
        let handlers: Vec<NotificationHandler> = {
            let map = shared.handlers.lock().await;
            map.get(&note.method).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            tracing::debug!(method = %note.method, "ignoring unhandled notification");
            return;
        }
        for handler in &handlers {
            handler(note.params.clone());
        }
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}
