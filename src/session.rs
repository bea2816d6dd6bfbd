//! One live connection to one running backend.
//!
//! A session owns the subprocess, the request/response correlation table,
//! and the notification dispatch. A dedicated reader task consumes frames;
//! any number of callers issue `request`/`notify` concurrently. All pending
//! and lifecycle mutation happens under per-session locks; sessions never
//! contend with each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, Message, Notification, Request, Response};
use crate::transport::{read_frame, write_frame, BoxReader, BoxWriter, Connection, Connector,
    ProcessConnector};

/// Generous: servers index their workspace before answering `initialize`.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// `Starting → Initializing → Ready → ShuttingDown → Stopped`, with
/// `Crashed` reachable from any non-terminal state on unexpected process
/// exit or transport failure. No transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
    Crashed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Crashed)
    }
}

pub type NotificationHandler = Box<dyn Fn(Option<Value>) + Send + Sync>;

/// Handler for a backend-initiated request. `None` means the method is
/// refused and the backend receives a method-not-found error response.
pub type RequestHandler = Box<dyn Fn(Option<Value>) -> Option<Value> + Send + Sync>;

pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    writer: Mutex<BoxWriter>,
    child: Mutex<Option<Child>>,
    next_id: Mutex<i64>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value>>>>,
    notification_handlers: Mutex<HashMap<String, NotificationHandler>>,
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    /// Spawn the configured backend and begin reading its frames.
    pub async fn start(config: ClientConfig) -> Result<Session> {
        let connection = ProcessConnector.connect(&config).await?;
        Ok(Session::attach(config, connection))
    }

    /// Bind a session to an already-open connection. The reader task starts
    /// immediately.
    pub(crate) fn attach(config: ClientConfig, connection: Connection) -> Session {
        let Connection { writer, reader, child } = connection;
        let (state_tx, _) = watch::channel(SessionState::Starting);
        let inner = Arc::new(Inner {
            config,
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            next_id: Mutex::new(1),
            pending: Mutex::new(HashMap::new()),
            notification_handlers: Mutex::new(HashMap::new()),
            request_handlers: Mutex::new(HashMap::new()),
            state_tx,
        });
        tokio::spawn(run_reader(Arc::clone(&inner), reader));
        Session { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe lifecycle transitions; the supervisor's crash monitor hangs
    /// off this.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Run the `initialize`/`initialized` handshake with the given params.
    pub async fn initialize(&self, params: Value) -> Result<Value> {
        self.inner.transition(SessionState::Initializing);
        let result = self
            .request("initialize", Some(params), INITIALIZE_TIMEOUT)
            .await?;
        self.notify("initialized", Some(json!({}))).await?;
        self.inner.transition(SessionState::Ready);
        Ok(result)
    }

    /// Send a request and await its response. On timeout the pending entry
    /// is removed, a best-effort `$/cancelRequest` goes out, and any late
    /// response is discarded with a warning. No retry: requests are not
    /// safely idempotent in general.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.state().is_terminal() {
            return Err(Error::SessionClosed);
        }

        let id = {
            let mut next_id = self.inner.next_id.lock().await;
            let id = *next_id;
            *next_id = next_id.saturating_add(1);
            id
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        if let Err(err) = self.inner.write(&request).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Err(Error::Backend { code, .. })))
                if code == protocol::CODE_METHOD_NOT_FOUND =>
            {
                Err(Error::MethodNotFound(method.to_string()))
            }
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: the session closed underneath us.
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                let _ = self
                    .notify("$/cancelRequest", Some(json!({ "id": id })))
                    .await;
                Err(Error::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Fire-and-forget. Frames on one session share a single writer lock,
    /// so delivery order matches call order on that session.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = Notification::new(method, params);
        self.inner.write(&notification).await
    }

    /// Register the handler for an inbound notification method. Exactly one
    /// handler per method; re-registration silently replaces the previous.
    pub async fn on_notification(&self, method: &str, handler: NotificationHandler) {
        self.inner
            .notification_handlers
            .lock()
            .await
            .insert(method.to_string(), handler);
    }

    /// Register the responder for a backend-initiated request method.
    /// Unregistered methods are answered with a method-not-found error.
    pub async fn on_request(&self, method: &str, handler: RequestHandler) {
        self.inner
            .request_handlers
            .lock()
            .await
            .insert(method.to_string(), handler);
    }

    /// Graceful shutdown when the session is healthy (`shutdown` request
    /// then `exit`), force-kill otherwise. Always rejects all pending
    /// requests with `SessionClosed`.
    pub async fn stop(&self) {
        let healthy = self.state() == SessionState::Ready;
        if !self.inner.transition(SessionState::ShuttingDown) {
            return;
        }
        if healthy {
            let _ = self.request("shutdown", None, SHUTDOWN_TIMEOUT).await;
            let _ = self.notify("exit", None).await;
        }
        self.inner.close(SessionState::Stopped, "").await;
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl Inner {
    /// Apply a lifecycle transition; terminal states are never left.
    /// Returns whether the state changed.
    fn transition(&self, next: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    async fn write<T: Serialize>(&self, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &body).await
    }

    async fn close(&self, next: SessionState, reason: &str) {
        self.transition(next);
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
        // Half-close our side so the peer sees EOF; the reader task then
        // finishes on its own.
        let _ = self.writer.lock().await.shutdown().await;
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let outcome = if next == SessionState::Crashed {
                Err(Error::BackendCrashed(
                    self.config.name.clone(),
                    reason.to_string(),
                ))
            } else {
                Err(Error::SessionClosed)
            };
            let _ = tx.send(outcome);
        }
    }

    async fn resolve_response(&self, response: Response) {
        let tx = self.pending.lock().await.remove(&response.id);
        match tx {
            Some(tx) => {
                let outcome = match response.error {
                    Some(error) => Err(Error::Backend {
                        code: error.code,
                        message: error.message,
                    }),
                    // `"result": null` and an absent result both mean null.
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            None => warn!(
                "[{}] discarding late response for request {}",
                self.config.name, response.id
            ),
        }
    }

    async fn dispatch_notification(&self, notification: Notification) {
        let handlers = self.notification_handlers.lock().await;
        match handlers.get(&notification.method) {
            Some(handler) => handler(notification.params),
            None => debug!(
                "[{}] dropped notification {}",
                self.config.name, notification.method
            ),
        }
    }

    async fn answer_request(&self, request: Request) {
        let Request { id, method, params, .. } = request;
        let result = {
            let handlers = self.request_handlers.lock().await;
            handlers.get(&method).and_then(|handler| handler(params))
        };
        let response = match result {
            Some(value) => Response::success(id, value),
            None => {
                debug!("[{}] refusing backend request {method}", self.config.name);
                Response::method_not_found(id, &method)
            }
        };
        if let Err(err) = self.write(&response).await {
            warn!("[{}] failed to answer backend request: {err}", self.config.name);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

/// Reader task: one per session. Never blocked by callers; dispatches each
/// decoded frame. A transport or framing failure outside a deliberate
/// shutdown is a crash; partial protocol desync cannot be resynchronized.
async fn run_reader(inner: Arc<Inner>, mut reader: BoxReader) {
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(err) => break err,
        };
        let message = match protocol::parse_message(&frame) {
            Ok(message) => message,
            Err(err) => break err,
        };
        match message {
            Message::Response(response) => inner.resolve_response(response).await,
            Message::Notification(notification) => {
                inner.dispatch_notification(notification).await
            }
            Message::Request(request) => inner.answer_request(request).await,
        }
    };

    let state = *inner.state_tx.borrow();
    if matches!(state, SessionState::ShuttingDown | SessionState::Stopped) {
        debug!("[{}] reader finished: {reason}", inner.config.name);
        inner.close(SessionState::Stopped, "").await;
    } else {
        warn!("[{}] transport failed: {reason}", inner.config.name);
        inner.close(SessionState::Crashed, &reason.to_string()).await;
    }
}
