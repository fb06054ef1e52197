//! In-memory daemon.
//!
//! Plays the daemon side of an interception stream without a network: it
//! emits request/response/error frames for simulated RPC calls, waits for the
//! middleware's reply to each frame like the real daemon does, and records
//! every reply and every executed call for inspection.

use async_trait::async_trait;
use lngate_core::{
    DaemonCapabilities, DaemonReply, GateError, MessageId, RawFrame, RequestCategory, Result,
    RpcFailure,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::classifier::daemon_failure;
use crate::connector::{DaemonConnector, InterceptStream, MiddlewareRegistration};

type FrameSender = mpsc::UnboundedSender<Result<RawFrame>>;

/// A request the daemon actually executed, after any replacement
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCall {
    pub uri: String,
    pub payload: Value,
}

struct MemoryInner {
    capabilities: RwLock<DaemonCapabilities>,
    link: Mutex<Option<FrameSender>>,
    waiters: Mutex<HashMap<MessageId, oneshot::Sender<DaemonReply>>>,
    replies: Mutex<Vec<DaemonReply>>,
    executed: Mutex<Vec<ExecutedCall>>,
    outcomes: Mutex<HashMap<String, std::result::Result<Value, Value>>>,
    registrations: Mutex<Vec<MiddlewareRegistration>>,
    next_msg_id: AtomicU64,
    next_request_id: AtomicU64,
}

/// Scripted daemon for tests and offline replay
#[derive(Clone)]
pub struct MemoryDaemon {
    inner: Arc<MemoryInner>,
}

impl MemoryDaemon {
    pub fn new(capabilities: DaemonCapabilities) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                capabilities: RwLock::new(capabilities),
                link: Mutex::new(None),
                waiters: Mutex::new(HashMap::new()),
                replies: Mutex::new(Vec::new()),
                executed: Mutex::new(Vec::new()),
                outcomes: Mutex::new(HashMap::new()),
                registrations: Mutex::new(Vec::new()),
                next_msg_id: AtomicU64::new(1),
                next_request_id: AtomicU64::new(1),
            }),
        }
    }

    /// Answer calls to `uri` with `response`
    pub fn respond_with(&self, uri: impl Into<String>, response: Value) {
        self.inner.outcomes.lock().insert(uri.into(), Ok(response));
    }

    /// Fail calls to `uri` with the daemon error body `error`
    pub fn fail_with(&self, uri: impl Into<String>, error: Value) {
        self.inner.outcomes.lock().insert(uri.into(), Err(error));
    }

    pub fn set_capabilities(&self, capabilities: DaemonCapabilities) {
        *self.inner.capabilities.write() = capabilities;
    }

    /// A middleware stream is attached
    pub fn is_attached(&self) -> bool {
        self.inner
            .link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    /// Every reply received, in arrival order
    pub fn replies(&self) -> Vec<DaemonReply> {
        self.inner.replies.lock().clone()
    }

    /// Every call executed, in execution order
    pub fn executed(&self) -> Vec<ExecutedCall> {
        self.inner.executed.lock().clone()
    }

    pub fn registrations(&self) -> Vec<MiddlewareRegistration> {
        self.inner.registrations.lock().clone()
    }

    /// Drop the stream, reporting `cause` to the middleware
    pub fn terminate(&self, cause: GateError) {
        if let Some(link) = self.inner.link.lock().take() {
            tracing::debug!(cause = %cause, "Terminating interception stream");
            let _ = link.send(Err(cause));
        }
    }

    /// Close the stream cleanly
    pub fn close(&self) {
        self.inner.link.lock().take();
    }

    /// Send a recorded frame and wait for the middleware's reply
    pub async fn inject(&self, frame: RawFrame) -> Result<DaemonReply> {
        let link = self.link()?;
        self.round_trip(&link, frame).await
    }

    /// Simulate a caller invoking `uri`.
    ///
    /// Without an attached middleware the call executes directly. Otherwise
    /// the request frame is held for the middleware's reply, executed with
    /// any replaced payload, and its response or error frame is relayed too.
    pub async fn call(&self, uri: &str, payload: Value) -> std::result::Result<Value, RpcFailure> {
        let link = match self.link() {
            Ok(link) => link,
            Err(_) => return self.execute(uri, payload),
        };
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);

        let frame = RawFrame::request(self.next_msg_id(), request_id, uri, payload.clone());
        let payload = match self.round_trip(&link, frame).await.map_err(|e| e.to_failure())? {
            DaemonReply::Continue { .. } => payload,
            DaemonReply::Replace { payload, .. } => payload,
            DaemonReply::Reject { error, .. } => return Err(error),
        };

        let outcome = self.execute(uri, payload);
        let frame = match &outcome {
            Ok(response) => RawFrame::response(self.next_msg_id(), request_id, uri, response.clone()),
            Err(failure) => RawFrame::error(
                self.next_msg_id(),
                request_id,
                uri,
                failure.raw.clone().unwrap_or(Value::Null),
            ),
        };
        let reply = self.round_trip(&link, frame).await.map_err(|e| e.to_failure())?;

        match (outcome, reply) {
            (_, DaemonReply::Reject { error, .. }) => Err(error),
            (Ok(_), DaemonReply::Replace { payload, .. }) => Ok(payload),
            (outcome, _) => outcome,
        }
    }

    fn link(&self) -> Result<FrameSender> {
        self.inner
            .link
            .lock()
            .as_ref()
            .filter(|link| !link.is_closed())
            .cloned()
            .ok_or_else(|| GateError::StreamTerminated("no middleware attached".to_string()))
    }

    fn next_msg_id(&self) -> MessageId {
        self.inner.next_msg_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn round_trip(&self, link: &FrameSender, frame: RawFrame) -> Result<DaemonReply> {
        let msg_id = frame.msg_id;
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().insert(msg_id, tx);

        if link.send(Ok(frame)).is_err() {
            self.inner.waiters.lock().remove(&msg_id);
            return Err(GateError::StreamTerminated("middleware went away".to_string()));
        }

        tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| {
                GateError::StreamTerminated("reply never arrived".to_string())
            }),
            _ = link.closed() => {
                self.inner.waiters.lock().remove(&msg_id);
                Err(GateError::StreamTerminated("middleware went away".to_string()))
            }
        }
    }

    fn execute(&self, uri: &str, payload: Value) -> std::result::Result<Value, RpcFailure> {
        self.inner.executed.lock().push(ExecutedCall {
            uri: uri.to_string(),
            payload,
        });

        match self.inner.outcomes.lock().get(uri) {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(error)) => Err(daemon_failure(error)),
            None => Ok(Value::Object(Default::default())),
        }
    }
}

impl Default for MemoryDaemon {
    fn default() -> Self {
        Self::new(DaemonCapabilities::full("memory"))
    }
}

#[async_trait]
impl DaemonConnector for MemoryDaemon {
    async fn capabilities(&self) -> Result<DaemonCapabilities> {
        Ok(self.inner.capabilities.read().clone())
    }

    async fn connect(&self, registration: MiddlewareRegistration) -> Result<InterceptStream> {
        self.inner
            .capabilities
            .read()
            .require(RequestCategory::Generic)?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<DaemonReply>();

        tracing::debug!(
            middleware = %registration.name,
            categories = ?registration.categories,
            "Middleware registered"
        );
        self.inner.registrations.lock().push(registration);
        *self.inner.link.lock() = Some(frames_tx);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(reply) = replies_rx.recv().await {
                inner.replies.lock().push(reply.clone());
                let waiter = inner.waiters.lock().remove(&reply.msg_id());
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => tracing::warn!(msg_id = reply.msg_id(), "Reply for unknown message"),
                }
            }
        });

        Ok(InterceptStream {
            frames: frames_rx,
            replies: replies_tx,
        })
    }
}
