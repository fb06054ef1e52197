//! Subscriptions and subscriber-facing events.
//!
//! Each subscription owns an unbounded queue fed by the hub's stream loop and
//! a task that runs its handlers one event at a time, so a slow handler never
//! stalls the stream and handlers see events in stream order.

use futures::future::BoxFuture;
use lngate_core::{
    CorrelationKey, EventName, GateError, InterceptedRequest, MessageId, RequestCategory, Result,
    RpcFailure,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::gate::{DecisionHandle, DecisionReceipt};
use crate::payloads::PrivilegedView;

// ============================================================================
// Options
// ============================================================================

/// What a new subscription intercepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeOptions {
    /// Identifies the subscription in logs; generated when absent
    pub id: Option<String>,
    pub intercept_open_channel: bool,
    pub intercept_close_channel: bool,
    pub intercept_pay_via_route: bool,
}

impl SubscribeOptions {
    /// Observe generic events only
    pub fn observe_only() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Also intercept `category`
    pub fn intercepting(mut self, category: RequestCategory) -> Self {
        match category {
            RequestCategory::OpenChannel => self.intercept_open_channel = true,
            RequestCategory::CloseChannel => self.intercept_close_channel = true,
            RequestCategory::PayViaRoute => self.intercept_pay_via_route = true,
            RequestCategory::Generic => {}
        }
        self
    }

    /// Declared privileged categories
    pub fn interests(&self) -> HashSet<RequestCategory> {
        [
            (RequestCategory::OpenChannel, self.intercept_open_channel),
            (RequestCategory::CloseChannel, self.intercept_close_channel),
            (RequestCategory::PayViaRoute, self.intercept_pay_via_route),
        ]
        .into_iter()
        .filter_map(|(category, wanted)| wanted.then_some(category))
        .collect()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Response observed for an earlier request
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedResponse {
    pub uri: String,
    pub correlation_key: CorrelationKey,
    pub msg_id: MessageId,
    pub response: Value,
    /// Request this answers, if it was seen
    pub request: Option<Arc<InterceptedRequest>>,
}

/// Failure observed on the stream or while dispatching
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedError {
    pub uri: Option<String>,
    pub correlation_key: Option<CorrelationKey>,
    pub failure: RpcFailure,
}

impl ObservedError {
    pub fn from_error(uri: Option<String>, correlation_key: Option<CorrelationKey>, err: &GateError) -> Self {
        Self {
            uri,
            correlation_key,
            failure: err.to_failure(),
        }
    }
}

/// Privileged request awaiting this subscription's decision
#[derive(Debug, Clone)]
pub struct InterceptedRpc {
    pub request: Arc<InterceptedRequest>,
    pub view: PrivilegedView,
    handle: DecisionHandle,
}

impl InterceptedRpc {
    pub fn new(request: Arc<InterceptedRequest>, view: PrivilegedView, handle: DecisionHandle) -> Self {
        Self {
            request,
            view,
            handle,
        }
    }

    pub fn payload(&self) -> &Value {
        &self.request.payload
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        self.request.correlation_key
    }

    /// Let the request proceed, optionally replacing payload fields
    pub async fn accept(&self, overrides: Option<Map<String, Value>>) -> Result<DecisionReceipt> {
        self.handle.accept(overrides).await
    }

    /// Fail the request; its caller sees `reason` as the message
    pub async fn reject(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.handle.reject(&reason).await
    }
}

/// Event delivered to subscription handlers
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Request(Arc<InterceptedRequest>),
    Response(ObservedResponse),
    Error(ObservedError),
    OpenChannelRequest(InterceptedRpc),
    CloseChannelRequest(InterceptedRpc),
    PayViaRouteRequest(InterceptedRpc),
}

impl SubscriptionEvent {
    /// Wrap a privileged request in the event for its category
    pub fn privileged(rpc: InterceptedRpc) -> Self {
        match rpc.view {
            PrivilegedView::OpenChannel(_) => SubscriptionEvent::OpenChannelRequest(rpc),
            PrivilegedView::CloseChannel(_) => SubscriptionEvent::CloseChannelRequest(rpc),
            PrivilegedView::PayViaRoute(_) => SubscriptionEvent::PayViaRouteRequest(rpc),
        }
    }

    pub fn name(&self) -> EventName {
        match self {
            SubscriptionEvent::Request(_) => EventName::Request,
            SubscriptionEvent::Response(_) => EventName::Response,
            SubscriptionEvent::Error(_) => EventName::Error,
            SubscriptionEvent::OpenChannelRequest(_) => EventName::OpenChannelRequest,
            SubscriptionEvent::CloseChannelRequest(_) => EventName::CloseChannelRequest,
            SubscriptionEvent::PayViaRouteRequest(_) => EventName::PayViaRouteRequest,
        }
    }

    pub fn intercepted(&self) -> Option<&InterceptedRpc> {
        match self {
            SubscriptionEvent::OpenChannelRequest(rpc)
            | SubscriptionEvent::CloseChannelRequest(rpc)
            | SubscriptionEvent::PayViaRouteRequest(rpc) => Some(rpc),
            _ => None,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Stored async event handler
pub type EventHandler = Arc<dyn Fn(SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct SubscriptionShared {
    id: String,
    interests: HashSet<RequestCategory>,
    active: AtomicBool,
    handlers: RwLock<HashMap<EventName, Vec<EventHandler>>>,
    queue: RwLock<Option<mpsc::UnboundedSender<SubscriptionEvent>>>,
}

/// One listener registration on the hub
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    /// Create a subscription and start its handler task
    pub(crate) fn start(id: String, interests: HashSet<RequestCategory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Self {
            shared: Arc::new(SubscriptionShared {
                id,
                interests,
                active: AtomicBool::new(true),
                handlers: RwLock::new(HashMap::new()),
                queue: RwLock::new(Some(tx)),
            }),
        };
        tokio::spawn(run_handlers(Arc::clone(&subscription.shared), rx));
        subscription
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn interests(&self) -> &HashSet<RequestCategory> {
        &self.shared.interests
    }

    pub fn is_interested(&self, category: RequestCategory) -> bool {
        self.shared.interests.contains(&category)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Attach a handler for `event`.
    ///
    /// Privileged events only reach subscriptions that declared the category,
    /// so attaching to an undeclared one is refused. Events dispatched before
    /// a handler is attached are not replayed.
    pub fn on<F, Fut>(&self, event: EventName, handler: F) -> Result<()>
    where
        F: Fn(SubscriptionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !event.is_generic() {
            let declared = RequestCategory::PRIVILEGED.into_iter().any(|category| {
                EventName::for_category(category) == Some(event) && self.is_interested(category)
            });
            if !declared {
                return Err(GateError::validation(
                    "event",
                    format!("subscription {} does not intercept {}", self.id(), event),
                ));
            }
        }

        let handler: EventHandler =
            Arc::new(move |event| -> BoxFuture<'static, ()> { Box::pin(handler(event)) });
        self.shared
            .handlers
            .write()
            .entry(event)
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Detach every handler for `event`
    pub fn off(&self, event: EventName) {
        self.shared.handlers.write().remove(&event);
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.read().values().map(Vec::len).sum()
    }

    /// Queue an event for the handler task
    pub(crate) fn deliver(&self, event: SubscriptionEvent) -> bool {
        match self.shared.queue.read().as_ref() {
            Some(queue) => queue.send(event).is_ok(),
            None => false,
        }
    }

    /// Stop routing to this subscription. Queued events still drain.
    pub(crate) fn deactivate(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.queue.write().take();
    }

    /// Deactivate and detach every handler
    pub(crate) fn close(&self) {
        self.deactivate();
        self.shared.handlers.write().clear();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("interests", &self.shared.interests)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn run_handlers(
    shared: Arc<SubscriptionShared>,
    mut rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
) {
    while let Some(event) = rx.recv().await {
        let handlers: Vec<EventHandler> = shared
            .handlers
            .read()
            .get(&event.name())
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(subscription_id = %shared.id, event = %event.name(), "No handler attached");
            continue;
        }
        for handler in handlers {
            handler(event.clone()).await;
        }
    }
    tracing::debug!(subscription_id = %shared.id, "Subscription handler task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn error_event(message: &str) -> SubscriptionEvent {
        SubscriptionEvent::Error(ObservedError {
            uri: None,
            correlation_key: None,
            failure: GateError::StreamTerminated(message.to_string()).to_failure(),
        })
    }

    #[test]
    fn test_options_interests() {
        let options = SubscribeOptions::observe_only()
            .with_id("watcher")
            .intercepting(RequestCategory::OpenChannel)
            .intercepting(RequestCategory::Generic);
        assert_eq!(options.id.as_deref(), Some("watcher"));
        assert_eq!(
            options.interests(),
            HashSet::from([RequestCategory::OpenChannel])
        );
        assert!(SubscribeOptions::default().interests().is_empty());
    }

    #[tokio::test]
    async fn test_undeclared_privileged_handler_refused() {
        let subscription = Subscription::start("s".to_string(), HashSet::new());
        let err = subscription
            .on(EventName::OpenChannelRequest, |_| async {})
            .unwrap_err();
        assert!(err.to_string().contains("open_channel_request"));
        assert!(subscription.on(EventName::Request, |_| async {}).is_ok());
        assert_eq!(subscription.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_handlers_run_in_order() {
        let subscription = Subscription::start("s".to_string(), HashSet::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscription
            .on(EventName::Error, move |event| {
                let tx = tx.clone();
                async move {
                    if let SubscriptionEvent::Error(error) = event {
                        let _ = tx.send(error.failure.message);
                    }
                }
            })
            .unwrap();

        assert!(subscription.deliver(error_event("one")));
        assert!(subscription.deliver(error_event("two")));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.ends_with("one"));
        assert!(second.ends_with("two"));
    }

    #[tokio::test]
    async fn test_closed_subscription_refuses_events() {
        let subscription = Subscription::start("s".to_string(), HashSet::new());
        subscription.on(EventName::Error, |_| async {}).unwrap();
        subscription.close();

        assert!(!subscription.is_active());
        assert_eq!(subscription.handler_count(), 0);
        assert!(!subscription.deliver(error_event("late")));
    }
}
