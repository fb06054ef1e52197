//! Interceptor hub.
//!
//! Owns at most one interception stream per connector and fans its frames
//! out to subscriptions. Frames are read and dispatched by a single task, in
//! stream order; decisions run on the subscriptions' own handler tasks and
//! never block that loop.

use dashmap::DashMap;
use lngate_channels::ChannelIdentityResolver;
use lngate_core::{
    CorrelationKey, DaemonCapabilities, GateError, InterceptConfig, InterceptedRequest,
    RawFrame, RequestCategory, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::classifier::{classify, daemon_failure, ClassifiedFrame};
use crate::connector::{DaemonConnector, MiddlewareRegistration};
use crate::gate::{DecisionGate, DecisionHandle, DecisionOutcome, DecisionTicket, ReplySeq};
use crate::payloads::PrivilegedView;
use crate::subscription::{
    InterceptedRpc, ObservedError, ObservedResponse, SubscribeOptions, Subscription,
    SubscriptionEvent,
};

/// Hub statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    /// A stream is attached
    pub active: bool,
    /// Registered subscriptions
    pub subscriptions: usize,
    /// Requests seen without a final response or error yet
    pub in_flight_requests: usize,
    /// Privileged requests held for a decision
    pub pending_decisions: usize,
    /// Frames read since the hub was created
    pub frames_seen: u64,
    /// Privileged requests passed through for lack of interest
    pub auto_accepted: u64,
}

struct StreamLink {
    gate: Arc<DecisionGate>,
    capabilities: DaemonCapabilities,
    task: JoinHandle<()>,
}

struct HubShared {
    connector: Arc<dyn DaemonConnector>,
    config: InterceptConfig,
    resolver: Option<Arc<ChannelIdentityResolver>>,
    subscriptions: DashMap<String, Subscription>,
    link: Mutex<Option<StreamLink>>,
    active: AtomicBool,
    in_flight: DashMap<CorrelationKey, Arc<InterceptedRequest>>,
    frames_seen: AtomicU64,
    auto_accepted: AtomicU64,
}

/// Interceptor hub
#[derive(Clone)]
pub struct InterceptorHub {
    shared: Arc<HubShared>,
}

impl InterceptorHub {
    /// Create a hub; nothing connects until the first subscription
    pub fn new(connector: Arc<dyn DaemonConnector>, config: InterceptConfig) -> Self {
        Self::build(connector, config, None)
    }

    /// Create a hub that allocates aliases for accepted trusted-funding opens
    pub fn with_resolver(
        connector: Arc<dyn DaemonConnector>,
        config: InterceptConfig,
        resolver: Arc<ChannelIdentityResolver>,
    ) -> Self {
        Self::build(connector, config, Some(resolver))
    }

    fn build(
        connector: Arc<dyn DaemonConnector>,
        config: InterceptConfig,
        resolver: Option<Arc<ChannelIdentityResolver>>,
    ) -> Self {
        Self {
            shared: Arc::new(HubShared {
                connector,
                config,
                resolver,
                subscriptions: DashMap::new(),
                link: Mutex::new(None),
                active: AtomicBool::new(false),
                in_flight: DashMap::new(),
                frames_seen: AtomicU64::new(0),
                auto_accepted: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscription, opening the stream if none is attached.
    ///
    /// Fails fast with `Unsupported` when the daemon cannot intercept at all
    /// or cannot intercept one of the declared categories.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription> {
        let interests = options.interests();
        let id = options
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.shared.subscriptions.contains_key(&id) {
            return Err(GateError::validation(
                "id",
                format!("subscription {} already exists", id),
            ));
        }

        let mut link = self.shared.link.lock().await;

        let capabilities = match link.as_ref() {
            Some(link) => link.capabilities.clone(),
            None => self.shared.connector.capabilities().await?,
        };
        capabilities.require(RequestCategory::Generic)?;
        for category in &interests {
            capabilities.require(*category)?;
        }

        if link.is_none() {
            *link = Some(self.connect(capabilities).await?);
        }

        let subscription = Subscription::start(id.clone(), interests);
        self.shared
            .subscriptions
            .insert(id.clone(), subscription.clone());

        tracing::info!(
            subscription_id = %id,
            interests = ?subscription.interests(),
            "Subscribed to interception stream"
        );
        Ok(subscription)
    }

    /// Detach a subscription. The last one out tears the stream down.
    ///
    /// Safe to call from inside the subscription's own handlers.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        if self
            .shared
            .subscriptions
            .remove(subscription.id())
            .is_none()
        {
            return Ok(());
        }
        subscription.close();

        let mut link = self.shared.link.lock().await;
        if let Some(current) = link.as_ref() {
            let rejected = current.gate.withdraw(subscription.id());
            tracing::info!(
                subscription_id = %subscription.id(),
                auto_rejected = rejected.len(),
                "Unsubscribed from interception stream"
            );
        }

        if self.shared.subscriptions.is_empty() {
            if let Some(previous) = link.take() {
                previous.gate.expire_all();
                previous.task.abort();
                self.shared.active.store(false, Ordering::SeqCst);
                self.shared.in_flight.clear();
                tracing::info!("Last subscription left, interception stream closed");
            }
        }
        Ok(())
    }

    /// Capabilities of the attached daemon
    pub async fn capabilities(&self) -> Result<DaemonCapabilities> {
        self.shared
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.capabilities.clone())
            .ok_or(GateError::HubInactive)
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn subscription(&self, id: &str) -> Option<Subscription> {
        self.shared
            .subscriptions
            .get(id)
            .map(|entry| entry.value().clone())
    }

    /// Get hub statistics
    pub async fn stats(&self) -> HubStats {
        let pending_decisions = self
            .shared
            .link
            .lock()
            .await
            .as_ref()
            .map_or(0, |link| link.gate.pending_count());

        HubStats {
            active: self.is_active(),
            subscriptions: self.shared.subscriptions.len(),
            in_flight_requests: self.shared.in_flight.len(),
            pending_decisions,
            frames_seen: self.shared.frames_seen.load(Ordering::SeqCst),
            auto_accepted: self.shared.auto_accepted.load(Ordering::SeqCst),
        }
    }

    async fn connect(&self, capabilities: DaemonCapabilities) -> Result<StreamLink> {
        let registration =
            MiddlewareRegistration::for_capabilities(&self.shared.config.middleware_name, &capabilities);
        let stream = self.shared.connector.connect(registration).await?;

        let mut gate = DecisionGate::new(
            stream.replies,
            capabilities.clone(),
            self.shared.config.daemon_timeout(),
        );
        if let Some(resolver) = &self.shared.resolver {
            gate = gate.with_resolver(Arc::clone(resolver));
        }
        let gate = Arc::new(gate);

        self.shared.active.store(true, Ordering::SeqCst);
        tracing::info!(
            middleware = %self.shared.config.middleware_name,
            version = %capabilities.version,
            "Interception stream attached"
        );

        let task = tokio::spawn(run_stream(
            Arc::clone(&self.shared),
            Arc::clone(&gate),
            stream.frames,
        ));
        Ok(StreamLink {
            gate,
            capabilities,
            task,
        })
    }
}

// ============================================================================
// Stream loop
// ============================================================================

async fn run_stream(
    shared: Arc<HubShared>,
    gate: Arc<DecisionGate>,
    mut frames: mpsc::UnboundedReceiver<Result<RawFrame>>,
) {
    let cause = loop {
        match frames.recv().await {
            Some(Ok(frame)) => dispatch(&shared, &gate, frame),
            Some(Err(e)) => break e.to_string(),
            None => break "daemon closed the interception stream".to_string(),
        }
    };

    tracing::warn!(cause = %cause, "Interception stream terminated");

    // Teardown runs under the link lock so no subscribe interleaves with it
    let mut link = shared.link.lock().await;
    shared.active.store(false, Ordering::SeqCst);
    let expired = gate.expire_all();
    shared.in_flight.clear();

    let failure = GateError::StreamTerminated(cause);
    let subscriptions = live_subscriptions(&shared);
    shared.subscriptions.clear();
    for subscription in subscriptions {
        subscription.deliver(SubscriptionEvent::Error(ObservedError::from_error(
            None, None, &failure,
        )));
        subscription.deactivate();
    }
    if !expired.is_empty() {
        tracing::error!(count = expired.len(), "Held requests abandoned by stream termination");
    }

    if link
        .as_ref()
        .is_some_and(|current| Arc::ptr_eq(&current.gate, &gate))
    {
        link.take();
    }
}

fn live_subscriptions(shared: &HubShared) -> Vec<Subscription> {
    shared
        .subscriptions
        .iter()
        .map(|entry| entry.value().clone())
        .filter(Subscription::is_active)
        .collect()
}

fn broadcast(shared: &HubShared, event: SubscriptionEvent) {
    for subscription in live_subscriptions(shared) {
        subscription.deliver(event.clone());
    }
}

/// Classify one frame, reply to it, and fan it out
fn dispatch(shared: &Arc<HubShared>, gate: &Arc<DecisionGate>, frame: RawFrame) {
    shared.frames_seen.fetch_add(1, Ordering::SeqCst);
    let seq = gate.reserve();

    match classify(frame) {
        ClassifiedFrame::Request(request) => {
            tracing::debug!(
                uri = %request.uri,
                correlation_key = request.correlation_key,
                category = %request.category,
                seq,
                "Request frame"
            );
            let request = request.shared();
            shared
                .in_flight
                .insert(request.correlation_key, Arc::clone(&request));
            broadcast(shared, SubscriptionEvent::Request(Arc::clone(&request)));

            if request.category.is_privileged() {
                hold(shared, gate, seq, request);
            } else {
                gate.pass_through(seq, request.msg_id);
            }
        }
        ClassifiedFrame::Response {
            uri,
            correlation_key,
            msg_id,
            is_stream,
            payload,
        } => {
            tracing::debug!(uri = %uri, correlation_key, seq, "Response frame");
            gate.pass_through(seq, msg_id);

            let request = if is_stream {
                shared
                    .in_flight
                    .get(&correlation_key)
                    .map(|entry| Arc::clone(entry.value()))
            } else {
                shared
                    .in_flight
                    .remove(&correlation_key)
                    .map(|(_, request)| request)
            };
            broadcast(
                shared,
                SubscriptionEvent::Response(ObservedResponse {
                    uri,
                    correlation_key,
                    msg_id,
                    response: payload,
                    request,
                }),
            );
        }
        ClassifiedFrame::Error {
            uri,
            correlation_key,
            msg_id,
            error,
        } => {
            tracing::debug!(uri = %uri, correlation_key, seq, "Error frame");
            gate.pass_through(seq, msg_id);
            shared.in_flight.remove(&correlation_key);

            broadcast(
                shared,
                SubscriptionEvent::Error(ObservedError {
                    uri: Some(uri),
                    correlation_key: Some(correlation_key),
                    failure: daemon_failure(&error),
                }),
            );
        }
    }
}

/// Offer a privileged request to interested subscriptions, or let it through
/// when nobody is interested
fn hold(shared: &Arc<HubShared>, gate: &Arc<DecisionGate>, seq: ReplySeq, request: Arc<InterceptedRequest>) {
    let interested: Vec<Subscription> = live_subscriptions(shared)
        .into_iter()
        .filter(|subscription| subscription.is_interested(request.category))
        .collect();

    if interested.is_empty() || !gate.capabilities().can_intercept(request.category) {
        gate.auto_accept(seq, &request);
        shared.auto_accepted.fetch_add(1, Ordering::SeqCst);
        return;
    }
    offer_to(shared, gate, seq, request, interested);
}

/// Hold `request` for a decision by the `interested` snapshot
fn offer_to(
    shared: &Arc<HubShared>,
    gate: &Arc<DecisionGate>,
    seq: ReplySeq,
    request: Arc<InterceptedRequest>,
    interested: Vec<Subscription>,
) {
    let offered = PrivilegedView::parse(request.category, &request.payload)
        .and_then(|view| {
            view.ok_or_else(|| GateError::validation("category", "request is not privileged"))
        })
        .and_then(|view| {
            let ids = interested.iter().map(|subscription| subscription.id().to_string());
            gate.offer(seq, Arc::clone(&request), ids)
                .map(|(decision, ticket)| (view, decision, ticket))
        });
    let (view, decision, ticket) = match offered {
        Ok(offered) => offered,
        Err(e) => {
            gate.refuse(seq, &request, &e);
            forget(shared, &request);
            broadcast(
                shared,
                SubscriptionEvent::Error(ObservedError::from_error(
                    Some(request.uri.clone()),
                    Some(request.correlation_key),
                    &e,
                )),
            );
            return;
        }
    };

    for subscription in &interested {
        let handle = DecisionHandle::new(Arc::clone(gate), Arc::clone(&decision), subscription.id());
        let rpc = InterceptedRpc::new(Arc::clone(&request), view.clone(), handle);
        subscription.deliver(SubscriptionEvent::privileged(rpc));
    }

    // An unsubscribe between the snapshot and the offer found nothing to withdraw
    for subscription in interested.iter().filter(|s| !s.is_active()) {
        gate.withdraw(subscription.id());
    }

    tokio::spawn(watch_decision(
        Arc::clone(shared),
        Arc::clone(gate),
        request,
        ticket,
        interested,
    ));
}

/// Warn after the grace window, mark expired at the daemon deadline.
///
/// Requests that will never see a daemon response leave the in-flight table.
async fn watch_decision(
    shared: Arc<HubShared>,
    gate: Arc<DecisionGate>,
    request: Arc<InterceptedRequest>,
    mut ticket: DecisionTicket,
    offered_to: Vec<Subscription>,
) {
    let daemon_timeout = shared.config.daemon_timeout();
    let grace = shared.config.grace_window().min(daemon_timeout);

    tokio::select! {
        outcome = &mut ticket => return settled(&shared, &request, outcome),
        _ = tokio::time::sleep(grace) => {}
    }
    if grace < daemon_timeout {
        tracing::warn!(
            uri = %request.uri,
            correlation_key = request.correlation_key,
            waited_ms = grace.as_millis() as u64,
            "Privileged request still undecided"
        );
    }

    tokio::select! {
        outcome = &mut ticket => settled(&shared, &request, outcome),
        _ = tokio::time::sleep(daemon_timeout - grace) => {
            if gate.expire(request.correlation_key).is_none() {
                return;
            }
            forget(&shared, &request);
            tracing::error!(
                uri = %request.uri,
                correlation_key = request.correlation_key,
                "Nobody decided before the daemon deadline; the daemon applies its default"
            );
            let expired = GateError::DecisionExpired {
                correlation_key: request.correlation_key,
                uri: request.uri.clone(),
            };
            for subscription in offered_to.iter().filter(|s| s.is_active()) {
                subscription.deliver(SubscriptionEvent::Error(ObservedError::from_error(
                    Some(request.uri.clone()),
                    Some(request.correlation_key),
                    &expired,
                )));
            }
        }
    }
}

fn settled(shared: &HubShared, request: &Arc<InterceptedRequest>, outcome: DecisionOutcome) {
    tracing::debug!(
        uri = %request.uri,
        correlation_key = request.correlation_key,
        outcome = ?outcome,
        "Decision settled"
    );
    match outcome {
        // the daemon answers an accepted request with a response or error frame
        DecisionOutcome::Accepted { .. } => {}
        DecisionOutcome::Rejected { .. } | DecisionOutcome::Withdrawn | DecisionOutcome::Expired => {
            forget(shared, request);
        }
    }
}

/// Drop `request` from the in-flight table unless a newer request took its key
fn forget(shared: &HubShared, request: &Arc<InterceptedRequest>) {
    shared
        .in_flight
        .remove_if(&request.correlation_key, |_, tracked| Arc::ptr_eq(tracked, request));
}
