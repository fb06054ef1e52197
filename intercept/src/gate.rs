//! Decision gate.
//!
//! Holds privileged requests until exactly one interested subscription
//! accepts or rejects them, and relays every reply on the stream back to the
//! daemon in the order the frames arrived.
//!
//! Each frame reserves a sequence number when it is read. Replies fill their
//! slot whenever they are ready; the [`ReplySequencer`] only releases a slot
//! once every earlier slot has been released, so a late decision never lets
//! later replies overtake it.

use chrono::{DateTime, Utc};
use lngate_channels::ChannelIdentityResolver;
use lngate_core::{
    CorrelationKey, DaemonCapabilities, DaemonReply, GateError, InterceptedRequest, MessageId,
    RequestCategory, Result, RpcFailure,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::payloads::requests_trusted_funding;

/// Message the RPC caller sees when every interested party left
pub const WITHDRAWN_MESSAGE: &str = "RpcInterceptorUnsubscribed";

/// Position of a frame in the reply order
pub type ReplySeq = u64;

type OutcomeSender = oneshot::Sender<DecisionOutcome>;

// ============================================================================
// Reply sequencing
// ============================================================================

#[derive(Debug)]
enum Slot {
    Reply(DaemonReply),
    /// The daemon settles this frame itself
    Skip,
}

struct SequencerState {
    next_seq: ReplySeq,
    next_flush: ReplySeq,
    slots: BTreeMap<ReplySeq, Slot>,
    waiters: HashMap<ReplySeq, oneshot::Sender<Result<()>>>,
    sink: Option<mpsc::UnboundedSender<DaemonReply>>,
}

impl SequencerState {
    fn flush(&mut self) {
        while let Some(slot) = self.slots.remove(&self.next_flush) {
            let seq = self.next_flush;
            self.next_flush += 1;

            let sent = match (slot, &self.sink) {
                (Slot::Skip, _) => Ok(()),
                (Slot::Reply(reply), Some(sink)) => sink.send(reply).map_err(|_| {
                    GateError::StreamTerminated("daemon stopped reading replies".to_string())
                }),
                (Slot::Reply(_), None) => Err(GateError::StreamTerminated(
                    "reply sink closed".to_string(),
                )),
            };
            if sent.is_err() {
                self.sink = None;
            }

            tracing::trace!(seq, ok = sent.is_ok(), "Released reply slot");
            if let Some(waiter) = self.waiters.remove(&seq) {
                let _ = waiter.send(sent);
            }
        }
    }
}

/// Per-stream reply ordering
pub struct ReplySequencer {
    state: Mutex<SequencerState>,
}

impl ReplySequencer {
    pub fn new(sink: mpsc::UnboundedSender<DaemonReply>) -> Self {
        Self {
            state: Mutex::new(SequencerState {
                next_seq: 0,
                next_flush: 0,
                slots: BTreeMap::new(),
                waiters: HashMap::new(),
                sink: Some(sink),
            }),
        }
    }

    /// Reserve the next slot; call once per frame, in arrival order
    pub fn reserve(&self) -> ReplySeq {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Fill `seq`. `None` releases the slot without sending anything.
    ///
    /// The returned receiver resolves once the slot has been released to the
    /// daemon, which may be long after this call if earlier slots are open.
    pub fn submit(&self, seq: ReplySeq, reply: Option<DaemonReply>) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();

        if state.sink.is_none() {
            let _ = tx.send(Err(GateError::StreamTerminated(
                "reply sink closed".to_string(),
            )));
            return rx;
        }
        if seq >= state.next_seq || seq < state.next_flush || state.slots.contains_key(&seq) {
            let _ = tx.send(Err(GateError::validation(
                "seq",
                format!("reply slot {} is not open", seq),
            )));
            return rx;
        }

        state.slots.insert(seq, reply.map_or(Slot::Skip, Slot::Reply));
        state.waiters.insert(seq, tx);
        state.flush();
        rx
    }

    /// Stop relaying; waiters on unreleased slots fail
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.sink = None;
        state.slots.clear();
        for (_, waiter) in state.waiters.drain() {
            let _ = waiter.send(Err(GateError::StreamTerminated(
                "interception stream closed".to_string(),
            )));
        }
    }

    /// Filled slots waiting on an earlier one
    pub fn backlog(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().sink.is_none()
    }
}

// ============================================================================
// Pending decisions
// ============================================================================

/// Pending decision state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Open,
    Accepted,
    Rejected,
    Expired,
}

impl std::fmt::Display for DecisionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionState::Open => write!(f, "open"),
            DecisionState::Accepted => write!(f, "accepted"),
            DecisionState::Rejected => write!(f, "rejected"),
            DecisionState::Expired => write!(f, "expired"),
        }
    }
}

/// How a decision ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    Accepted { by: String, replaced: bool },
    Rejected { by: String, reason: String },
    /// Every interested subscription left; the request was auto-rejected
    Withdrawn,
    /// Nobody decided before the daemon deadline, or the stream ended
    Expired,
}

#[derive(Debug)]
struct DecisionInner {
    state: DecisionState,
    offered_to: HashSet<String>,
    outcome_tx: Option<OutcomeSender>,
}

/// A privileged request held for a decision
#[derive(Debug)]
pub struct PendingDecision {
    request: Arc<InterceptedRequest>,
    seq: ReplySeq,
    offered_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    inner: Mutex<DecisionInner>,
}

impl PendingDecision {
    pub fn request(&self) -> &Arc<InterceptedRequest> {
        &self.request
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        self.request.correlation_key
    }

    pub fn msg_id(&self) -> MessageId {
        self.request.msg_id
    }

    pub fn seq(&self) -> ReplySeq {
        self.seq
    }

    pub fn offered_at(&self) -> DateTime<Utc> {
        self.offered_at
    }

    /// When the daemon stops waiting and applies its own default
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn state(&self) -> DecisionState {
        self.inner.lock().state
    }

    /// Subscriptions still holding this decision, sorted
    pub fn offered_to(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().offered_to.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Open -> `next` on behalf of subscription `by`
    fn begin(&self, by: &str, next: DecisionState) -> Result<Option<OutcomeSender>> {
        let mut inner = self.inner.lock();
        if !inner.offered_to.contains(by) {
            return Err(GateError::DecisionWithdrawn {
                correlation_key: self.correlation_key(),
            });
        }
        match inner.state {
            DecisionState::Open => {}
            DecisionState::Expired => {
                return Err(GateError::DecisionExpired {
                    correlation_key: self.correlation_key(),
                    uri: self.request.uri.clone(),
                })
            }
            state => {
                return Err(GateError::AlreadyResolved {
                    correlation_key: self.correlation_key(),
                    state: state.to_string(),
                })
            }
        }
        inner.state = next;
        Ok(inner.outcome_tx.take())
    }

    /// Open -> `next` with nobody deciding; `None` if already settled
    fn settle(&self, next: DecisionState) -> Option<Option<OutcomeSender>> {
        let mut inner = self.inner.lock();
        if inner.state != DecisionState::Open {
            return None;
        }
        inner.state = next;
        Some(inner.outcome_tx.take())
    }

    /// Forget `subscription_id`; true when nobody is left to decide
    fn remove_party(&self, subscription_id: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.offered_to.remove(subscription_id)
            && inner.offered_to.is_empty()
            && inner.state == DecisionState::Open
    }
}

/// Resolves with the decision outcome
#[derive(Debug)]
pub struct DecisionTicket {
    correlation_key: CorrelationKey,
    outcome: oneshot::Receiver<DecisionOutcome>,
}

impl DecisionTicket {
    pub fn correlation_key(&self) -> CorrelationKey {
        self.correlation_key
    }
}

impl Future for DecisionTicket {
    type Output = DecisionOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(DecisionOutcome::Expired))
    }
}

/// Result of a successful accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionReceipt {
    pub correlation_key: CorrelationKey,
    /// Payload was replaced by overrides
    pub replaced: bool,
    /// Alias allocated for an accepted trusted-funding open
    pub alias: Option<String>,
}

// ============================================================================
// Decision gate
// ============================================================================

/// Arbitrates decisions for one interception stream
pub struct DecisionGate {
    sequencer: ReplySequencer,
    pending: Mutex<HashMap<CorrelationKey, Arc<PendingDecision>>>,
    capabilities: DaemonCapabilities,
    daemon_timeout: Duration,
    resolver: Option<Arc<ChannelIdentityResolver>>,
}

impl DecisionGate {
    pub fn new(
        sink: mpsc::UnboundedSender<DaemonReply>,
        capabilities: DaemonCapabilities,
        daemon_timeout: Duration,
    ) -> Self {
        Self {
            sequencer: ReplySequencer::new(sink),
            pending: Mutex::new(HashMap::new()),
            capabilities,
            daemon_timeout,
            resolver: None,
        }
    }

    /// Allocate aliases for accepted trusted-funding opens
    pub fn with_resolver(mut self, resolver: Arc<ChannelIdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn capabilities(&self) -> &DaemonCapabilities {
        &self.capabilities
    }

    pub fn reserve(&self) -> ReplySeq {
        self.sequencer.reserve()
    }

    /// Let a frame through unchanged
    pub fn pass_through(&self, seq: ReplySeq, msg_id: MessageId) {
        drop(self.sequencer.submit(seq, Some(DaemonReply::Continue { msg_id })));
    }

    /// Reject a privileged request that cannot be offered for a decision
    pub fn refuse(&self, seq: ReplySeq, request: &InterceptedRequest, error: &GateError) {
        tracing::warn!(
            uri = %request.uri,
            correlation_key = request.correlation_key,
            error = %error,
            "Refusing privileged request"
        );
        drop(self.sequencer.submit(
            seq,
            Some(DaemonReply::Reject {
                msg_id: request.msg_id,
                error: RpcFailure::for_rejection(
                    request.category.rejection_wrapper(),
                    error.to_string(),
                ),
            }),
        ));
    }

    /// Accept a privileged request nobody intercepts
    pub fn auto_accept(&self, seq: ReplySeq, request: &InterceptedRequest) -> Option<String> {
        let alias = self.propose_alias(request.category, &request.payload);
        tracing::debug!(
            uri = %request.uri,
            correlation_key = request.correlation_key,
            "No interested subscription, passing request through"
        );
        self.pass_through(seq, request.msg_id);
        alias
    }

    /// Hold `request` for a decision by one of `offered_to`
    pub fn offer(
        &self,
        seq: ReplySeq,
        request: Arc<InterceptedRequest>,
        offered_to: impl IntoIterator<Item = String>,
    ) -> Result<(Arc<PendingDecision>, DecisionTicket)> {
        self.capabilities.require(request.category)?;
        if !request.category.is_privileged() {
            return Err(GateError::validation(
                "category",
                "generic requests are never held",
            ));
        }

        let offered_to: HashSet<String> = offered_to.into_iter().collect();
        if offered_to.is_empty() {
            return Err(GateError::validation(
                "offered_to",
                "a decision needs at least one interested subscription",
            ));
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let offered_at = Utc::now();
        let deadline = offered_at
            + chrono::Duration::from_std(self.daemon_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(1));
        let correlation_key = request.correlation_key;

        let decision = Arc::new(PendingDecision {
            request,
            seq,
            offered_at,
            deadline,
            inner: Mutex::new(DecisionInner {
                state: DecisionState::Open,
                offered_to,
                outcome_tx: Some(outcome_tx),
            }),
        });

        self.pending
            .lock()
            .insert(correlation_key, Arc::clone(&decision));

        tracing::debug!(
            correlation_key,
            seq,
            uri = %decision.request.uri,
            parties = decision.offered_to().len(),
            "Holding request for decision"
        );

        Ok((
            decision,
            DecisionTicket {
                correlation_key,
                outcome: outcome_rx,
            },
        ))
    }

    /// Accept on behalf of `by`, optionally replacing payload fields.
    ///
    /// Resolves once the reply has been released to the daemon.
    pub async fn accept(
        &self,
        decision: &Arc<PendingDecision>,
        by: &str,
        overrides: Option<Map<String, Value>>,
    ) -> Result<DecisionReceipt> {
        let outcome_tx = decision.begin(by, DecisionState::Accepted)?;
        self.pending.lock().remove(&decision.correlation_key());

        let request = decision.request();
        let (reply, replacement) = match overrides.filter(|overrides| !overrides.is_empty()) {
            None => (
                DaemonReply::Continue {
                    msg_id: request.msg_id,
                },
                None,
            ),
            Some(overrides) => {
                let payload = merge_overrides(&request.payload, overrides);
                (
                    DaemonReply::Replace {
                        msg_id: request.msg_id,
                        payload: payload.clone(),
                    },
                    Some(payload),
                )
            }
        };
        let replaced = matches!(reply, DaemonReply::Replace { .. });

        tracing::info!(
            correlation_key = decision.correlation_key(),
            uri = %request.uri,
            subscription_id = %by,
            replaced,
            "Request accepted"
        );
        if let Some(tx) = outcome_tx {
            let _ = tx.send(DecisionOutcome::Accepted {
                by: by.to_string(),
                replaced,
            });
        }

        self.relay(decision.seq, reply).await?;

        // only an open the daemon actually received gets an alias
        let alias = self.propose_alias(
            request.category,
            replacement.as_ref().unwrap_or(&request.payload),
        );
        Ok(DecisionReceipt {
            correlation_key: decision.correlation_key(),
            replaced,
            alias,
        })
    }

    /// Reject on behalf of `by`; the RPC caller's failure message is `reason`
    pub async fn reject(&self, decision: &Arc<PendingDecision>, by: &str, reason: &str) -> Result<()> {
        let outcome_tx = decision.begin(by, DecisionState::Rejected)?;
        self.pending.lock().remove(&decision.correlation_key());

        let request = decision.request();
        tracing::info!(
            correlation_key = decision.correlation_key(),
            uri = %request.uri,
            subscription_id = %by,
            reason,
            "Request rejected"
        );
        if let Some(tx) = outcome_tx {
            let _ = tx.send(DecisionOutcome::Rejected {
                by: by.to_string(),
                reason: reason.to_string(),
            });
        }

        let reply = DaemonReply::Reject {
            msg_id: request.msg_id,
            error: RpcFailure::for_rejection(request.category.rejection_wrapper(), reason),
        };
        self.relay(decision.seq, reply).await
    }

    /// Stop offering decisions to `subscription_id`.
    ///
    /// Decisions left with nobody to decide are auto-rejected. Returns their
    /// correlation keys.
    pub fn withdraw(&self, subscription_id: &str) -> Vec<CorrelationKey> {
        let decisions: Vec<Arc<PendingDecision>> = self.pending.lock().values().cloned().collect();
        let mut rejected = Vec::new();

        for decision in decisions {
            if !decision.remove_party(subscription_id) {
                continue;
            }
            let Some(outcome_tx) = decision.settle(DecisionState::Rejected) else {
                continue;
            };
            self.pending.lock().remove(&decision.correlation_key());

            let request = decision.request();
            tracing::warn!(
                correlation_key = decision.correlation_key(),
                uri = %request.uri,
                subscription_id,
                "Last interested subscription left, rejecting held request"
            );
            if let Some(tx) = outcome_tx {
                let _ = tx.send(DecisionOutcome::Withdrawn);
            }
            drop(self.sequencer.submit(
                decision.seq,
                Some(DaemonReply::Reject {
                    msg_id: request.msg_id,
                    error: RpcFailure::for_rejection(
                        request.category.rejection_wrapper(),
                        WITHDRAWN_MESSAGE,
                    ),
                }),
            ));
            rejected.push(decision.correlation_key());
        }

        rejected.sort_unstable();
        rejected
    }

    /// Mark an undecided request expired; the daemon answers it itself
    pub fn expire(&self, correlation_key: CorrelationKey) -> Option<Arc<PendingDecision>> {
        let decision = self.pending.lock().get(&correlation_key).cloned()?;
        let outcome_tx = decision.settle(DecisionState::Expired)?;
        self.pending.lock().remove(&correlation_key);

        if let Some(tx) = outcome_tx {
            let _ = tx.send(DecisionOutcome::Expired);
        }
        drop(self.sequencer.submit(decision.seq, None));
        Some(decision)
    }

    /// Expire everything still open and stop relaying replies
    pub fn expire_all(&self) -> Vec<Arc<PendingDecision>> {
        let drained: Vec<Arc<PendingDecision>> =
            self.pending.lock().drain().map(|(_, decision)| decision).collect();

        let mut expired = Vec::new();
        for decision in drained {
            if let Some(outcome_tx) = decision.settle(DecisionState::Expired) {
                if let Some(tx) = outcome_tx {
                    let _ = tx.send(DecisionOutcome::Expired);
                }
                expired.push(decision);
            }
        }

        self.sequencer.close();
        expired
    }

    pub fn get(&self, correlation_key: CorrelationKey) -> Option<Arc<PendingDecision>> {
        self.pending.lock().get(&correlation_key).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn relay(&self, seq: ReplySeq, reply: DaemonReply) -> Result<()> {
        self.sequencer
            .submit(seq, Some(reply))
            .await
            .map_err(|_| GateError::StreamTerminated("reply sequencer dropped".to_string()))?
    }

    fn propose_alias(&self, category: RequestCategory, payload: &Value) -> Option<String> {
        if category != RequestCategory::OpenChannel || !requests_trusted_funding(payload) {
            return None;
        }
        let alias = self.resolver.as_ref()?.propose(true)?;
        tracing::info!(alias = %alias, "Trusted-funding open accepted");
        Some(alias)
    }
}

/// Shallow merge of `overrides` into a request payload
pub fn merge_overrides(payload: &Value, overrides: Map<String, Value>) -> Value {
    let mut merged = match payload {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    };
    merged.extend(overrides);
    Value::Object(merged)
}

// ============================================================================
// Decision handle
// ============================================================================

/// One subscription's bound accept/reject actions for one decision
#[derive(Clone)]
pub struct DecisionHandle {
    gate: Arc<DecisionGate>,
    decision: Arc<PendingDecision>,
    subscription_id: String,
}

impl DecisionHandle {
    pub fn new(
        gate: Arc<DecisionGate>,
        decision: Arc<PendingDecision>,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            decision,
            subscription_id: subscription_id.into(),
        }
    }

    pub fn decision(&self) -> &Arc<PendingDecision> {
        &self.decision
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub async fn accept(&self, overrides: Option<Map<String, Value>>) -> Result<DecisionReceipt> {
        self.gate
            .accept(&self.decision, &self.subscription_id, overrides)
            .await
    }

    pub async fn reject(&self, reason: &str) -> Result<()> {
        self.gate
            .reject(&self.decision, &self.subscription_id, reason)
            .await
    }
}

impl std::fmt::Debug for DecisionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionHandle")
            .field("correlation_key", &self.decision.correlation_key())
            .field("state", &self.decision.state())
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}
