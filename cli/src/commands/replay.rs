//! `lngate replay` command - Feed recorded interception frames through the hub.
//!
//! The frames file holds one frame per line in the daemon's wire shape:
//!
//! ```text
//! {"msg_id": 1, "request_id": 1, "uri": "/lnrpc.Lightning/OpenChannel", "request": {...}}
//! {"msg_id": 2, "request_id": 1, "uri": "/lnrpc.Lightning/OpenChannel", "response": {...}}
//! ```
//!
//! A policy file decides privileged requests the way an operator's
//! subscriber would; without one every request is observed and let through.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use lngate_core::{EventName, GateConfig, InterceptConfig, RawFrame, RequestCategory};
use lngate_intercept::{
    HubStats, InterceptorHub, MemoryDaemon, PrivilegedView, SubscribeOptions, SubscriptionEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::input;
use crate::output::{self, ReplayRecord};

/// Quiet period after the last reply for queued events to reach the handlers
const SETTLE: Duration = Duration::from_millis(50);

const DEFAULT_REJECT_MESSAGE: &str = "RejectedByPolicy";

#[derive(Args)]
pub struct ReplayArgs {
    /// Recorded frames, one JSON frame per line
    #[arg(long)]
    pub frames: PathBuf,

    /// Decision policy (YAML)
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Print JSON lines instead of text
    #[arg(long)]
    pub json: bool,
}

/// Declarative decisions for privileged requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayPolicy {
    /// Reject opens that push tokens to the peer
    pub reject_gifted_opens: bool,
    /// Reject cooperative closes paying out to this address
    pub reject_close_to_address: Option<String>,
    /// Reject fee-free routes ending at this public key
    pub reject_zero_fee_routes_to: Option<String>,
    /// Message the rejected caller sees
    pub reject_message: Option<String>,
}

impl ReplayPolicy {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid policy {}", path.display()))
    }

    /// Intercept only what the policy has an opinion on
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            id: None,
            intercept_open_channel: self.reject_gifted_opens,
            intercept_close_channel: self.reject_close_to_address.is_some(),
            intercept_pay_via_route: self.reject_zero_fee_routes_to.is_some(),
        }
    }

    /// Rejection reason for `view`, or `None` to accept
    pub fn verdict(&self, view: &PrivilegedView) -> Option<String> {
        let reject = match view {
            PrivilegedView::OpenChannel(open) => {
                self.reject_gifted_opens && open.give_tokens.is_some()
            }
            PrivilegedView::CloseChannel(close) => {
                self.reject_close_to_address.is_some()
                    && close.address == self.reject_close_to_address
            }
            PrivilegedView::PayViaRoute(pay) => match &self.reject_zero_fee_routes_to {
                Some(destination) => {
                    pay.route.fee_mtokens == 0
                        && pay
                            .route
                            .final_hop()
                            .is_some_and(|hop| &hop.public_key == destination)
                }
                None => false,
            },
        };

        reject.then(|| {
            self.reject_message
                .clone()
                .unwrap_or_else(|| DEFAULT_REJECT_MESSAGE.to_string())
        })
    }
}

/// Everything a replay produced
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub records: Vec<ReplayRecord>,
    pub stats: HubStats,
}

impl ReplayReport {
    pub fn replies(&self) -> impl Iterator<Item = &lngate_core::DaemonReply> {
        self.records.iter().filter_map(|record| match record {
            ReplayRecord::Reply(reply) => Some(reply),
            ReplayRecord::Event { .. } => None,
        })
    }
}

/// Replay `frames` through a hub backed by the in-memory daemon
pub async fn replay(
    frames: Vec<RawFrame>,
    policy: &ReplayPolicy,
    config: InterceptConfig,
) -> anyhow::Result<ReplayReport> {
    let daemon = MemoryDaemon::default();
    let hub = InterceptorHub::new(Arc::new(daemon.clone()), config);
    let subscription = hub
        .subscribe(policy.subscribe_options().with_id("replay"))
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ReplayRecord>();

    for name in [EventName::Request, EventName::Response, EventName::Error] {
        let tx = tx.clone();
        subscription.on(name, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(ReplayRecord::from_event(&event));
            }
        })?;
    }

    let policy = Arc::new(policy.clone());
    for category in RequestCategory::PRIVILEGED {
        let Some(name) = EventName::for_category(category) else {
            continue;
        };
        if !subscription.is_interested(category) {
            continue;
        }
        let tx = tx.clone();
        let policy = Arc::clone(&policy);
        subscription.on(name, move |event: SubscriptionEvent| {
            let tx = tx.clone();
            let policy = Arc::clone(&policy);
            async move {
                let _ = tx.send(ReplayRecord::from_event(&event));
                let Some(rpc) = event.intercepted() else {
                    return;
                };
                let decided = match policy.verdict(&rpc.view) {
                    Some(reason) => rpc.reject(reason).await,
                    None => rpc.accept(None).await.map(|_| ()),
                };
                if let Err(e) = decided {
                    tracing::warn!(correlation_key = rpc.correlation_key(), error = %e, "Decision failed");
                }
            }
        })?;
    }

    for frame in frames {
        let msg_id = frame.msg_id;
        let reply = daemon
            .inject(frame)
            .await
            .with_context(|| format!("frame {} got no reply", msg_id))?;
        tx.send(ReplayRecord::Reply(reply))?;
    }
    drop(tx);

    let mut records = Vec::new();
    while let Ok(Some(record)) = tokio::time::timeout(SETTLE, rx.recv()).await {
        records.push(record);
    }

    let stats = hub.stats().await;
    hub.unsubscribe(&subscription).await?;
    Ok(ReplayReport { records, stats })
}

pub async fn execute(args: ReplayArgs, config: GateConfig) -> anyhow::Result<()> {
    let frames: Vec<RawFrame> = input::read_jsonl(&args.frames)?;
    let policy = match &args.policy {
        Some(path) => ReplayPolicy::from_file(path)?,
        None => ReplayPolicy::default(),
    };
    tracing::info!(frames = frames.len(), policy = ?policy, "Replaying interception frames");

    let report = replay(frames, &policy, config.intercept).await?;

    if args.json {
        for record in &report.records {
            output::print_json(record)?;
        }
        output::print_json(&serde_json::json!({ "kind": "stats", "stats": report.stats }))?;
        return Ok(());
    }

    for record in &report.records {
        println!("{record}");
    }
    println!();

    let mut table = output::new_table(&["FRAMES", "AUTO-ACCEPTED", "REJECTED", "PENDING"]);
    let rejected = report.replies().filter(|reply| reply.is_reject()).count();
    table.add_row([
        report.stats.frames_seen.to_string(),
        report.stats.auto_accepted.to_string(),
        rejected.to_string(),
        report.stats.pending_decisions.to_string(),
    ]);
    println!("{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lngate_intercept::{CloseChannelRequest, Hop, OpenChannelRequest, PayViaRouteRequest, Route};

    fn open(give_tokens: Option<u64>) -> PrivilegedView {
        PrivilegedView::OpenChannel(OpenChannelRequest {
            partner_public_key: "02".repeat(33),
            local_tokens: 1_000_000,
            give_tokens,
            is_private: false,
            is_trusted_funding: false,
            chain_fee_tokens_per_vbyte: None,
            base_fee_mtokens: None,
            fee_rate: None,
            cooperative_close_address: None,
        })
    }

    fn route_to(public_key: &str, fee_mtokens: u64) -> PrivilegedView {
        PrivilegedView::PayViaRoute(PayViaRouteRequest {
            id: "00".repeat(32),
            route: Route {
                fee_mtokens,
                mtokens: 1_000,
                timeout: 144,
                hops: vec![Hop {
                    channel: "1x1x1".to_string(),
                    public_key: public_key.to_string(),
                    fee_mtokens,
                    forward_mtokens: 1_000,
                    timeout: 144,
                }],
            },
        })
    }

    #[test]
    fn test_empty_policy_accepts_everything() {
        let policy = ReplayPolicy::default();
        assert_eq!(policy.verdict(&open(Some(5))), None);
        assert!(policy.subscribe_options().interests().is_empty());
    }

    #[test]
    fn test_gifted_open_rejected() {
        let policy = ReplayPolicy {
            reject_gifted_opens: true,
            reject_message: Some("message".to_string()),
            ..ReplayPolicy::default()
        };
        assert_eq!(policy.verdict(&open(Some(5))), Some("message".to_string()));
        assert_eq!(policy.verdict(&open(None)), None);
        assert!(policy.subscribe_options().intercept_open_channel);
    }

    #[test]
    fn test_close_address_rejected() {
        let policy = ReplayPolicy {
            reject_close_to_address: Some("bc1qexample".to_string()),
            ..ReplayPolicy::default()
        };
        let close = |address: Option<&str>| {
            PrivilegedView::CloseChannel(CloseChannelRequest {
                transaction_id: "00".repeat(32),
                transaction_vout: 0,
                address: address.map(str::to_string),
                is_force_close: false,
            })
        };
        assert_eq!(
            policy.verdict(&close(Some("bc1qexample"))).as_deref(),
            Some(DEFAULT_REJECT_MESSAGE)
        );
        assert_eq!(policy.verdict(&close(Some("bc1qother"))), None);
        assert_eq!(policy.verdict(&close(None)), None);
    }

    #[test]
    fn test_zero_fee_route_rejected() {
        let destination = "03".repeat(33);
        let policy = ReplayPolicy {
            reject_zero_fee_routes_to: Some(destination.clone()),
            ..ReplayPolicy::default()
        };
        assert!(policy.verdict(&route_to(&destination, 0)).is_some());
        assert!(policy.verdict(&route_to(&destination, 10)).is_none());
        assert!(policy.verdict(&route_to(&"02".repeat(33), 0)).is_none());
    }

    #[test]
    fn test_policy_yaml() {
        let policy: ReplayPolicy =
            serde_yaml::from_str("reject_gifted_opens: true\nreject_message: no gifts\n").unwrap();
        assert!(policy.reject_gifted_opens);
        assert_eq!(policy.reject_message.as_deref(), Some("no gifts"));
        assert!(policy.reject_close_to_address.is_none());
    }
}
