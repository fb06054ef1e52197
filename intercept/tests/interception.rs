//! Interception scenarios driven through the in-memory daemon.

use lngate_channels::{ChannelIdentityResolver, IdentityState};
use lngate_core::{
    DaemonCapabilities, DaemonReply, ErrorCode, EventName, GateError, InterceptConfig,
    RequestCategory,
};
use lngate_intercept::{
    DecisionReceipt, InterceptorHub, MemoryDaemon, SubscribeOptions, Subscription,
    SubscriptionEvent, WITHDRAWN_MESSAGE,
};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const OPEN: &str = "/lnrpc.Lightning/OpenChannel";
const GET_INFO: &str = "/lnrpc.Lightning/GetInfo";

fn config() -> InterceptConfig {
    InterceptConfig {
        grace_window_ms: 50,
        daemon_timeout_ms: 10_000,
        ..InterceptConfig::default()
    }
}

fn setup() -> (MemoryDaemon, InterceptorHub) {
    let daemon = MemoryDaemon::default();
    let hub = InterceptorHub::new(Arc::new(daemon.clone()), config());
    (daemon, hub)
}

fn open_payload(push_sat: u64) -> Value {
    json!({
        "node_pubkey": hex::encode([2u8; 33]),
        "local_funding_amount": "1000000",
        "push_sat": push_sat.to_string()
    })
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("Timeout")
}

fn collect(subscription: &Subscription, name: EventName) -> mpsc::UnboundedReceiver<SubscriptionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    subscription
        .on(name, move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        })
        .unwrap();
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>) -> SubscriptionEvent {
    within(rx.recv()).await.expect("Channel closed")
}

fn intercepting(id: &str, category: RequestCategory) -> SubscribeOptions {
    SubscribeOptions::observe_only()
        .with_id(id)
        .intercepting(category)
}

// ============================================================================
// Generic observation
// ============================================================================

#[tokio::test]
async fn test_generic_events_reach_every_subscription() {
    let (daemon, hub) = setup();
    daemon.respond_with(GET_INFO, json!({"alias": "node"}));

    let observer = hub.subscribe(SubscribeOptions::observe_only()).await.unwrap();
    let interceptor = hub
        .subscribe(intercepting("opens", RequestCategory::OpenChannel))
        .await
        .unwrap();

    let mut observed = Vec::new();
    for subscription in [&observer, &interceptor] {
        observed.push((
            collect(subscription, EventName::Request),
            collect(subscription, EventName::Response),
        ));
    }

    let response = within(daemon.call(GET_INFO, json!({}))).await.unwrap();
    assert_eq!(response["alias"], "node");

    for (requests, responses) in observed.iter_mut() {
        match next(requests).await {
            SubscriptionEvent::Request(request) => {
                assert_eq!(request.uri, GET_INFO);
                assert_eq!(request.category, RequestCategory::Generic);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match next(responses).await {
            SubscriptionEvent::Response(response) => {
                assert_eq!(response.uri, GET_INFO);
                assert_eq!(response.response["alias"], "node");
                assert_eq!(
                    response.request.map(|request| request.correlation_key),
                    Some(response.correlation_key)
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    let stats = hub.stats().await;
    assert!(stats.active);
    assert_eq!(stats.subscriptions, 2);
    assert_eq!(stats.frames_seen, 2);
    assert_eq!(stats.in_flight_requests, 0);
}

#[tokio::test]
async fn test_daemon_errors_are_observed() {
    let (daemon, hub) = setup();
    daemon.fail_with(GET_INFO, json!({"details": "unknown service lnrpc.Lightning"}));

    let observer = hub.subscribe(SubscribeOptions::observe_only()).await.unwrap();
    let mut errors = collect(&observer, EventName::Error);

    let failure = within(daemon.call(GET_INFO, json!({}))).await.unwrap_err();
    assert_eq!(failure.condition, ErrorCode::DaemonLocked);

    match next(&mut errors).await {
        SubscriptionEvent::Error(error) => {
            assert_eq!(error.uri.as_deref(), Some(GET_INFO));
            assert!(error.correlation_key.is_some());
            assert_eq!(error.failure.condition, ErrorCode::DaemonLocked);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

// ============================================================================
// Decisions
// ============================================================================

#[tokio::test]
async fn test_reject_message_reaches_caller() {
    let (daemon, hub) = setup();
    let subscription = hub
        .subscribe(intercepting("stop channel give tokens", RequestCategory::OpenChannel))
        .await
        .unwrap();

    subscription
        .on(EventName::OpenChannelRequest, |event| async move {
            let Some(rpc) = event.intercepted() else {
                return;
            };
            let gifted = rpc
                .view
                .as_open_channel()
                .and_then(|open| open.give_tokens)
                .is_some();
            if gifted {
                rpc.reject("message").await.unwrap();
            } else {
                rpc.accept(None).await.unwrap();
            }
        })
        .unwrap();

    let failure = within(daemon.call(OPEN, open_payload(100_000)))
        .await
        .unwrap_err();
    assert_eq!(failure.message, "message");
    assert_eq!(failure.code, 503);
    assert_eq!(failure.raw.unwrap()["wrapper"], "FailedToOpenChannel");

    within(daemon.call(OPEN, open_payload(0))).await.unwrap();
    let executed = daemon.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].uri, OPEN);
}

#[tokio::test]
async fn test_first_decision_wins() {
    let (daemon, hub) = setup();
    let first = hub
        .subscribe(intercepting("first", RequestCategory::OpenChannel))
        .await
        .unwrap();
    let second = hub
        .subscribe(intercepting("second", RequestCategory::OpenChannel))
        .await
        .unwrap();
    let mut first_rx = collect(&first, EventName::OpenChannelRequest);
    let mut second_rx = collect(&second, EventName::OpenChannelRequest);

    let caller = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.call(OPEN, open_payload(0)).await })
    };

    let accepted = next(&mut first_rx).await;
    let rejected = next(&mut second_rx).await;
    let accepting = accepted.intercepted().unwrap();
    let rejecting = rejected.intercepted().unwrap();
    assert_eq!(accepting.correlation_key(), rejecting.correlation_key());

    within(accepting.accept(None)).await.unwrap();
    let err = within(rejecting.reject("too late")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DecisionConflict);
    assert_eq!(err.to_failure().code, 409);

    within(caller).await.unwrap().unwrap();
    assert_eq!(daemon.executed().len(), 1);
    assert!(!daemon.replies().iter().any(DaemonReply::is_reject));
}

#[tokio::test]
async fn test_accept_overrides_reach_daemon() {
    let (daemon, hub) = setup();
    let subscription = hub
        .subscribe(intercepting("fees", RequestCategory::OpenChannel))
        .await
        .unwrap();
    subscription
        .on(EventName::OpenChannelRequest, |event| async move {
            if let Some(rpc) = event.intercepted() {
                let mut overrides = Map::new();
                overrides.insert("fee_rate".to_string(), json!("250"));
                rpc.accept(Some(overrides)).await.unwrap();
            }
        })
        .unwrap();

    within(daemon.call(OPEN, open_payload(0))).await.unwrap();

    let executed = daemon.executed();
    assert_eq!(executed[0].payload["fee_rate"], "250");
    assert_eq!(executed[0].payload["local_funding_amount"], "1000000");
}

#[tokio::test]
async fn test_uninterested_privileged_request_auto_accepted() {
    let (daemon, hub) = setup();
    let observer = hub.subscribe(SubscribeOptions::observe_only()).await.unwrap();
    let closer = hub
        .subscribe(intercepting("closes", RequestCategory::CloseChannel))
        .await
        .unwrap();

    let refused = observer.on(EventName::OpenChannelRequest, |_| async {});
    assert!(refused.is_err());
    let mut requests = collect(&observer, EventName::Request);
    let mut closes = collect(&closer, EventName::CloseChannelRequest);

    within(daemon.call(OPEN, open_payload(0))).await.unwrap();

    match next(&mut requests).await {
        SubscriptionEvent::Request(request) => {
            assert_eq!(request.category, RequestCategory::OpenChannel)
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(closes.try_recv().is_err());
    assert_eq!(hub.stats().await.auto_accepted, 1);
    assert_eq!(daemon.executed().len(), 1);
}

#[tokio::test]
async fn test_malformed_privileged_request_rejected() {
    let (daemon, hub) = setup();
    let subscription = hub
        .subscribe(intercepting("opens", RequestCategory::OpenChannel))
        .await
        .unwrap();
    let mut errors = collect(&subscription, EventName::Error);
    let mut opens = collect(&subscription, EventName::OpenChannelRequest);

    let failure = within(daemon.call(OPEN, json!({"local_funding_amount": 5, "private": "true"})))
        .await
        .unwrap_err();
    assert_eq!(failure.raw.unwrap()["wrapper"], "FailedToOpenChannel");
    assert!(daemon.executed().is_empty());

    match next(&mut errors).await {
        SubscriptionEvent::Error(error) => {
            assert_eq!(error.failure.condition, ErrorCode::Validation);
            assert_eq!(error.uri.as_deref(), Some(OPEN));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(opens.try_recv().is_err());
    assert_eq!(hub.stats().await.in_flight_requests, 0);
}

#[tokio::test]
async fn test_rejected_requests_leave_in_flight_table() {
    let (daemon, hub) = setup();
    let subscription = hub
        .subscribe(intercepting("no opens", RequestCategory::OpenChannel))
        .await
        .unwrap();
    subscription
        .on(EventName::OpenChannelRequest, |event| async move {
            if let Some(rpc) = event.intercepted() {
                rpc.reject("no").await.unwrap();
            }
        })
        .unwrap();

    for _ in 0..3 {
        within(daemon.call(OPEN, open_payload(0))).await.unwrap_err();
    }

    within(async {
        loop {
            let stats = hub.stats().await;
            if stats.in_flight_requests == 0 {
                assert_eq!(stats.pending_decisions, 0);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(daemon.executed().is_empty());
}

#[tokio::test]
async fn test_trusted_funding_accept_allocates_alias() {
    let daemon = MemoryDaemon::default();
    let resolver = Arc::new(ChannelIdentityResolver::default());
    let hub = InterceptorHub::with_resolver(Arc::new(daemon.clone()), config(), Arc::clone(&resolver));

    let subscription = hub
        .subscribe(intercepting("zero conf", RequestCategory::OpenChannel))
        .await
        .unwrap();
    let (tx, mut receipts) = mpsc::unbounded_channel::<DecisionReceipt>();
    subscription
        .on(EventName::OpenChannelRequest, move |event| {
            let tx = tx.clone();
            async move {
                if let Some(rpc) = event.intercepted() {
                    assert!(rpc.view.as_open_channel().unwrap().is_trusted_funding);
                    let _ = tx.send(rpc.accept(None).await.unwrap());
                }
            }
        })
        .unwrap();

    let mut payload = open_payload(0);
    payload["zero_conf"] = json!(true);
    within(daemon.call(OPEN, payload)).await.unwrap();

    let receipt = within(receipts.recv()).await.unwrap();
    let alias = receipt.alias.expect("alias allocated");
    let identity = resolver.resolve(&alias).unwrap();
    assert_eq!(identity.state, IdentityState::TrustedFunded);
    assert!(identity.is_trusted_funding);
}

#[tokio::test]
async fn test_undecided_request_expires() {
    let daemon = MemoryDaemon::default();
    let config = InterceptConfig {
        grace_window_ms: 20,
        daemon_timeout_ms: 100,
        ..InterceptConfig::default()
    };
    let hub = InterceptorHub::new(Arc::new(daemon.clone()), config);
    let subscription = hub
        .subscribe(intercepting("idle", RequestCategory::OpenChannel))
        .await
        .unwrap();
    let mut opens = collect(&subscription, EventName::OpenChannelRequest);
    let mut errors = collect(&subscription, EventName::Error);

    let caller = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.call(OPEN, open_payload(0)).await })
    };
    let held = next(&mut opens).await;

    match next(&mut errors).await {
        SubscriptionEvent::Error(error) => {
            assert_eq!(error.failure.condition, ErrorCode::DecisionExpired)
        }
        other => panic!("unexpected event {:?}", other),
    }
    let err = held.intercepted().unwrap().accept(None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DecisionExpired);
    let stats = hub.stats().await;
    assert_eq!(stats.pending_decisions, 0);
    assert_eq!(stats.in_flight_requests, 0);

    // the daemon applies its own default; nothing was relayed for the request
    assert!(daemon.replies().is_empty());
    caller.abort();
}

// ============================================================================
// Subscription lifecycle
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_inside_handler_withdraws_decision() {
    let (daemon, hub) = setup();
    let _observer = hub.subscribe(SubscribeOptions::observe_only()).await.unwrap();
    let leaving = hub
        .subscribe(intercepting("leaving", RequestCategory::OpenChannel))
        .await
        .unwrap();

    {
        let hub = hub.clone();
        let handle = leaving.clone();
        leaving
            .on(EventName::OpenChannelRequest, move |_| {
                let hub = hub.clone();
                let handle = handle.clone();
                async move {
                    hub.unsubscribe(&handle).await.unwrap();
                }
            })
            .unwrap();
    }

    let failure = within(daemon.call(OPEN, open_payload(0))).await.unwrap_err();
    assert_eq!(failure.message, WITHDRAWN_MESSAGE);
    assert!(daemon.executed().is_empty());

    assert!(!leaving.is_active());
    assert_eq!(leaving.handler_count(), 0);
    let stats = hub.stats().await;
    assert!(stats.active);
    assert_eq!(stats.subscriptions, 1);
}

#[tokio::test]
async fn test_last_unsubscribe_closes_stream() {
    let (daemon, hub) = setup();
    let subscription = hub.subscribe(SubscribeOptions::observe_only()).await.unwrap();
    assert_eq!(daemon.registrations().len(), 1);
    assert_eq!(daemon.registrations()[0].name, "lngate");

    hub.unsubscribe(&subscription).await.unwrap();
    assert!(!hub.is_active());
    assert_eq!(hub.capabilities().await.unwrap_err().code(), ErrorCode::HubInactive);

    within(async {
        while daemon.is_attached() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    // unsubscribing twice is harmless
    hub.unsubscribe(&subscription).await.unwrap();
}

#[tokio::test]
async fn test_stream_termination_reports_error() {
    let (daemon, hub) = setup();
    let subscription = hub.subscribe(SubscribeOptions::observe_only()).await.unwrap();
    let mut errors = collect(&subscription, EventName::Error);

    daemon.terminate(GateError::DaemonUnreachable("FailedToConnectToDaemon".to_string()));

    match next(&mut errors).await {
        SubscriptionEvent::Error(error) => {
            assert_eq!(error.failure.condition, ErrorCode::StreamTerminated);
            assert!(error.failure.message.contains("FailedToConnectToDaemon"));
            assert!(error.uri.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!hub.is_active());
    assert!(!subscription.is_active());
    assert_eq!(hub.stats().await.subscriptions, 0);
}

#[tokio::test]
async fn test_duplicate_subscription_id_refused() {
    let (_daemon, hub) = setup();
    hub.subscribe(SubscribeOptions::observe_only().with_id("same"))
        .await
        .unwrap();
    let err = hub
        .subscribe(SubscribeOptions::observe_only().with_id("same"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Validation);
    assert!(hub.subscription("same").is_some());
}

// ============================================================================
// Capabilities
// ============================================================================

#[tokio::test]
async fn test_daemon_without_interception() {
    let daemon = MemoryDaemon::new(DaemonCapabilities::legacy("0.13.4-beta"));
    let hub = InterceptorHub::new(Arc::new(daemon.clone()), config());

    let err = hub
        .subscribe(SubscribeOptions::observe_only())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unsupported);
    assert_eq!(err.to_failure().code, 501);
    assert_eq!(
        err.to_string(),
        "Not supported: BackingDaemonDoesNotSupportRpcInterception"
    );
    assert!(daemon.registrations().is_empty());
}

#[tokio::test]
async fn test_daemon_without_category_support() {
    let mut capabilities = DaemonCapabilities::full("0.14.0-beta");
    capabilities.interceptable.remove(&RequestCategory::PayViaRoute);
    let daemon = MemoryDaemon::new(capabilities);
    let hub = InterceptorHub::new(Arc::new(daemon.clone()), config());

    let err = hub
        .subscribe(intercepting("routes", RequestCategory::PayViaRoute))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Not supported: BackingDaemonDoesNotSupportPayViaRouteInterception"
    );

    hub.subscribe(intercepting("opens", RequestCategory::OpenChannel))
        .await
        .unwrap();
    assert_eq!(
        daemon.registrations()[0].categories,
        vec![RequestCategory::OpenChannel, RequestCategory::CloseChannel]
    );
}
