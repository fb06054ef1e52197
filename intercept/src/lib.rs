//! RPC interception for a payment-channel node daemon.
//!
//! ```text
//! daemon --frames--> InterceptorHub --classify--> subscriptions
//!    ^                    |                            |
//!    |                    v                            v
//!    +----replies---- DecisionGate <---accept/reject---+
//! ```
//!
//! The hub reads the daemon's interception stream on one task. Generic
//! request/response/error events reach every subscription; open, close and
//! pay-via-route requests are held by the [`DecisionGate`] until one
//! interested subscription decides, and pass straight through when no
//! subscription declared interest.

pub mod classifier;
pub mod connector;
pub mod gate;
pub mod hub;
pub mod memory;
pub mod payloads;
pub mod subscription;

pub use classifier::{category_for_uri, classify, ClassifiedFrame};
pub use connector::{DaemonConnector, InterceptStream, MiddlewareRegistration};
pub use gate::{
    DecisionGate, DecisionHandle, DecisionOutcome, DecisionReceipt, DecisionState,
    DecisionTicket, PendingDecision, ReplySequencer, WITHDRAWN_MESSAGE,
};
pub use hub::{HubStats, InterceptorHub};
pub use memory::{ExecutedCall, MemoryDaemon};
pub use payloads::{
    CloseChannelRequest, Hop, OpenChannelRequest, PayViaRouteRequest, PrivilegedView, Route,
};
pub use subscription::{
    EventHandler, InterceptedRpc, ObservedError, ObservedResponse, SubscribeOptions,
    Subscription, SubscriptionEvent,
};
