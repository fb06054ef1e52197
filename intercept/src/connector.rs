//! Daemon connection seam.
//!
//! The hub never speaks the daemon's wire protocol itself. A connector
//! reports what the daemon can do and opens the duplex interception stream;
//! everything past that is plain frames and replies.

use async_trait::async_trait;
use lngate_core::{DaemonCapabilities, DaemonReply, RawFrame, RequestCategory, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// How the hub registers itself with the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareRegistration {
    /// Middleware name shown by the daemon
    pub name: String,
    /// Privileged categories the daemon should hold for a decision
    pub categories: Vec<RequestCategory>,
}

impl MiddlewareRegistration {
    /// Register for every privileged category the daemon supports
    pub fn for_capabilities(name: impl Into<String>, capabilities: &DaemonCapabilities) -> Self {
        Self {
            name: name.into(),
            categories: RequestCategory::PRIVILEGED
                .into_iter()
                .filter(|category| capabilities.can_intercept(*category))
                .collect(),
        }
    }
}

/// Duplex interception stream.
///
/// `frames` ends with `None` on a clean close, or yields an `Err` carrying
/// the cause when the daemon drops the stream. Replies must be sent in the
/// order the daemon expects them.
pub struct InterceptStream {
    pub frames: mpsc::UnboundedReceiver<Result<RawFrame>>,
    pub replies: mpsc::UnboundedSender<DaemonReply>,
}

/// Opens interception streams against a daemon
#[async_trait]
pub trait DaemonConnector: Send + Sync {
    /// Capabilities of the daemon version behind this connector
    async fn capabilities(&self) -> Result<DaemonCapabilities>;

    /// Register as middleware and open the stream
    async fn connect(&self, registration: MiddlewareRegistration) -> Result<InterceptStream>;
}
