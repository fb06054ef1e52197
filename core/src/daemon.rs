//! Daemon capability reporting and failure mapping.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::GateError;
use crate::event::RequestCategory;

const CANNOT_CONNECT_MESSAGE: &str = "failed to connect to all addresses";
const CONNECT_FAIL_MESSAGE: &str = "14 UNAVAILABLE: channel is in state TRANSIENT_FAILURE";
const CONNECTION_FAILURE_MESSAGE: &str = "Connect Failed";
const LOCKED_MESSAGE: &str = "unknown service lnrpc.Lightning";
const UNIMPLEMENTED_MESSAGE: &str = "12 UNIMPLEMENTED";
const UNKNOWN_METHOD_MESSAGE: &str = "unknown method";

/// What the connected daemon version can do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonCapabilities {
    /// Daemon version string
    pub version: String,
    /// Daemon exposes an interception stream at all
    pub supports_interception: bool,
    /// Privileged categories the daemon can hold for a decision
    pub interceptable: HashSet<RequestCategory>,
    /// Daemon assigns alias ids for trusted-funding channels
    pub supports_aliases: bool,
}

impl DaemonCapabilities {
    /// Daemon with interception of every privileged category
    pub fn full(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            supports_interception: true,
            interceptable: RequestCategory::PRIVILEGED.into_iter().collect(),
            supports_aliases: true,
        }
    }

    /// Daemon predating the interception stream
    pub fn legacy(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            supports_interception: false,
            interceptable: HashSet::new(),
            supports_aliases: false,
        }
    }

    pub fn can_intercept(&self, category: RequestCategory) -> bool {
        self.supports_interception && self.interceptable.contains(&category)
    }

    /// Fail fast when interception is unavailable for `category`
    pub fn require(&self, category: RequestCategory) -> crate::Result<()> {
        if !self.supports_interception {
            return Err(GateError::Unsupported(
                "BackingDaemonDoesNotSupportRpcInterception".to_string(),
            ));
        }
        if category.is_privileged() && !self.interceptable.contains(&category) {
            return Err(GateError::Unsupported(format!(
                "BackingDaemonDoesNotSupport{}Interception",
                category.label()
            )));
        }
        Ok(())
    }
}

impl Default for DaemonCapabilities {
    fn default() -> Self {
        Self::full("unknown")
    }
}

/// Map a raw daemon or transport failure onto a stable condition.
///
/// `details` is the daemon's error details string; `message` the transport
/// status message when the details are empty.
pub fn map_daemon_failure(details: &str, message: &str) -> GateError {
    if details == LOCKED_MESSAGE {
        return GateError::DaemonLocked;
    }

    if details == CANNOT_CONNECT_MESSAGE
        || details == CONNECTION_FAILURE_MESSAGE
        || message == CONNECT_FAIL_MESSAGE
    {
        return GateError::DaemonUnreachable("FailedToConnectToDaemon".to_string());
    }

    if message.starts_with(UNIMPLEMENTED_MESSAGE) || details.starts_with(UNKNOWN_METHOD_MESSAGE) {
        return GateError::Unsupported(format!("MethodNotSupported: {}", details));
    }

    GateError::DaemonError {
        message: if message.is_empty() {
            details.to_string()
        } else {
            message.to_string()
        },
        details: if details.is_empty() {
            None
        } else {
            Some(details.to_string())
        },
    }
}
