use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable condition codes callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unsupported,
    Validation,
    DaemonUnreachable,
    DaemonLocked,
    DaemonError,
    DecisionConflict,
    DecisionWithdrawn,
    DecisionExpired,
    UnknownIdentity,
    UnknownAlias,
    IdentityClosed,
    StreamTerminated,
    HubInactive,
    Config,
    Serialization,
    Io,
}

impl ErrorCode {
    /// Numeric status carried in failure tuples
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::Unsupported => 501,
            ErrorCode::Validation => 400,
            ErrorCode::DaemonUnreachable
            | ErrorCode::DaemonLocked
            | ErrorCode::DaemonError
            | ErrorCode::StreamTerminated
            | ErrorCode::HubInactive
            | ErrorCode::DecisionExpired => 503,
            ErrorCode::DecisionConflict | ErrorCode::DecisionWithdrawn => 409,
            ErrorCode::UnknownIdentity | ErrorCode::UnknownAlias => 404,
            ErrorCode::IdentityClosed => 410,
            ErrorCode::Config | ErrorCode::Serialization | ErrorCode::Io => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Validation => "validation",
            ErrorCode::DaemonUnreachable => "daemon_unreachable",
            ErrorCode::DaemonLocked => "daemon_locked",
            ErrorCode::DaemonError => "daemon_error",
            ErrorCode::DecisionConflict => "decision_conflict",
            ErrorCode::DecisionWithdrawn => "decision_withdrawn",
            ErrorCode::DecisionExpired => "decision_expired",
            ErrorCode::UnknownIdentity => "unknown_identity",
            ErrorCode::UnknownAlias => "unknown_alias",
            ErrorCode::IdentityClosed => "identity_closed",
            ErrorCode::StreamTerminated => "stream_terminated",
            ErrorCode::HubInactive => "hub_inactive",
            ErrorCode::Config => "config",
            ErrorCode::Serialization => "serialization",
            ErrorCode::Io => "io",
        };
        write!(f, "{}", name)
    }
}

/// lngate error types
#[derive(Error, Debug)]
pub enum GateError {
    /// Daemon predates a required capability
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Malformed or missing field in daemon data
    #[error("Validation failed: {field} - {message}")]
    Validation { field: String, message: String },

    /// Connection refused or transient channel failure
    #[error("Daemon unreachable: {0}")]
    DaemonUnreachable(String),

    /// Daemon wallet is locked
    #[error("Daemon locked")]
    DaemonLocked,

    /// Any other daemon-side failure
    #[error("Daemon error: {message}")]
    DaemonError {
        message: String,
        details: Option<String>,
    },

    /// Second decision on an already-resolved request
    #[error("Decision already resolved: request {correlation_key} is {state}")]
    AlreadyResolved { correlation_key: u64, state: String },

    /// Decision is no longer offered to the caller
    #[error("Decision withdrawn: request {correlation_key}")]
    DecisionWithdrawn { correlation_key: u64 },

    /// Nobody decided before the daemon deadline
    #[error("Decision expired: request {correlation_key} on {uri}")]
    DecisionExpired { correlation_key: u64, uri: String },

    /// Lookup of an id never proposed or observed
    #[error("Unknown channel identity: {0}")]
    UnknownIdentity(String),

    /// Confirmation for an alias never proposed
    #[error("Unknown alias: {0}")]
    UnknownAlias(String),

    /// Mutation attempted on a closed identity
    #[error("Channel identity closed: {0}")]
    IdentityClosed(String),

    /// Interception stream ended
    #[error("Interception stream terminated: {0}")]
    StreamTerminated(String),

    /// Operation on a hub without a live stream
    #[error("Interceptor hub inactive")]
    HubInactive,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GateError {
    /// Shorthand for a validation failure on a named field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        GateError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable condition code
    pub fn code(&self) -> ErrorCode {
        match self {
            GateError::Unsupported(_) => ErrorCode::Unsupported,
            GateError::Validation { .. } => ErrorCode::Validation,
            GateError::DaemonUnreachable(_) => ErrorCode::DaemonUnreachable,
            GateError::DaemonLocked => ErrorCode::DaemonLocked,
            GateError::DaemonError { .. } => ErrorCode::DaemonError,
            GateError::AlreadyResolved { .. } => ErrorCode::DecisionConflict,
            GateError::DecisionWithdrawn { .. } => ErrorCode::DecisionWithdrawn,
            GateError::DecisionExpired { .. } => ErrorCode::DecisionExpired,
            GateError::UnknownIdentity(_) => ErrorCode::UnknownIdentity,
            GateError::UnknownAlias(_) => ErrorCode::UnknownAlias,
            GateError::IdentityClosed(_) => ErrorCode::IdentityClosed,
            GateError::StreamTerminated(_) => ErrorCode::StreamTerminated,
            GateError::HubInactive => ErrorCode::HubInactive,
            GateError::ConfigError(_) => ErrorCode::Config,
            GateError::SerializationError(_) => ErrorCode::Serialization,
            GateError::IoError(_) => ErrorCode::Io,
        }
    }

    /// Validation and capability errors are never worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::DaemonUnreachable | ErrorCode::DaemonLocked | ErrorCode::DaemonError
        )
    }

    /// Structured failure tuple for programmatic branching
    pub fn to_failure(&self) -> RpcFailure {
        let raw = match self {
            GateError::Validation { field, .. } => Some(serde_json::json!({ "field": field })),
            GateError::DaemonError {
                details: Some(details),
                ..
            } => Some(serde_json::json!({ "details": details })),
            GateError::DecisionExpired { uri, .. } => Some(serde_json::json!({ "uri": uri })),
            _ => None,
        };

        RpcFailure {
            code: self.code().status(),
            condition: self.code(),
            message: self.to_string(),
            raw,
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for GateError {
    fn from(err: serde_yaml::Error) -> Self {
        GateError::SerializationError(err.to_string())
    }
}

/// Result type alias for lngate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Failure tuple relayed to the daemon and surfaced to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcFailure {
    /// Numeric status
    pub code: u16,
    /// Stable condition
    pub condition: ErrorCode,
    /// Message shown to the RPC caller
    pub message: String,
    /// Optional raw context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl RpcFailure {
    /// Failure for a rejected privileged request.
    ///
    /// The message is exactly `reason`; `raw.wrapper` names the failure the
    /// client library reports for that category.
    pub fn for_rejection(wrapper: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            code: 503,
            condition: ErrorCode::DaemonError,
            raw: Some(serde_json::json!({ "wrapper": wrapper, "err": reason })),
            message: reason,
        }
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}] {}", self.code, self.condition, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_error_display() {
        let error = GateError::Unsupported("BackingDaemonDoesNotSupportRpcInterception".to_string());
        assert_eq!(
            error.to_string(),
            "Not supported: BackingDaemonDoesNotSupportRpcInterception"
        );
        assert_eq!(error.code(), ErrorCode::Unsupported);
        assert_eq!(error.code().status(), 501);
    }

    #[test]
    fn test_validation_error_display() {
        let error = GateError::validation("destination", "expected public key");
        assert_eq!(
            error.to_string(),
            "Validation failed: destination - expected public key"
        );
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_already_resolved_is_conflict() {
        let error = GateError::AlreadyResolved {
            correlation_key: 7,
            state: "accepted".to_string(),
        };
        assert_eq!(error.code(), ErrorCode::DecisionConflict);
        assert_eq!(error.code().status(), 409);
        assert_eq!(
            error.to_string(),
            "Decision already resolved: request 7 is accepted"
        );
    }

    #[test]
    fn test_daemon_failures_are_retryable() {
        assert!(GateError::DaemonLocked.is_retryable());
        assert!(GateError::DaemonUnreachable("refused".to_string()).is_retryable());
        assert!(!GateError::UnknownAlias("A1".to_string()).is_retryable());
        assert!(!GateError::Unsupported("x".to_string()).is_retryable());
    }

    #[test]
    fn test_to_failure_carries_code_and_context() {
        let failure = GateError::validation("payment_hash", "expected hex").to_failure();
        assert_eq!(failure.code, 400);
        assert_eq!(failure.condition, ErrorCode::Validation);
        assert_eq!(failure.raw.unwrap()["field"], "payment_hash");

        let failure = GateError::DaemonLocked.to_failure();
        assert_eq!(failure.code, 503);
        assert!(failure.raw.is_none());
    }

    #[test]
    fn test_rejection_failure_message_is_reason() {
        let failure = RpcFailure::for_rejection("FailedToOpenChannel", "message");
        assert_eq!(failure.message, "message");
        assert_eq!(failure.code, 503);
        let raw = failure.raw.unwrap();
        assert_eq!(raw["wrapper"], "FailedToOpenChannel");
        assert_eq!(raw["err"], "message");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let gate_error: GateError = io_error.into();
        assert!(matches!(gate_error, GateError::IoError(_)));
        assert!(gate_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let gate_error: GateError = result.unwrap_err().into();
        assert!(matches!(gate_error, GateError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let gate_error: GateError = result.unwrap_err().into();
        assert!(matches!(gate_error, GateError::SerializationError(_)));
    }

    #[test]
    fn test_error_code_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCode::DaemonUnreachable).unwrap();
        assert_eq!(json, "\"daemon_unreachable\"");
        assert_eq!(ErrorCode::DecisionConflict.to_string(), "decision_conflict");
    }
}
