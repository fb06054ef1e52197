//! lngate Core - Shared Types for Daemon RPC Mediation
//!
//! This crate provides the types shared by the interception hub and the
//! channel identity resolver: the structured error taxonomy, configuration,
//! interception frames and replies, and channel identifier formats.

pub mod config;
pub mod daemon;
pub mod error;
pub mod event;
pub mod frame;
pub mod ids;

// Re-export commonly used types
pub use config::{ChannelsConfig, GateConfig, InterceptConfig, LogLevel};
pub use daemon::{map_daemon_failure, DaemonCapabilities};
pub use error::{ErrorCode, GateError, Result, RpcFailure};
pub use event::{EventName, InterceptedRequest, RequestCategory};
pub use frame::{CorrelationKey, DaemonReply, FrameBody, MessageId, RawFrame};
pub use ids::ShortChannelId;

/// lngate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
