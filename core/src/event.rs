use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::frame::{CorrelationKey, MessageId};

/// Request category assigned by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCategory {
    Generic,
    OpenChannel,
    CloseChannel,
    PayViaRoute,
}

impl RequestCategory {
    /// Privileged categories, in declaration order
    pub const PRIVILEGED: [RequestCategory; 3] = [
        RequestCategory::OpenChannel,
        RequestCategory::CloseChannel,
        RequestCategory::PayViaRoute,
    ];

    pub fn is_privileged(self) -> bool {
        !matches!(self, RequestCategory::Generic)
    }

    /// Failure name the client library reports when this category is rejected
    pub fn rejection_wrapper(self) -> &'static str {
        match self {
            RequestCategory::Generic => "UnexpectedRpcError",
            RequestCategory::OpenChannel => "FailedToOpenChannel",
            RequestCategory::CloseChannel => "UnexpectedCloseChannelError",
            RequestCategory::PayViaRoute => "UnexpectedErrorWhenPayingViaRoute",
        }
    }

    /// CamelCase label used in capability error messages
    pub fn label(self) -> &'static str {
        match self {
            RequestCategory::Generic => "Generic",
            RequestCategory::OpenChannel => "OpenChannel",
            RequestCategory::CloseChannel => "CloseChannel",
            RequestCategory::PayViaRoute => "PayViaRoute",
        }
    }
}

impl std::fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestCategory::Generic => write!(f, "generic"),
            RequestCategory::OpenChannel => write!(f, "open_channel"),
            RequestCategory::CloseChannel => write!(f, "close_channel"),
            RequestCategory::PayViaRoute => write!(f, "pay_via_route"),
        }
    }
}

/// Names a subscription handler can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Request,
    Response,
    Error,
    OpenChannelRequest,
    CloseChannelRequest,
    PayViaRouteRequest,
}

impl EventName {
    /// Privileged event emitted for a category
    pub fn for_category(category: RequestCategory) -> Option<EventName> {
        match category {
            RequestCategory::Generic => None,
            RequestCategory::OpenChannel => Some(EventName::OpenChannelRequest),
            RequestCategory::CloseChannel => Some(EventName::CloseChannelRequest),
            RequestCategory::PayViaRoute => Some(EventName::PayViaRouteRequest),
        }
    }

    /// Generic events reach every subscription regardless of interests
    pub fn is_generic(self) -> bool {
        matches!(self, EventName::Request | EventName::Response | EventName::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Request => events::REQUEST,
            EventName::Response => events::RESPONSE,
            EventName::Error => events::ERROR,
            EventName::OpenChannelRequest => events::OPEN_CHANNEL_REQUEST,
            EventName::CloseChannelRequest => events::CLOSE_CHANNEL_REQUEST,
            EventName::PayViaRouteRequest => events::PAY_VIA_ROUTE_REQUEST,
        }
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            events::REQUEST => Ok(EventName::Request),
            events::RESPONSE => Ok(EventName::Response),
            events::ERROR => Ok(EventName::Error),
            events::OPEN_CHANNEL_REQUEST => Ok(EventName::OpenChannelRequest),
            events::CLOSE_CHANNEL_REQUEST => Ok(EventName::CloseChannelRequest),
            events::PAY_VIA_ROUTE_REQUEST => Ok(EventName::PayViaRouteRequest),
            _ => Err(format!("unknown event name: '{}'", s)),
        }
    }
}

/// Intercepted request record.
///
/// Created when a request frame is classified; dropped once its response or
/// error is observed or the stream closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptedRequest {
    /// Daemon method
    pub uri: String,
    /// Assigned category
    pub category: RequestCategory,
    /// Method-specific payload
    pub payload: serde_json::Value,
    /// Matches later responses/errors to this request
    pub correlation_key: CorrelationKey,
    /// Frame the request arrived in
    pub msg_id: MessageId,
    /// Request opened a server stream
    pub is_stream: bool,
    /// Arrival time
    pub received_at: DateTime<Utc>,
}

impl InterceptedRequest {
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

/// Event catalog - subscriber-facing event names
pub mod events {
    pub const REQUEST: &str = "request";
    pub const RESPONSE: &str = "response";
    pub const ERROR: &str = "error";
    pub const OPEN_CHANNEL_REQUEST: &str = "open_channel_request";
    pub const CLOSE_CHANNEL_REQUEST: &str = "close_channel_request";
    pub const PAY_VIA_ROUTE_REQUEST: &str = "pay_via_route_request";
}
