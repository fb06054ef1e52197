//! Frame classification.
//!
//! A pure lookup from method URI to [`RequestCategory`]. Every frame yields
//! exactly one [`ClassifiedFrame`], whether or not anybody listens for it.

use chrono::Utc;
use lngate_core::{
    map_daemon_failure, CorrelationKey, FrameBody, InterceptedRequest, MessageId, RawFrame,
    RequestCategory, RpcFailure,
};
use serde_json::Value;

/// Methods that open a channel
pub const OPEN_CHANNEL_URIS: &[&str] = &[
    "/lnrpc.Lightning/OpenChannel",
    "/lnrpc.Lightning/OpenChannelSync",
];

/// Methods that close a channel
pub const CLOSE_CHANNEL_URIS: &[&str] = &["/lnrpc.Lightning/CloseChannel"];

/// Methods that execute a payment over a caller-supplied route
pub const PAY_VIA_ROUTE_URIS: &[&str] = &[
    "/routerrpc.Router/SendToRouteV2",
    "/lnrpc.Lightning/SendToRouteSync",
];

/// Category for a daemon method; unknown methods are generic
pub fn category_for_uri(uri: &str) -> RequestCategory {
    if OPEN_CHANNEL_URIS.contains(&uri) {
        RequestCategory::OpenChannel
    } else if CLOSE_CHANNEL_URIS.contains(&uri) {
        RequestCategory::CloseChannel
    } else if PAY_VIA_ROUTE_URIS.contains(&uri) {
        RequestCategory::PayViaRoute
    } else {
        RequestCategory::Generic
    }
}

/// Result of classifying one raw frame
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedFrame {
    /// A caller issued a request
    Request(InterceptedRequest),
    /// The daemon answered an earlier request
    Response {
        uri: String,
        correlation_key: CorrelationKey,
        msg_id: MessageId,
        is_stream: bool,
        payload: Value,
    },
    /// An earlier request failed
    Error {
        uri: String,
        correlation_key: CorrelationKey,
        msg_id: MessageId,
        error: Value,
    },
}

impl ClassifiedFrame {
    pub fn msg_id(&self) -> MessageId {
        match self {
            ClassifiedFrame::Request(request) => request.msg_id,
            ClassifiedFrame::Response { msg_id, .. } | ClassifiedFrame::Error { msg_id, .. } => {
                *msg_id
            }
        }
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        match self {
            ClassifiedFrame::Request(request) => request.correlation_key,
            ClassifiedFrame::Response {
                correlation_key, ..
            }
            | ClassifiedFrame::Error {
                correlation_key, ..
            } => *correlation_key,
        }
    }

    pub fn uri(&self) -> &str {
        match self {
            ClassifiedFrame::Request(request) => &request.uri,
            ClassifiedFrame::Response { uri, .. } | ClassifiedFrame::Error { uri, .. } => uri,
        }
    }
}

/// Classify a raw frame
pub fn classify(frame: RawFrame) -> ClassifiedFrame {
    let RawFrame {
        msg_id,
        request_id,
        uri,
        is_stream,
        body,
    } = frame;

    match body {
        FrameBody::Request(payload) => ClassifiedFrame::Request(InterceptedRequest {
            category: category_for_uri(&uri),
            uri,
            payload,
            correlation_key: request_id,
            msg_id,
            is_stream,
            received_at: Utc::now(),
        }),
        FrameBody::Response(payload) => ClassifiedFrame::Response {
            uri,
            correlation_key: request_id,
            msg_id,
            is_stream,
            payload,
        },
        FrameBody::Error(error) => ClassifiedFrame::Error {
            uri,
            correlation_key: request_id,
            msg_id,
            error,
        },
    }
}

/// Structured failure for the error body of an error frame.
///
/// Accepts `{details, message}` objects or a bare string; the raw body is
/// kept as context.
pub fn daemon_failure(error: &Value) -> RpcFailure {
    let field = |name: &str| error.get(name).and_then(Value::as_str).unwrap_or_default();
    let (details, message) = match error {
        Value::String(details) => (details.as_str(), ""),
        _ => (field("details"), field("message")),
    };

    let mut failure = map_daemon_failure(details, message).to_failure();
    failure.raw = Some(error.clone());
    failure
}
