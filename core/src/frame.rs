//! Interception stream frames and replies.
//!
//! A frame is one message the daemon hands to its interception stream: the
//! request a caller issued, the response the daemon produced for it, or the
//! error it failed with. Every frame must be answered with exactly one
//! [`DaemonReply`] referencing its `msg_id`.

use crate::error::RpcFailure;
use serde::{Deserialize, Serialize};

/// Key matching a response or error to the request that caused it
pub type CorrelationKey = u64;

/// Per-frame identifier a reply must reference
pub type MessageId = u64;

/// Frame direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
    Error,
}

/// Frame body, keyed on the wire by its direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameBody {
    Request(serde_json::Value),
    Response(serde_json::Value),
    Error(serde_json::Value),
}

impl FrameBody {
    pub fn direction(&self) -> Direction {
        match self {
            FrameBody::Request(_) => Direction::Request,
            FrameBody::Response(_) => Direction::Response,
            FrameBody::Error(_) => Direction::Error,
        }
    }
}

/// Raw frame from the daemon interception stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Identifier the reply must echo
    pub msg_id: MessageId,
    /// Shared by a request and its response/error
    pub request_id: CorrelationKey,
    /// Daemon method, e.g. `/lnrpc.Lightning/OpenChannel`
    pub uri: String,
    /// Streaming RPCs produce many frames per request id
    #[serde(default)]
    pub is_stream: bool,
    #[serde(flatten)]
    pub body: FrameBody,
}

impl RawFrame {
    /// Build a request frame
    pub fn request(
        msg_id: MessageId,
        request_id: CorrelationKey,
        uri: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            msg_id,
            request_id,
            uri: uri.into(),
            is_stream: false,
            body: FrameBody::Request(payload),
        }
    }

    /// Build a response frame
    pub fn response(
        msg_id: MessageId,
        request_id: CorrelationKey,
        uri: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            msg_id,
            request_id,
            uri: uri.into(),
            is_stream: false,
            body: FrameBody::Response(payload),
        }
    }

    /// Build an error frame
    pub fn error(
        msg_id: MessageId,
        request_id: CorrelationKey,
        uri: impl Into<String>,
        error: serde_json::Value,
    ) -> Self {
        Self {
            msg_id,
            request_id,
            uri: uri.into(),
            is_stream: false,
            body: FrameBody::Error(error),
        }
    }

    pub fn direction(&self) -> Direction {
        self.body.direction()
    }
}

/// Reply relayed back to the daemon for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DaemonReply {
    /// Let the message through unchanged
    Continue { msg_id: MessageId },
    /// Let the request through with a replaced payload
    Replace {
        msg_id: MessageId,
        payload: serde_json::Value,
    },
    /// Fail the request; the caller observes `error`
    Reject {
        msg_id: MessageId,
        error: RpcFailure,
    },
}

impl DaemonReply {
    pub fn msg_id(&self) -> MessageId {
        match self {
            DaemonReply::Continue { msg_id }
            | DaemonReply::Replace { msg_id, .. }
            | DaemonReply::Reject { msg_id, .. } => *msg_id,
        }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, DaemonReply::Reject { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let json = serde_json::json!({
            "msg_id": 4,
            "request_id": 2,
            "uri": "/lnrpc.Lightning/GetInfo",
            "request": {}
        });
        let frame: RawFrame = serde_json::from_value(json).unwrap();
        assert_eq!(frame.msg_id, 4);
        assert_eq!(frame.request_id, 2);
        assert!(!frame.is_stream);
        assert_eq!(frame.direction(), Direction::Request);
    }

    #[test]
    fn test_error_frame_wire_shape() {
        let json = serde_json::json!({
            "msg_id": 5,
            "request_id": 2,
            "uri": "/lnrpc.Lightning/GetInfo",
            "error": {"details": "wallet locked"}
        });
        let frame: RawFrame = serde_json::from_value(json).unwrap();
        assert_eq!(frame.direction(), Direction::Error);
        match frame.body {
            FrameBody::Error(e) => assert_eq!(e["details"], "wallet locked"),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_frame_serializes_flat() {
        let frame = RawFrame::response(9, 3, "/lnrpc.Lightning/AddInvoice", serde_json::json!({"r": 1}));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["response"]["r"], 1);
        assert_eq!(value["uri"], "/lnrpc.Lightning/AddInvoice");
    }

    #[test]
    fn test_reply_tagging() {
        let reply = DaemonReply::Continue { msg_id: 3 };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["action"], "continue");
        assert_eq!(reply.msg_id(), 3);
        assert!(!reply.is_reject());

        let reply = DaemonReply::Reject {
            msg_id: 8,
            error: RpcFailure::for_rejection("FailedToOpenChannel", "no"),
        };
        assert!(reply.is_reject());
        assert_eq!(reply.msg_id(), 8);
    }
}
