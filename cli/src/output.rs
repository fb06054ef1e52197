//! Output helpers for CLI commands.

use comfy_table::{ContentArrangement, Table};
use lngate_core::DaemonReply;
use lngate_intercept::SubscriptionEvent;
use serde::Serialize;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Print `value` as one line of JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// One line of replay output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayRecord {
    /// Event seen by the replay subscription
    Event {
        event: String,
        uri: Option<String>,
        correlation_key: Option<u64>,
        detail: Option<String>,
    },
    /// Reply relayed back for a frame
    Reply(DaemonReply),
}

impl ReplayRecord {
    pub fn from_event(event: &SubscriptionEvent) -> Self {
        let name = event.name().to_string();
        match event {
            SubscriptionEvent::Request(request) => ReplayRecord::Event {
                event: name,
                uri: Some(request.uri.clone()),
                correlation_key: Some(request.correlation_key),
                detail: Some(request.category.to_string()),
            },
            SubscriptionEvent::Response(response) => ReplayRecord::Event {
                event: name,
                uri: Some(response.uri.clone()),
                correlation_key: Some(response.correlation_key),
                detail: None,
            },
            SubscriptionEvent::Error(error) => ReplayRecord::Event {
                event: name,
                uri: error.uri.clone(),
                correlation_key: error.correlation_key,
                detail: Some(format!("{}: {}", error.failure.condition, error.failure.message)),
            },
            SubscriptionEvent::OpenChannelRequest(rpc)
            | SubscriptionEvent::CloseChannelRequest(rpc)
            | SubscriptionEvent::PayViaRouteRequest(rpc) => ReplayRecord::Event {
                event: name,
                uri: Some(rpc.request.uri.clone()),
                correlation_key: Some(rpc.correlation_key()),
                detail: None,
            },
        }
    }
}

impl std::fmt::Display for ReplayRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayRecord::Event {
                event,
                uri,
                correlation_key,
                detail,
            } => {
                write!(f, "event  {:<24}", event)?;
                if let Some(key) = correlation_key {
                    write!(f, " #{}", key)?;
                }
                if let Some(uri) = uri {
                    write!(f, " {}", uri)?;
                }
                if let Some(detail) = detail {
                    write!(f, " ({})", detail)?;
                }
                Ok(())
            }
            ReplayRecord::Reply(reply) => match reply {
                DaemonReply::Continue { msg_id } => write!(f, "reply  msg {} continue", msg_id),
                DaemonReply::Replace { msg_id, payload } => {
                    write!(f, "reply  msg {} replace {}", msg_id, payload)
                }
                DaemonReply::Reject { msg_id, error } => {
                    write!(f, "reply  msg {} reject \"{}\"", msg_id, error.message)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lngate_core::RpcFailure;

    #[test]
    fn test_reply_record_json() {
        let record = ReplayRecord::Reply(DaemonReply::Continue { msg_id: 3 });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "reply");
        assert_eq!(json["action"], "continue");
        assert_eq!(json["msg_id"], 3);
    }

    #[test]
    fn test_reject_record_text() {
        let record = ReplayRecord::Reply(DaemonReply::Reject {
            msg_id: 9,
            error: RpcFailure::for_rejection("FailedToOpenChannel", "no gifts"),
        });
        assert_eq!(record.to_string(), "reply  msg 9 reject \"no gifts\"");
    }
}
