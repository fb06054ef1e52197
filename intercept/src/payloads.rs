//! Typed views over privileged request payloads.
//!
//! The daemon hands over its own request message as JSON. The views below
//! rename its fields into the vocabulary subscribers decide on and reject
//! payloads the gate could not describe faithfully.

use lngate_core::{GateError, RequestCategory, Result, ShortChannelId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PUBLIC_KEY_BYTES: usize = 33;
const HASH_BYTES: usize = 32;

/// Channel open request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub partner_public_key: String,
    pub local_tokens: u64,
    pub give_tokens: Option<u64>,
    pub is_private: bool,
    pub is_trusted_funding: bool,
    pub chain_fee_tokens_per_vbyte: Option<u64>,
    pub base_fee_mtokens: Option<u64>,
    pub fee_rate: Option<u64>,
    pub cooperative_close_address: Option<String>,
}

/// Channel close request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseChannelRequest {
    pub transaction_id: String,
    pub transaction_vout: u32,
    pub address: Option<String>,
    pub is_force_close: bool,
}

/// One hop of a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// Channel in `HxTxO` form
    pub channel: String,
    pub public_key: String,
    pub fee_mtokens: u64,
    pub forward_mtokens: u64,
    pub timeout: u64,
}

/// Route a payment is pinned to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub fee_mtokens: u64,
    pub mtokens: u64,
    pub timeout: u64,
    pub hops: Vec<Hop>,
}

impl Route {
    pub fn final_hop(&self) -> Option<&Hop> {
        self.hops.last()
    }
}

/// Payment over a caller-supplied route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayViaRouteRequest {
    /// Payment hash
    pub id: String,
    pub route: Route,
}

/// Typed payload of a privileged request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum PrivilegedView {
    OpenChannel(OpenChannelRequest),
    CloseChannel(CloseChannelRequest),
    PayViaRoute(PayViaRouteRequest),
}

impl PrivilegedView {
    /// Parse `payload` for `category`; generic requests have no view
    pub fn parse(category: RequestCategory, payload: &Value) -> Result<Option<Self>> {
        let view = match category {
            RequestCategory::Generic => return Ok(None),
            RequestCategory::OpenChannel => PrivilegedView::OpenChannel(parse_open(payload)?),
            RequestCategory::CloseChannel => PrivilegedView::CloseChannel(parse_close(payload)?),
            RequestCategory::PayViaRoute => PrivilegedView::PayViaRoute(parse_route(payload)?),
        };
        Ok(Some(view))
    }

    pub fn category(&self) -> RequestCategory {
        match self {
            PrivilegedView::OpenChannel(_) => RequestCategory::OpenChannel,
            PrivilegedView::CloseChannel(_) => RequestCategory::CloseChannel,
            PrivilegedView::PayViaRoute(_) => RequestCategory::PayViaRoute,
        }
    }

    pub fn as_open_channel(&self) -> Option<&OpenChannelRequest> {
        match self {
            PrivilegedView::OpenChannel(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_close_channel(&self) -> Option<&CloseChannelRequest> {
        match self {
            PrivilegedView::CloseChannel(view) => Some(view),
            _ => None,
        }
    }

    pub fn as_pay_via_route(&self) -> Option<&PayViaRouteRequest> {
        match self {
            PrivilegedView::PayViaRoute(view) => Some(view),
            _ => None,
        }
    }
}

/// True when an open payload asks for trusted (zero-conf) funding
pub fn requests_trusted_funding(payload: &Value) -> bool {
    matches!(payload.get("zero_conf"), Some(Value::Bool(true)))
}

fn parse_open(payload: &Value) -> Result<OpenChannelRequest> {
    Ok(OpenChannelRequest {
        partner_public_key: hex_field(payload, "node_pubkey", PUBLIC_KEY_BYTES)?,
        local_tokens: required_number(payload, "local_funding_amount")?,
        give_tokens: number(payload, "push_sat")?.filter(|tokens| *tokens > 0),
        is_private: flag(payload, "private")?,
        is_trusted_funding: flag(payload, "zero_conf")?,
        chain_fee_tokens_per_vbyte: number(payload, "sat_per_vbyte")?,
        base_fee_mtokens: number(payload, "base_fee")?,
        fee_rate: number(payload, "fee_rate")?,
        cooperative_close_address: text(payload, "close_address")?,
    })
}

fn parse_close(payload: &Value) -> Result<CloseChannelRequest> {
    let point = payload
        .get("channel_point")
        .filter(|point| point.is_object())
        .ok_or_else(|| GateError::validation("channel_point", "missing"))?;
    let vout = number(point, "output_index")?.unwrap_or(0);

    Ok(CloseChannelRequest {
        transaction_id: hex_field(point, "funding_txid_str", HASH_BYTES)?,
        transaction_vout: u32::try_from(vout)
            .map_err(|_| GateError::validation("output_index", "out of range"))?,
        address: text(payload, "delivery_address")?,
        is_force_close: flag(payload, "force")?,
    })
}

fn parse_route(payload: &Value) -> Result<PayViaRouteRequest> {
    let route = payload
        .get("route")
        .filter(|route| route.is_object())
        .ok_or_else(|| GateError::validation("route", "missing"))?;

    let hops = match route.get("hops") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(hops)) => hops.iter().map(parse_hop).collect::<Result<_>>()?,
        Some(_) => return Err(GateError::validation("hops", "expected a list")),
    };

    Ok(PayViaRouteRequest {
        id: hex_field(payload, "payment_hash", HASH_BYTES)?,
        route: Route {
            fee_mtokens: number(route, "total_fees_msat")?.unwrap_or(0),
            mtokens: required_number(route, "total_amt_msat")?,
            timeout: number(route, "total_time_lock")?.unwrap_or(0),
            hops,
        },
    })
}

fn parse_hop(hop: &Value) -> Result<Hop> {
    let channel = ShortChannelId::from_u64(required_number(hop, "chan_id")?);
    Ok(Hop {
        channel: channel.to_string(),
        public_key: hex_field(hop, "pub_key", PUBLIC_KEY_BYTES)?,
        fee_mtokens: number(hop, "fee_msat")?.unwrap_or(0),
        forward_mtokens: number(hop, "amt_to_forward_msat")?.unwrap_or(0),
        timeout: number(hop, "expiry")?.unwrap_or(0),
    })
}

/// Unsigned integer given as a JSON number or a decimal string
fn number(payload: &Value, field: &str) -> Result<Option<u64>> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| GateError::validation(field, "expected a non-negative integer")),
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| GateError::validation(field, format!("'{}' is not a number", s))),
        Some(_) => Err(GateError::validation(field, "expected a number")),
    }
}

fn required_number(payload: &Value, field: &str) -> Result<u64> {
    number(payload, field)?.ok_or_else(|| GateError::validation(field, "missing"))
}

fn flag(payload: &Value, field: &str) -> Result<bool> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(GateError::validation(field, "expected a boolean")),
    }
}

/// Optional string; empty counts as absent
fn text(payload: &Value, field: &str) -> Result<Option<String>> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(GateError::validation(field, "expected a string")),
    }
}

/// Required hex string decoding to exactly `bytes` bytes
fn hex_field(payload: &Value, field: &str, bytes: usize) -> Result<String> {
    let raw = match payload.get(field) {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err(GateError::validation(field, "missing"))
        }
        Some(_) => return Err(GateError::validation(field, "expected a hex string")),
    };

    let decoded =
        hex::decode(raw).map_err(|e| GateError::validation(field, format!("malformed hex: {}", e)))?;
    if decoded.len() != bytes {
        return Err(GateError::validation(
            field,
            format!("expected {} bytes, got {}", bytes, decoded.len()),
        ));
    }
    Ok(raw.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lngate_core::ErrorCode;
    use serde_json::json;

    fn key(byte: u8) -> String {
        hex::encode([byte; 33])
    }

    #[test]
    fn test_parse_open_channel() {
        let payload = json!({
            "node_pubkey": key(2),
            "local_funding_amount": "1000000",
            "push_sat": 100000,
            "private": true,
            "zero_conf": true,
            "close_address": ""
        });
        let view = PrivilegedView::parse(RequestCategory::OpenChannel, &payload)
            .unwrap()
            .unwrap();
        let open = view.as_open_channel().unwrap();

        assert_eq!(open.partner_public_key, key(2));
        assert_eq!(open.local_tokens, 1_000_000);
        assert_eq!(open.give_tokens, Some(100_000));
        assert!(open.is_private);
        assert!(open.is_trusted_funding);
        assert_eq!(open.cooperative_close_address, None);
        assert!(requests_trusted_funding(&payload));
    }

    #[test]
    fn test_zero_push_is_no_gift() {
        let payload = json!({"node_pubkey": key(3), "local_funding_amount": 5, "push_sat": "0"});
        let view = PrivilegedView::parse(RequestCategory::OpenChannel, &payload)
            .unwrap()
            .unwrap();
        assert_eq!(view.as_open_channel().unwrap().give_tokens, None);
        assert!(!requests_trusted_funding(&payload));
    }

    #[test]
    fn test_open_channel_validation() {
        let missing_key = json!({"local_funding_amount": 5});
        let err = PrivilegedView::parse(RequestCategory::OpenChannel, &missing_key).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let bad_hex = json!({"node_pubkey": "zz", "local_funding_amount": 5});
        assert!(PrivilegedView::parse(RequestCategory::OpenChannel, &bad_hex).is_err());

        let short_key = json!({"node_pubkey": "0202", "local_funding_amount": 5});
        assert!(PrivilegedView::parse(RequestCategory::OpenChannel, &short_key).is_err());

        let bad_amount = json!({"node_pubkey": key(2), "local_funding_amount": "lots"});
        match PrivilegedView::parse(RequestCategory::OpenChannel, &bad_amount).unwrap_err() {
            GateError::Validation { field, .. } => assert_eq!(field, "local_funding_amount"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_parse_close_channel() {
        let payload = json!({
            "channel_point": {"funding_txid_str": hex::encode([0u8; 32]), "output_index": 1},
            "delivery_address": "address"
        });
        let view = PrivilegedView::parse(RequestCategory::CloseChannel, &payload)
            .unwrap()
            .unwrap();
        let close = view.as_close_channel().unwrap();
        assert_eq!(close.transaction_vout, 1);
        assert_eq!(close.address.as_deref(), Some("address"));
        assert!(!close.is_force_close);
    }

    #[test]
    fn test_close_without_channel_point() {
        let err = PrivilegedView::parse(RequestCategory::CloseChannel, &json!({})).unwrap_err();
        assert_eq!(err.to_failure().code, 400);
    }

    #[test]
    fn test_parse_route() {
        let chan_id = ShortChannelId::new(800_000, 2, 1).to_u64();
        let payload = json!({
            "payment_hash": hex::encode([7u8; 32]),
            "route": {
                "total_fees_msat": "0",
                "total_amt_msat": "1",
                "total_time_lock": 40,
                "hops": [{
                    "chan_id": chan_id.to_string(),
                    "pub_key": key(4),
                    "amt_to_forward_msat": "1",
                    "expiry": 40
                }]
            }
        });
        let view = PrivilegedView::parse(RequestCategory::PayViaRoute, &payload)
            .unwrap()
            .unwrap();
        let pay = view.as_pay_via_route().unwrap();

        assert_eq!(pay.route.fee_mtokens, 0);
        assert_eq!(pay.route.mtokens, 1);
        let hop = pay.route.final_hop().unwrap();
        assert_eq!(hop.channel, "800000x2x1");
        assert_eq!(hop.public_key, key(4));
        assert_eq!(view.category(), RequestCategory::PayViaRoute);
    }

    #[test]
    fn test_generic_has_no_view() {
        assert!(PrivilegedView::parse(RequestCategory::Generic, &json!({}))
            .unwrap()
            .is_none());
    }
}
