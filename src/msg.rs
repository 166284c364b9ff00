//! Wire protocol for the client↔DEX-server connection.
//!
//! Messages are JSON over WebSocket with a small envelope:
//! `{ "type": 1|2|3, "route": "...", "id": n, "payload": ... }`.
//! The transport delivers parsed [`Message`]s; the payload stays a raw
//! `serde_json::Value` until a handler asks for a concrete type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Routes ───────────────────────────────────────────────────────────────────

pub const CONFIG_ROUTE: &str = "config";
pub const ORDER_BOOK_ROUTE: &str = "order_book";
pub const BOOK_ORDER_ROUTE: &str = "book_order";
pub const UNBOOK_ORDER_ROUTE: &str = "unbook_order";
pub const EPOCH_ORDER_ROUTE: &str = "epoch_order";
pub const UNSUB_ORDER_BOOK_ROUTE: &str = "unsub_order_book";
pub const MATCH_ROUTE: &str = "match";
pub const AUDIT_ROUTE: &str = "audit";
pub const REDEMPTION_ROUTE: &str = "redemption";
pub const PREIMAGE_ROUTE: &str = "preimage";
pub const REVOKE_MATCH_ROUTE: &str = "revoke_match";
pub const SUSPENSION_ROUTE: &str = "suspension";
pub const MATCH_PROOF_ROUTE: &str = "match_proof";
pub const MATCH_DATA_ROUTE: &str = "match_data";

/// Wire encoding of a buy order's side field.
pub const BUY_ORDER_NUM: u8 = 1;
/// Wire encoding of a sell order's side field.
pub const SELL_ORDER_NUM: u8 = 2;

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Message kinds carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        match kind {
            MessageKind::Request => 1,
            MessageKind::Response => 2,
            MessageKind::Notification => 3,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::Notification),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

/// Errors raised while building or unpacking messages.
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message on route '{0}' carries no payload")]
    NoPayload(String),
}

/// The parsed message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub route: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Message {
    pub fn request<T: Serialize>(id: u64, route: &str, payload: &T) -> Result<Self, MsgError> {
        Ok(Self {
            kind: MessageKind::Request,
            route: route.to_string(),
            id: Some(id),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    pub fn response<T: Serialize>(id: u64, route: &str, payload: &T) -> Result<Self, MsgError> {
        Ok(Self {
            kind: MessageKind::Response,
            route: route.to_string(),
            id: Some(id),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    pub fn notification<T: Serialize>(route: &str, payload: &T) -> Result<Self, MsgError> {
        Ok(Self {
            kind: MessageKind::Notification,
            route: route.to_string(),
            id: None,
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Deserialize the payload into a concrete type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, MsgError> {
        let payload = self
            .payload
            .as_ref()
            .ok_or_else(|| MsgError::NoPayload(self.route.clone()))?;
        Ok(serde_json::from_value(payload.clone())?)
    }
}

// ── Config ───────────────────────────────────────────────────────────────────

/// An asset entry in the server's `config` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: u32,
    pub symbol: String,
    #[serde(default)]
    pub lot_size: u64,
    #[serde(default)]
    pub rate_step: u64,
}

/// The `config` response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResult {
    pub assets: Vec<Asset>,
    /// Markets as `[base_id, quote_id]` pairs.
    pub markets: Vec<(u32, u32)>,
    #[serde(default)]
    pub fee: u64,
    #[serde(default)]
    pub epoch_len_ms: u64,
}

// ── Order book payloads ──────────────────────────────────────────────────────

/// One resting order inside an `order_book` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOrder {
    #[serde(with = "hex_bytes")]
    pub order_id: Vec<u8>,
    pub side: u8,
    pub quantity: u64,
    pub rate: u64,
    #[serde(default)]
    pub time: u64,
}

/// The `order_book` response payload: a full snapshot of one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub seq: u64,
    pub market_id: String,
    pub orders: Vec<SnapshotOrder>,
}

/// The `book_order` notification: a new order entered the book.
/// Deltas carry no timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookOrderNote {
    pub seq: u64,
    pub market_id: String,
    #[serde(with = "hex_bytes")]
    pub order_id: Vec<u8>,
    pub side: u8,
    pub quantity: u64,
    pub rate: u64,
}

/// The `unbook_order` notification: an order left the book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnbookOrderNote {
    pub seq: u64,
    pub market_id: String,
    #[serde(with = "hex_bytes")]
    pub order_id: Vec<u8>,
}

/// The `epoch_order` notification: an order queued for the current epoch.
/// Epoch orders are surfaced to the application, not applied to any book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochOrderNote {
    pub market_id: String,
    #[serde(with = "hex_bytes")]
    pub order_id: Vec<u8>,
    pub side: u8,
    pub quantity: u64,
    pub rate: u64,
    pub epoch: u64,
}

/// The `unsub_order_book` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubOrderBook {
    pub market_id: String,
}

/// The `order_book` subscription request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSubscription {
    pub market_id: String,
}

// ── Serde helpers ────────────────────────────────────────────────────────────

/// Hex-encoded byte fields. Length checks belong to the consumers so that a
/// short order id surfaces as a book-level error, not a parse failure.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
