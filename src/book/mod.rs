//! Client-tracked order books.
//!
//! A [`SideBook`] keeps one side's resting orders sorted by rate with FIFO
//! order inside a rate level. An [`OrderBook`] pairs two sides with the
//! snapshot-plus-deltas replication protocol: it buffers notes that arrive
//! before the snapshot, enforces gapless sequence numbers afterwards, and
//! poisons itself on any divergence from the server.

mod orderbook;
mod side;

pub use orderbook::OrderBook;
pub use side::SideBook;

use std::fmt;

use thiserror::Error;

use crate::msg::{BUY_ORDER_NUM, SELL_ORDER_NUM};

/// A 32-byte order identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderId([u8; 32]);

impl OrderId {
    pub const LEN: usize = 32;

    /// Build an id from a wire byte slice. `None` unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for OrderId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Which side of the book an order rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Decode the wire side byte (1 = buy, 2 = sell).
    pub fn from_wire(side: u8) -> Option<Self> {
        match side {
            BUY_ORDER_NUM => Some(Side::Buy),
            SELL_ORDER_NUM => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Side::Buy => BUY_ORDER_NUM,
            Side::Sell => SELL_ORDER_NUM,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// A resting limit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub order_id: OrderId,
    pub side: Side,
    /// Base-asset units.
    pub quantity: u64,
    /// Quote units per base unit, in smallest denominations.
    pub rate: u64,
    /// Milliseconds since the epoch; zero when the server sent no timestamp
    /// (deltas carry none).
    pub time: u64,
}

/// One slice of a projected fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fill {
    pub order_id: OrderId,
    pub quantity: u64,
}

/// Errors raised by order book operations.
#[derive(Debug, Clone, Error)]
pub enum BookError {
    /// `apply_snapshot` on a book that already synced.
    #[error("order book is already synced")]
    AlreadySynced,

    /// The snapshot itself is unusable; the book stays unsynced.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// A note or snapshot for some other market reached this book.
    #[error("wrong market: book tracks '{expected}', message names '{got}'")]
    WrongMarket { expected: String, got: String },

    /// An order id of the wrong length.
    #[error("order id length is not {}: got {}", OrderId::LEN, .0)]
    InvalidOrderId(usize),

    /// An unknown side byte.
    #[error("unknown order side {0}")]
    InvalidSide(u8),

    /// A sequence gap: the server and this book have diverged.
    #[error("order book out of sync: expected seq {next}, got {got}")]
    OutOfSync { next: u64, got: u64 },

    /// Unbook note for an order this book never saw.
    #[error("no order found with id {0}")]
    NotFound(OrderId),

    /// Query on a book that has not synced yet.
    #[error("order book is unsynced")]
    Unsynced,

    /// The book diverged earlier and must be discarded and resubscribed.
    #[error("order book is poisoned")]
    Poisoned,
}

impl BookError {
    /// True when the book instance is unusable and the caller must discard
    /// it and request a fresh snapshot.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookError::OutOfSync { .. }
                | BookError::WrongMarket { .. }
                | BookError::NotFound(_)
                | BookError::Poisoned
        )
    }
}
