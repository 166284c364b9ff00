//! Persistent storage contract consumed by the client core.
//!
//! The core does not care how records hit disk: an embedded key-value store
//! file in production, [`MemDb`] in tests. Updates are blind overwrites:
//! whatever is stored for a key is replaced without indication.

mod mem;

pub use mem::MemDb;

use thiserror::Error;

use crate::book::{OrderId, Side};

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Account information for one DEX. The store keeps a single account per
/// DEX, so the URL uniquely identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub url: String,
    /// The account's public key registered with the DEX.
    pub pubkey: Vec<u8>,
    /// The DEX server's public key.
    pub dex_pubkey: Vec<u8>,
}

/// Lifecycle states of a tracked order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Queued in the current epoch, not yet booked.
    Epoch,
    /// Resting on the book.
    Booked,
    Executed,
    Canceled,
}

impl OrderStatus {
    /// Active orders are in the epoch queue or on the book.
    pub fn is_active(&self) -> bool {
        matches!(self, OrderStatus::Epoch | OrderStatus::Booked)
    }
}

/// A tracked order with its placement metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub dex: String,
    pub base: u32,
    pub quote: u32,
    pub side: Side,
    pub quantity: u64,
    pub rate: u64,
    /// Creation time, milliseconds since the epoch.
    pub time: u64,
    pub status: OrderStatus,
}

/// Lifecycle states of a match negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    NewlyMatched,
    MakerSwapCast,
    TakerSwapCast,
    MakerRedeemed,
    Complete,
}

impl MatchStatus {
    /// Every state except [`Complete`](MatchStatus::Complete) is active.
    pub fn is_active(&self) -> bool {
        !matches!(self, MatchStatus::Complete)
    }
}

/// A tracked match with its settlement progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRecord {
    pub match_id: [u8; 32],
    pub order_id: OrderId,
    pub status: MatchStatus,
    pub quantity: u64,
    pub rate: u64,
    pub time: u64,
}

/// The contract any backing store must satisfy.
pub trait ClientDb: Send + Sync {
    /// All known DEX URLs.
    fn list_accounts(&self) -> Result<Vec<String>, DbError>;

    /// The account registered with the DEX at `url`, if any.
    fn account(&self, url: &str) -> Result<Option<AccountInfo>, DbError>;

    /// Save an account. Overwrites any existing account for the same URL.
    fn create_account(&self, account: &AccountInfo) -> Result<(), DbError>;

    /// Save an order. Any existing record for the id is overwritten without
    /// indication.
    fn update_order(&self, order: &OrderRecord) -> Result<(), DbError>;

    /// Fetch one order by id.
    fn order(&self, order_id: &OrderId) -> Result<Option<OrderRecord>, DbError>;

    /// All orders that appear to be active: in the epoch queue or booked.
    fn active_orders(&self) -> Result<Vec<OrderRecord>, DbError>;

    /// Orders for one DEX, newest first. `n = 0` applies no count limit;
    /// `since = 0` disables the time filter (no order predates 1970).
    fn account_orders(&self, dex: &str, n: usize, since: u64) -> Result<Vec<OrderRecord>, DbError>;

    /// Orders for one market on one DEX, newest first, with the same `n` and
    /// `since` semantics as [`account_orders`](Self::account_orders).
    fn market_orders(
        &self,
        dex: &str,
        base: u32,
        quote: u32,
        n: usize,
        since: u64,
    ) -> Result<Vec<OrderRecord>, DbError>;

    /// Save a match. Any existing record for the id is overwritten without
    /// indication.
    fn update_match(&self, m: &MatchRecord) -> Result<(), DbError>;

    /// All matches in an active state (anything but complete).
    fn active_matches(&self) -> Result<Vec<MatchRecord>, DbError>;
}
