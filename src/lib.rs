//! # driftdex
//!
//! Client and server core for a non-custodial DEX that settles trades with
//! atomic cross-chain swaps.
//!
//! ## Modules
//!
//! The crate splits into two halves joined by a shared wire protocol:
//! - [`book`], [`core`], [`comms`], [`db`]: the client side. Per-market
//!   replicated order books fed by a snapshot plus sequence-numbered deltas
//!   over WebSocket, with persistence behind a narrow storage contract.
//! - [`asset`]: the server side. A block-aware UTXO backend that validates
//!   swap coins against a chain node and fans block arrivals out to
//!   subscribers.
//!
//! Plus the shared pieces:
//! - [`msg`]: the JSON message envelope and payload types.
//! - [`network`], [`config`]: chain parameters and TOML configuration.
//!
//! ## Quick start: tracking a market
//!
//! ```rust,ignore
//! use driftdex::core::{Core, CoreConfig};
//! use driftdex::db::MemDb;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let core = Core::new(CoreConfig::default(), Arc::new(MemDb::new()));
//!     let mut events = core.events().expect("events taken once");
//!     core.run().await;
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//! }
//! ```
//!
//! ## Quick start: validating a swap coin
//!
//! ```rust,ignore
//! use driftdex::asset::Backend;
//! use driftdex::network::Network;
//!
//! let (backend, sink) = Backend::new(node, Network::Mainnet, shutdown).await?;
//! let utxo = backend.coin(&coin_id, &redeem_script).await?;
//! println!("swappable value: {} atoms", utxo.value);
//! ```

/// Block-aware UTXO asset backend: coin validation, block cache, fanout.
pub mod asset;

/// Client-side order books: per-side storage and the replicated book.
pub mod book;

/// WebSocket link to a DEX server: trait consumed by the core plus the
/// tokio-tungstenite implementation.
pub mod comms;

/// TOML configuration for the node driver and the client core.
pub mod config;

/// Multi-DEX client core: connection lifecycle and message dispatch.
pub mod core;

/// Persistent storage contract consumed by the client core.
pub mod db;

/// Wire protocol: message envelope, routes, and payload types.
pub mod msg;

/// Chain network selector and per-network parameters.
pub mod network;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use driftdex::prelude::*;
/// ```
pub mod prelude {
    pub use crate::asset::{
        decode_coin_id, encode_coin_id, AssetError, Backend, BlockCache, ChainNode,
        NotificationSink, Utxo,
    };
    pub use crate::book::{BookError, Fill, Order, OrderBook, OrderId, Side};
    pub use crate::comms::{CommsError, DexLink, WsCfg, WsConn};
    pub use crate::config::Config;
    pub use crate::core::{Core, CoreConfig, CoreEvent};
    pub use crate::db::{AccountInfo, ClientDb, DbError, MatchRecord, MemDb, OrderRecord};
    pub use crate::msg::{Message, MessageKind};
    pub use crate::network::{ChainParams, Network};
}
