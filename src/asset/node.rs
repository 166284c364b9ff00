//! The chain-node driver abstraction.
//!
//! In production this is a JSON-RPC client for the chain daemon; tests use a
//! stub. The backend needs exactly four queries plus a shutdown.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use super::Hash256;

/// Node-driver errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("response decode error: {0}")]
    Decode(String),

    #[error("node connection lost")]
    Disconnected,
}

/// The `scriptPubKey` object attached to outputs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptPubKeyResult {
    pub hex: String,
    #[serde(default)]
    pub version: u16,
    #[serde(rename = "type", default)]
    pub script_type: String,
}

/// Result of the unspent-output query.
#[derive(Debug, Clone, Deserialize)]
pub struct TxOutResult {
    #[serde(rename = "bestblock", default)]
    pub best_block: String,
    pub confirmations: i64,
    /// Whole coins, as the node reports values.
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKeyResult,
    #[serde(default)]
    pub coinbase: bool,
}

/// One input of a verbose transaction.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VinResult {
    /// Non-empty only on the coinbase input.
    #[serde(default)]
    pub coinbase: String,
    #[serde(default)]
    pub txid: String,
    #[serde(default)]
    pub vout: u32,
    #[serde(rename = "amountin", default)]
    pub amount_in: f64,
}

/// One output of a verbose transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct VoutResult {
    pub value: f64,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKeyResult,
}

/// The verbose raw-transaction result.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTx {
    pub txid: String,
    /// The serialized transaction, hex encoded.
    pub hex: String,
    #[serde(rename = "blockhash", default)]
    pub block_hash: String,
    #[serde(rename = "blockheight", default)]
    pub block_height: i64,
    #[serde(default)]
    pub confirmations: i64,
    pub vin: Vec<VinResult>,
    pub vout: Vec<VoutResult>,
}

/// The verbose block result.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseBlock {
    pub hash: String,
    pub height: i64,
    /// Negative for blocks that are no longer on the main chain.
    pub confirmations: i64,
    #[serde(rename = "previousblockhash", default)]
    pub previous_hash: String,
}

/// A blockchain information fetcher. In practice this is the chain daemon's
/// RPC client; for testing it can be a stub.
#[async_trait]
pub trait ChainNode: Send + Sync {
    /// The unspent output at `(tx_hash, vout)`, or `None` when it is spent
    /// or nonexistent. `include_mempool` extends the search to unconfirmed
    /// transactions.
    async fn get_tx_out(
        &self,
        tx_hash: &Hash256,
        vout: u32,
        include_mempool: bool,
    ) -> Result<Option<TxOutResult>, NodeError>;

    /// The decoded transaction with input and output detail.
    async fn get_raw_transaction_verbose(&self, tx_hash: &Hash256)
        -> Result<VerboseTx, NodeError>;

    /// The decoded block header data for `block_hash`.
    async fn get_block_verbose(&self, block_hash: &Hash256) -> Result<VerboseBlock, NodeError>;

    /// The main-chain block hash at `height`.
    async fn get_block_hash(&self, height: u32) -> Result<Hash256, NodeError>;

    /// Release the node connection. Called once by the backend's consumer on
    /// cancellation.
    fn shutdown(&self);
}
