//! Reduced transaction and UTXO records handed to the matching layer.

use super::{encode_coin_id, Hash256, ScriptType};

/// A previous-outpoint reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prev_tx: Hash256,
    pub vout: u32,
}

/// One output's value and script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Atoms.
    pub value: u64,
    pub pk_script: Vec<u8>,
}

/// A reduced transaction record, recomputed on demand and never cached.
#[derive(Debug, Clone)]
pub struct Tx {
    pub hash: Hash256,
    /// The containing block, or `None` while in the mempool.
    pub block_hash: Option<Hash256>,
    /// For mempool transactions, the chain tip at lookup time. Enables a
    /// cheap staleness check without another lookup.
    pub last_lookup: Option<Hash256>,
    pub height: i64,
    pub is_stake: bool,
    pub is_coinbase: bool,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// Atoms per serialized byte; zero for coinbase.
    pub fee_rate: u64,
}

/// A validated unspent output. Constructed per lookup and never mutated;
/// callers fetch a fresh instance to revalidate.
#[derive(Debug, Clone)]
pub struct Utxo {
    pub tx_hash: Hash256,
    pub vout: u32,
    /// Height of the containing block; zero while in the mempool.
    pub height: u32,
    /// The containing block, or `None` while in the mempool.
    pub block_hash: Option<Hash256>,
    /// Confirmations required before the output can be spent.
    pub maturity: u32,
    pub script_type: ScriptType,
    pub pk_script: Vec<u8>,
    pub redeem_script: Option<Vec<u8>>,
    pub num_required_sigs: u32,
    /// Estimated serialized size of the spending input, in bytes.
    pub spend_size: u32,
    /// Atoms.
    pub value: u64,
    /// The chain tip at lookup time for mempool outputs.
    pub last_lookup: Option<Hash256>,
}

impl Utxo {
    /// The 36-byte coin id for this output.
    pub fn coin_id(&self) -> Vec<u8> {
        encode_coin_id(&self.tx_hash, self.vout)
    }
}
