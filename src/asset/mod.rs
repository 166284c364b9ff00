//! The asset backend for a UTXO chain.
//!
//! [`Backend`] answers the matching layer's questions about swap coins:
//! unspent, mature, of a known script type, bound to the supplied redeem
//! script. A single consumer task serializes block arrivals from the
//! node, reconciles reorgs against the [`BlockCache`], and fans new heights
//! out to subscribers.

mod backend;
mod cache;
mod coin;
mod node;
mod script;
mod tx;

pub use backend::{Backend, NotificationSink, BLOCK_QUEUE_CAPACITY};
pub use cache::{BlockCache, CachedBlock};
pub use coin::{
    atoms_from_coins, decode_coin_id, encode_coin_id, from_atoms, to_atoms, COIN, COIN_ID_LEN,
};
pub use node::{
    ChainNode, NodeError, ScriptPubKeyResult, TxOutResult, VerboseBlock, VerboseTx, VinResult,
    VoutResult,
};
pub use script::{
    check_address, hash160, input_info, p2pkh_script, p2sh_script, parse_script_type, pkh_address,
    InputInfo, ScriptType, CURRENT_SCRIPT_VERSION, INIT_TX_SIZE, P2PKH_SIG_SCRIPT_SIZE,
    TXIN_OVERHEAD,
};
pub use tx::{Tx, TxIn, TxOut, Utxo};

use std::fmt;

use thiserror::Error;

/// A 32-byte transaction or block hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    pub const LEN: usize = 32;

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, AssetError> {
        let bytes = hex::decode(s).map_err(|_| AssetError::InvalidHash(s.to_string()))?;
        Self::from_slice(&bytes).ok_or_else(|| AssetError::InvalidHash(s.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Asset-backend errors.
#[derive(Debug, Error)]
pub enum AssetError {
    /// A coin id that is not 36 bytes.
    #[error("coin id wrong length: expected {COIN_ID_LEN}, got {0}")]
    InvalidCoinId(usize),

    /// A hash field that does not decode to 32 bytes.
    #[error("invalid hash '{0}'")]
    InvalidHash(String),

    /// The output is spent or was never created.
    #[error("no unspent output found for {tx_hash}:{vout}")]
    NoUnspentOutput { tx_hash: Hash256, vout: u32 },

    /// The pubkey script is not a type this backend can redeem.
    #[error("unsupported script type")]
    UnsupportedScript,

    /// A P2SH output whose script hash does not commit to the supplied
    /// redeem script.
    #[error("script hash check failed for utxo {tx_hash}:{vout}")]
    ScriptHashMismatch { tx_hash: Hash256, vout: u32 },

    /// A P2SH output offered without its redeem script.
    #[error("redeem script required for pay-to-script-hash output")]
    RedeemScriptRequired,

    /// The output has not reached its required confirmation count. Callers
    /// may retry later; the coin itself is fine.
    #[error("immature output")]
    ImmatureOutput,

    /// A value that cannot be represented in atoms.
    #[error("invalid value: {0}")]
    Value(String),

    /// Inputs sum below outputs. The node handed back corrupt data.
    #[error("transaction {tx_hash} pays out more than it takes in")]
    FeeUnderflow { tx_hash: Hash256 },

    /// The node's answers disagree with each other or with the cache.
    #[error("chain data inconsistency: {0}")]
    Inconsistency(String),

    #[error("node error: {0}")]
    Node(#[from] NodeError),
}
