//! Coin-id codec and atom conversion.
//!
//! A coin id is the 36-byte concatenation of a transaction hash and the
//! output index as a big-endian u32. Atom conversion uses exact decimal
//! arithmetic; node values arrive as whole-coin floats.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use super::{AssetError, Hash256};

/// Atoms per whole coin.
pub const COIN: u64 = 100_000_000;

/// Length of an encoded coin id.
pub const COIN_ID_LEN: usize = 36;

/// Encode `(tx_hash, vout)` as a coin id.
pub fn encode_coin_id(tx_hash: &Hash256, vout: u32) -> Vec<u8> {
    let mut id = Vec::with_capacity(COIN_ID_LEN);
    id.extend_from_slice(tx_hash.as_bytes());
    id.extend_from_slice(&vout.to_be_bytes());
    id
}

/// Decode a coin id into its transaction hash and output index.
pub fn decode_coin_id(coin_id: &[u8]) -> Result<(Hash256, u32), AssetError> {
    if coin_id.len() != COIN_ID_LEN {
        return Err(AssetError::InvalidCoinId(coin_id.len()));
    }
    let mut hash_bytes = [0u8; 32];
    hash_bytes.copy_from_slice(&coin_id[..32]);
    let mut vout_bytes = [0u8; 4];
    vout_bytes.copy_from_slice(&coin_id[32..]);
    Ok((Hash256::from(hash_bytes), u32::from_be_bytes(vout_bytes)))
}

/// Convert a whole-coin decimal value to atoms, rounding half away from
/// zero the way the node reports values.
pub fn to_atoms(value: Decimal) -> Result<u64, AssetError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(AssetError::Value(format!("negative value {value}")));
    }
    let atoms = value
        .checked_mul(Decimal::from(COIN))
        .ok_or_else(|| AssetError::Value(format!("value {value} overflows atoms")))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    atoms
        .to_u64()
        .ok_or_else(|| AssetError::Value(format!("value {value} does not fit in u64 atoms")))
}

/// The exact whole-coin decimal for an atom count.
pub fn from_atoms(atoms: u64) -> Decimal {
    Decimal::from_i128_with_scale(atoms as i128, 8).normalize()
}

/// Convert a node-reported float of whole coins to atoms.
pub fn atoms_from_coins(value: f64) -> Result<u64, AssetError> {
    let decimal = Decimal::from_f64_retain(value)
        .ok_or_else(|| AssetError::Value(format!("unrepresentable value {value}")))?;
    to_atoms(decimal)
}
