//! Pubkey-script classification, script hashing, and input sizing.
//!
//! Recognized output types are pay-to-pubkey-hash and pay-to-script-hash,
//! in both regular and stake-tagged flavors. Everything else classifies as
//! unsupported and is rejected before any value math happens.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use super::AssetError;
use crate::network::ChainParams;

const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_DATA_20: u8 = 0x14;
const OP_DATA_33: u8 = 0x21;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

// Stake-tree outputs carry a leading tag opcode ahead of an otherwise
// standard script.
const OP_SSTX: u8 = 0xba;
const OP_SSTXCHANGE: u8 = 0xbd;

/// The only script version this backend understands.
pub const CURRENT_SCRIPT_VERSION: u16 = 0;

/// Serialized input overhead beyond the signature script: the previous
/// outpoint, sequence, and value/height/index fields.
pub const TXIN_OVERHEAD: u32 = 57;

/// A max-length DER signature plus its push opcode.
const SIG_PUSH_SIZE: u32 = 74;

/// Signature script size for a P2PKH spend: signature push plus a 33-byte
/// compressed pubkey push.
pub const P2PKH_SIG_SCRIPT_SIZE: u32 = 108;

/// Max serialized size of a standardized atomic swap initialization
/// transaction: one P2PKH input funding a contract output plus change.
pub const INIT_TX_SIZE: u32 = 545;

/// Classification of an output's pubkey script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    P2pkh,
    P2sh,
    StakeP2pkh,
    StakeP2sh,
    Unsupported,
}

impl ScriptType {
    pub fn is_p2pkh(&self) -> bool {
        matches!(self, ScriptType::P2pkh | ScriptType::StakeP2pkh)
    }

    pub fn is_p2sh(&self) -> bool {
        matches!(self, ScriptType::P2sh | ScriptType::StakeP2sh)
    }

    /// Stake-tree outputs mature like coinbase outputs.
    pub fn is_stake(&self) -> bool {
        matches!(self, ScriptType::StakeP2pkh | ScriptType::StakeP2sh)
    }
}

/// RIPEMD160(SHA256(data)), the script- and pubkey-hash function.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    ripe.into()
}

/// Classify a pubkey script under the given script version.
pub fn parse_script_type(version: u16, pk_script: &[u8]) -> ScriptType {
    if version != CURRENT_SCRIPT_VERSION {
        return ScriptType::Unsupported;
    }
    match pk_script.first() {
        Some(&tag) if (OP_SSTX..=OP_SSTXCHANGE).contains(&tag) => {
            match classify(&pk_script[1..]) {
                ScriptType::P2pkh => ScriptType::StakeP2pkh,
                ScriptType::P2sh => ScriptType::StakeP2sh,
                _ => ScriptType::Unsupported,
            }
        }
        Some(_) => classify(pk_script),
        None => ScriptType::Unsupported,
    }
}

fn classify(script: &[u8]) -> ScriptType {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == OP_DATA_20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return ScriptType::P2pkh;
    }
    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == OP_DATA_20 && script[22] == OP_EQUAL {
        return ScriptType::P2sh;
    }
    ScriptType::Unsupported
}

/// The 20-byte script hash committed to by a P2SH output.
pub fn extract_script_hash(pk_script: &[u8]) -> Option<[u8; 20]> {
    let script = strip_stake_tag(pk_script);
    if classify(script) != ScriptType::P2sh {
        return None;
    }
    script[2..22].try_into().ok()
}

/// The 20-byte pubkey hash committed to by a P2PKH output.
pub fn extract_pkh(pk_script: &[u8]) -> Option<[u8; 20]> {
    let script = strip_stake_tag(pk_script);
    if classify(script) != ScriptType::P2pkh {
        return None;
    }
    script[3..23].try_into().ok()
}

fn strip_stake_tag(pk_script: &[u8]) -> &[u8] {
    match pk_script.first() {
        Some(&tag) if (OP_SSTX..=OP_SSTXCHANGE).contains(&tag) => &pk_script[1..],
        _ => pk_script,
    }
}

/// What it takes to spend an output: its type, how many signatures, and the
/// estimated signature script size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    pub script_type: ScriptType,
    pub required_sigs: u32,
    pub sig_script_size: u32,
}

/// Analyze a pubkey script against the redeem script the spender supplies.
/// P2SH outputs require the redeem script; multisig redeem scripts set the
/// signature count.
pub fn input_info(
    version: u16,
    pk_script: &[u8],
    redeem_script: Option<&[u8]>,
) -> Result<InputInfo, AssetError> {
    let script_type = parse_script_type(version, pk_script);
    match script_type {
        ScriptType::Unsupported => Err(AssetError::UnsupportedScript),
        ScriptType::P2pkh | ScriptType::StakeP2pkh => Ok(InputInfo {
            script_type,
            required_sigs: 1,
            sig_script_size: P2PKH_SIG_SCRIPT_SIZE,
        }),
        ScriptType::P2sh | ScriptType::StakeP2sh => {
            let redeem = redeem_script
                .filter(|r| !r.is_empty())
                .ok_or(AssetError::RedeemScriptRequired)?;
            let required_sigs = match parse_multisig(redeem) {
                Some((m, _n)) => m,
                None => 1,
            };
            let redeem_push = push_data_size(redeem.len()) + redeem.len() as u32;
            Ok(InputInfo {
                script_type,
                required_sigs,
                sig_script_size: required_sigs * SIG_PUSH_SIZE + redeem_push,
            })
        }
    }
}

/// Parse an m-of-n multisig redeem script, returning `(m, n)`.
fn parse_multisig(redeem: &[u8]) -> Option<(u32, u32)> {
    if redeem.len() < 3 {
        return None;
    }
    let m_op = redeem[0];
    let n_op = redeem[redeem.len() - 2];
    if !(OP_1..=OP_16).contains(&m_op) || !(OP_1..=OP_16).contains(&n_op) {
        return None;
    }
    if redeem[redeem.len() - 1] != OP_CHECKMULTISIG {
        return None;
    }

    let n = (n_op - OP_1 + 1) as u32;
    // Between the two count opcodes: n pushes of 33-byte compressed pubkeys.
    let keys_end = redeem.len() - 2;
    let mut at = 1;
    let mut keys = 0u32;
    while at < keys_end {
        if redeem[at] != OP_DATA_33 || at + 34 > keys_end {
            return None;
        }
        at += 34;
        keys += 1;
    }
    if keys != n {
        return None;
    }

    let m = (m_op - OP_1 + 1) as u32;
    (m <= n).then_some((m, n))
}

fn push_data_size(len: usize) -> u32 {
    match len {
        0..=75 => 1,
        76..=255 => 2,
        256..=65_535 => 3,
        _ => 5,
    }
}

/// Check-encode a pubkey hash as an address for the given network.
pub fn pkh_address(pkh: &[u8; 20], params: &ChainParams) -> String {
    let mut payload = Vec::with_capacity(22);
    payload.extend_from_slice(&params.p2pkh_addr_id);
    payload.extend_from_slice(pkh);
    bs58::encode(payload).with_check().into_string()
}

/// True when `addr` check-decodes to a hash under one of this network's
/// address versions.
pub fn check_address(addr: &str, params: &ChainParams) -> bool {
    let Ok(payload) = bs58::decode(addr).with_check(None).into_vec() else {
        return false;
    };
    if payload.len() != 22 {
        return false;
    }
    let version = [payload[0], payload[1]];
    version == params.p2pkh_addr_id || version == params.p2sh_addr_id
}

/// Assemble a P2PKH pubkey script. Test scaffolding for the backend's
/// classification paths.
pub fn p2pkh_script(pkh: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[OP_DUP, OP_HASH160, OP_DATA_20]);
    script.extend_from_slice(pkh);
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

/// Assemble a P2SH pubkey script.
pub fn p2sh_script(script_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.extend_from_slice(&[OP_HASH160, OP_DATA_20]);
    script.extend_from_slice(script_hash);
    script.push(OP_EQUAL);
    script
}
