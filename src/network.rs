//! Chain network selector and per-network consensus parameters.

use serde::Deserialize;

/// The chain network a node is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Simnet,
}

impl Network {
    /// Consensus parameters for this network.
    pub fn params(&self) -> &'static ChainParams {
        match self {
            Network::Mainnet => &MAINNET_PARAMS,
            Network::Testnet => &TESTNET_PARAMS,
            Network::Simnet => &SIMNET_PARAMS,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Simnet => write!(f, "simnet"),
        }
    }
}

/// The subset of consensus parameters the backend needs.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub name: &'static str,
    /// Confirmations a coinbase or stake-tree output needs before it spends.
    pub coinbase_maturity: u32,
    /// Two-byte version prefix for pay-to-pubkey-hash addresses.
    pub p2pkh_addr_id: [u8; 2],
    /// Two-byte version prefix for pay-to-script-hash addresses.
    pub p2sh_addr_id: [u8; 2],
}

pub static MAINNET_PARAMS: ChainParams = ChainParams {
    name: "mainnet",
    coinbase_maturity: 256,
    p2pkh_addr_id: [0x07, 0x3f],
    p2sh_addr_id: [0x07, 0x1a],
};

pub static TESTNET_PARAMS: ChainParams = ChainParams {
    name: "testnet",
    coinbase_maturity: 16,
    p2pkh_addr_id: [0x0f, 0x21],
    p2sh_addr_id: [0x0e, 0xfc],
};

pub static SIMNET_PARAMS: ChainParams = ChainParams {
    name: "simnet",
    coinbase_maturity: 16,
    p2pkh_addr_id: [0x0e, 0x91],
    p2sh_addr_id: [0x0e, 0x6c],
};
