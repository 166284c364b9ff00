//! The UTXO backend: coin validation and block-event plumbing.
//!
//! Block notifications flow through a single serialization point: the node
//! driver's callback only enqueues the block hash, and one consumer task
//! performs the RPC, reconciles reorgs against the cache, and fans the new
//! height out to subscribers with non-blocking sends.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use super::cache::{BlockCache, CachedBlock};
use super::coin::{atoms_from_coins, decode_coin_id};
use super::node::{ChainNode, TxOutResult, VerboseTx};
use super::script::{
    check_address, extract_pkh, extract_script_hash, hash160, input_info, parse_script_type,
    pkh_address, INIT_TX_SIZE, TXIN_OVERHEAD,
};
use super::tx::{Tx, TxIn, TxOut, Utxo};
use super::{AssetError, Hash256};
use crate::network::{ChainParams, Network};

/// Capacity of the block-event queue. Way bigger than needed.
pub const BLOCK_QUEUE_CAPACITY: usize = 128;

/// The handle the node driver invokes on block arrival.
///
/// The driver's notification callback must not perform RPC; this handle
/// honors that by only enqueueing the hash for the backend's consumer task.
#[derive(Clone)]
pub struct NotificationSink {
    queue_tx: mpsc::Sender<Hash256>,
}

impl NotificationSink {
    /// Enqueue a connected block's hash. A full queue drops the event with
    /// an error log; the consumer will catch up from a later block.
    pub fn block_connected(&self, block_hash: Hash256) {
        match self.queue_tx.try_send(block_hash) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(hash)) => {
                tracing::error!("block queue full, dropping block {hash}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("block queue consumer gone");
            }
        }
    }
}

/// Asset backend for one UTXO chain. Fetches and validates unspent outputs,
/// caches block data, and distributes block arrivals.
pub struct Backend {
    node: Arc<dyn ChainNode>,
    cache: BlockCache,
    params: &'static ChainParams,
    block_subs: RwLock<Vec<mpsc::Sender<u32>>>,
}

impl Backend {
    /// Build the backend and spawn its block consumer. Returns the backend
    /// plus the notification sink to hand the node driver. Must be called
    /// within a tokio runtime.
    pub fn new(
        node: Arc<dyn ChainNode>,
        network: Network,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, NotificationSink) {
        let (queue_tx, queue_rx) = mpsc::channel(BLOCK_QUEUE_CAPACITY);
        let backend = Arc::new(Self {
            node,
            cache: BlockCache::new(),
            params: network.params(),
            block_subs: RwLock::new(Vec::new()),
        });
        tokio::spawn(run_queue(backend.clone(), queue_rx, shutdown));
        (backend, NotificationSink { queue_tx })
    }

    /// Max serialized size of a standardized swap initialization
    /// transaction.
    pub fn init_tx_size(&self) -> u32 {
        INIT_TX_SIZE
    }

    /// Whether `addr` parses as an address on this backend's network.
    pub fn check_address(&self, addr: &str) -> bool {
        check_address(addr, self.params)
    }

    /// A new channel of main-chain block heights. Sends are non-blocking:
    /// subscribers size `capacity` for their expected burst and tolerate
    /// gaps, reconciling on demand when they miss one.
    pub fn block_channel(&self, capacity: usize) -> mpsc::Receiver<u32> {
        let (tx, rx) = mpsc::channel(capacity);
        self.block_subs.write().push(tx);
        rx
    }

    /// Fetch and validate the unspent output a coin id points at, checking
    /// it against the spender's redeem script.
    ///
    /// Only spendable outputs with known script types come back: regular
    /// outputs immediately, coinbase and stake-tree outputs once they reach
    /// the network's coinbase maturity.
    pub async fn coin(&self, coin_id: &[u8], redeem_script: &[u8]) -> Result<Utxo, AssetError> {
        let (tx_hash, vout) = decode_coin_id(coin_id)?;
        self.utxo(&tx_hash, vout, redeem_script).await
    }

    /// Recipient address, value, and confirmations of an unspent P2PKH
    /// output. Any other script type is an error.
    pub async fn unspent_details(
        &self,
        txid: &str,
        vout: u32,
    ) -> Result<(String, u64, i64), AssetError> {
        let tx_hash = Hash256::from_hex(txid)?;
        let (txout, pk_script) = self.unspent_tx_out(&tx_hash, vout).await?;

        let script_type = parse_script_type(txout.script_pub_key.version, &pk_script);
        if !script_type.is_p2pkh() {
            return Err(AssetError::UnsupportedScript);
        }
        let pkh = extract_pkh(&pk_script)
            .ok_or_else(|| AssetError::Inconsistency("p2pkh script without pubkey hash".into()))?;

        let value = atoms_from_coins(txout.value)?;
        Ok((pkh_address(&pkh, self.params), value, txout.confirmations))
    }

    /// Build the reduced transaction record, deriving the fee rate from the
    /// value flow. Not cached: every call refetches.
    pub async fn transaction(&self, tx_hash: &Hash256) -> Result<Tx, AssetError> {
        let verbose = self.node.get_raw_transaction_verbose(tx_hash).await?;
        self.transaction_from_verbose(tx_hash, &verbose).await
    }

    /// The workhorse behind [`coin`](Self::coin).
    async fn utxo(
        &self,
        tx_hash: &Hash256,
        vout: u32,
        redeem_script: &[u8],
    ) -> Result<Utxo, AssetError> {
        let (txout, pk_script) = self.unspent_tx_out(tx_hash, vout).await?;
        let verbose_tx = self.node.get_raw_transaction_verbose(tx_hash).await?;

        let redeem = (!redeem_script.is_empty()).then_some(redeem_script);
        let info = input_info(txout.script_pub_key.version, &pk_script, redeem)?;
        let script_type = info.script_type;

        // A P2SH output must commit to the redeem script the spender holds.
        if script_type.is_p2sh() {
            let script_hash = extract_script_hash(&pk_script).ok_or_else(|| {
                AssetError::Inconsistency("p2sh script without extractable hash".into())
            })?;
            if hash160(redeem_script) != script_hash {
                return Err(AssetError::ScriptHashMismatch {
                    tx_hash: *tx_hash,
                    vout,
                });
            }
        }

        let mut height = 0u32;
        let mut block_hash = None;
        let mut last_lookup = None;
        if txout.confirmations > 0 {
            if verbose_tx.block_hash.is_empty() {
                return Err(AssetError::Inconsistency(format!(
                    "no block hash for output {tx_hash}:{vout} with {} confirmations",
                    txout.confirmations
                )));
            }
            let block = self.block_info(&verbose_tx.block_hash).await?;
            height = block.height;
            block_hash = Some(block.hash);
        } else {
            // Mempool outputs are taken as valid; remember the tip so later
            // revalidation can tell whether anything changed.
            last_lookup = self.cache.tip_hash();
        }

        let maturity = if script_type.is_stake() || txout.coinbase {
            self.params.coinbase_maturity
        } else {
            0
        };
        if txout.confirmations < maturity as i64 {
            return Err(AssetError::ImmatureOutput);
        }

        // Validates the value flow and caches the containing block.
        self.transaction_from_verbose(tx_hash, &verbose_tx).await?;

        Ok(Utxo {
            tx_hash: *tx_hash,
            vout,
            height,
            block_hash,
            maturity,
            script_type,
            pk_script,
            redeem_script: redeem.map(|r| r.to_vec()),
            num_required_sigs: info.required_sigs,
            spend_size: info.sig_script_size + TXIN_OVERHEAD,
            value: atoms_from_coins(txout.value)?,
            last_lookup,
        })
    }

    async fn transaction_from_verbose(
        &self,
        tx_hash: &Hash256,
        verbose: &VerboseTx,
    ) -> Result<Tx, AssetError> {
        // Stake transactions are recognizable by their tagged outputs.
        let mut is_stake = false;

        let mut block_hash = None;
        let mut last_lookup = None;
        if verbose.block_hash.is_empty() {
            last_lookup = self.cache.tip_hash();
        } else {
            let block = self.block_info(&verbose.block_hash).await?;
            block_hash = Some(block.hash);
        }

        let mut is_coinbase = false;
        let mut sum_in = 0u64;
        let mut inputs = Vec::with_capacity(verbose.vin.len());
        for input in &verbose.vin {
            if !input.coinbase.is_empty() {
                is_coinbase = true;
                continue;
            }
            sum_in = sum_in
                .checked_add(atoms_from_coins(input.amount_in)?)
                .ok_or_else(|| AssetError::Value("input sum overflow".into()))?;
            let prev_tx = Hash256::from_hex(&input.txid)?;
            inputs.push(TxIn {
                prev_tx,
                vout: input.vout,
            });
        }

        let mut sum_out = 0u64;
        let mut outputs = Vec::with_capacity(verbose.vout.len());
        for (vout, output) in verbose.vout.iter().enumerate() {
            let pk_script = hex::decode(&output.script_pub_key.hex).map_err(|_| {
                AssetError::Inconsistency(format!(
                    "undecodable pubkey script for output {tx_hash}:{vout}"
                ))
            })?;
            if parse_script_type(output.script_pub_key.version, &pk_script).is_stake() {
                is_stake = true;
            }
            let value = atoms_from_coins(output.value)?;
            sum_out = sum_out
                .checked_add(value)
                .ok_or_else(|| AssetError::Value("output sum overflow".into()))?;
            outputs.push(TxOut { value, pk_script });
        }

        let serialized_len = verbose.hex.len() / 2;
        if serialized_len == 0 {
            return Err(AssetError::Inconsistency(format!(
                "empty serialized transaction for {tx_hash}"
            )));
        }
        let fee_rate = if is_coinbase {
            0
        } else {
            // A negative fee means the node handed back corrupt data.
            sum_in
                .checked_sub(sum_out)
                .ok_or(AssetError::FeeUnderflow { tx_hash: *tx_hash })?
                / serialized_len as u64
        };

        Ok(Tx {
            hash: *tx_hash,
            block_hash,
            last_lookup,
            height: verbose.block_height,
            is_stake,
            is_coinbase,
            inputs,
            outputs,
            fee_rate,
        })
    }

    /// The unspent output and its decoded pubkey script, mempool included.
    async fn unspent_tx_out(
        &self,
        tx_hash: &Hash256,
        vout: u32,
    ) -> Result<(TxOutResult, Vec<u8>), AssetError> {
        let txout = self
            .node
            .get_tx_out(tx_hash, vout, true)
            .await?
            .ok_or(AssetError::NoUnspentOutput {
                tx_hash: *tx_hash,
                vout,
            })?;
        let pk_script = hex::decode(&txout.script_pub_key.hex).map_err(|_| {
            AssetError::Inconsistency(format!(
                "undecodable pubkey script for output {tx_hash}:{vout}"
            ))
        })?;
        Ok((txout, pk_script))
    }

    /// The main-chain block at `height`, from the cache or the node.
    /// `None` when nothing is mined there yet.
    pub async fn mainchain_block(&self, height: u32) -> Result<Option<CachedBlock>, AssetError> {
        if let Some(block) = self.cache.at_height(height) {
            return Ok(Some(block));
        }
        let hash = match self.node.get_block_hash(height).await {
            Ok(hash) => hash,
            // Likely not mined yet. Not an error.
            Err(_) => return Ok(None),
        };
        let verbose = self.node.get_block_verbose(&hash).await?;
        Ok(Some(self.cache.add(&verbose)?))
    }

    /// Block data by hash string, from the cache or the node.
    async fn block_info(&self, block_hash: &str) -> Result<CachedBlock, AssetError> {
        let hash = Hash256::from_hex(block_hash)?;
        if let Some(block) = self.cache.block(&hash) {
            return Ok(block);
        }
        let verbose = self.node.get_block_verbose(&hash).await?;
        self.cache.add(&verbose)
    }

    /// One block event: fetch, reconcile any reorg, install, fan out.
    async fn process_block(&self, block_hash: &Hash256) {
        tracing::debug!("processing new block {block_hash}");
        let verbose = match self.node.get_block_verbose(block_hash).await {
            Ok(verbose) => verbose,
            Err(err) => {
                tracing::error!("error retrieving block {block_hash}: {err}");
                return;
            }
        };

        if let (Some(tip), Ok(height)) = (self.cache.tip_height(), u32::try_from(verbose.height)) {
            if height <= tip {
                self.cache.reorg(&verbose);
            }
        }
        let block = match self.cache.add(&verbose) {
            Ok(block) => block,
            Err(err) => {
                tracing::error!("error adding block to cache: {err}");
                return;
            }
        };

        let mut any_closed = false;
        {
            let subs = self.block_subs.read();
            for sub in subs.iter() {
                match sub.try_send(block.height) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::error!("tried sending block update on a blocked channel");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => any_closed = true,
                }
            }
        }
        if any_closed {
            self.block_subs.write().retain(|sub| !sub.is_closed());
        }
    }
}

/// The serialization point: one consumer for block events and shutdown. On
/// cancellation the in-flight event finishes, then the node driver is shut
/// down.
async fn run_queue(
    backend: Arc<Backend>,
    mut queue_rx: mpsc::Receiver<Hash256>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            signal = queue_rx.recv() => {
                match signal {
                    Some(block_hash) => backend.process_block(&block_hash).await,
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    backend.node.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::coin::{encode_coin_id, COIN};
    use crate::asset::node::{NodeError, ScriptPubKeyResult, VerboseBlock, VinResult, VoutResult};
    use crate::asset::script::{p2pkh_script, p2sh_script};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct StubNode {
        utxos: parking_lot::Mutex<HashMap<(Hash256, u32), TxOutResult>>,
        txs: parking_lot::Mutex<HashMap<Hash256, VerboseTx>>,
        blocks: parking_lot::Mutex<HashMap<Hash256, VerboseBlock>>,
        shutdowns: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChainNode for StubNode {
        async fn get_tx_out(
            &self,
            tx_hash: &Hash256,
            vout: u32,
            _include_mempool: bool,
        ) -> Result<Option<TxOutResult>, NodeError> {
            Ok(self.utxos.lock().get(&(*tx_hash, vout)).cloned())
        }

        async fn get_raw_transaction_verbose(
            &self,
            tx_hash: &Hash256,
        ) -> Result<VerboseTx, NodeError> {
            self.txs
                .lock()
                .get(tx_hash)
                .cloned()
                .ok_or_else(|| NodeError::Rpc(format!("no tx {tx_hash}")))
        }

        async fn get_block_verbose(&self, block_hash: &Hash256) -> Result<VerboseBlock, NodeError> {
            self.blocks
                .lock()
                .get(block_hash)
                .cloned()
                .ok_or_else(|| NodeError::Rpc(format!("no block {block_hash}")))
        }

        async fn get_block_hash(&self, height: u32) -> Result<Hash256, NodeError> {
            let blocks = self.blocks.lock();
            blocks
                .values()
                .find(|b| b.height == height as i64 && b.confirmations >= 0)
                .map(|b| Hash256::from_hex(&b.hash).unwrap())
                .ok_or_else(|| NodeError::Rpc(format!("no block at {height}")))
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tx_hash(tag: u8) -> Hash256 {
        Hash256::from([tag; 32])
    }

    fn block_at(tag: u8, height: i64) -> VerboseBlock {
        VerboseBlock {
            hash: hex::encode([tag; 32]),
            height,
            confirmations: 1,
            previous_hash: hex::encode([tag.wrapping_sub(1); 32]),
        }
    }

    /// Install a confirmed output plus its transaction and block.
    fn install_utxo(
        node: &StubNode,
        tag: u8,
        vout: u32,
        pk_script: &[u8],
        confirmations: i64,
        coinbase: bool,
    ) -> Hash256 {
        let hash = tx_hash(tag);
        let block_tag = tag.wrapping_add(100);
        node.utxos.lock().insert(
            (hash, vout),
            TxOutResult {
                best_block: String::new(),
                confirmations,
                value: 1.5,
                script_pub_key: ScriptPubKeyResult {
                    hex: hex::encode(pk_script),
                    version: 0,
                    script_type: String::new(),
                },
                coinbase,
            },
        );
        let (block_hash, block_height) = if confirmations > 0 {
            let block = block_at(block_tag, 500);
            let block_hash = block.hash.clone();
            node.blocks
                .lock()
                .insert(Hash256::from_hex(&block_hash).unwrap(), block);
            (block_hash, 500)
        } else {
            (String::new(), 0)
        };
        node.txs.lock().insert(
            hash,
            VerboseTx {
                txid: hash.to_string(),
                hex: "00".repeat(250),
                block_hash,
                block_height,
                confirmations,
                vin: if coinbase {
                    vec![VinResult {
                        coinbase: "01".into(),
                        ..Default::default()
                    }]
                } else {
                    vec![VinResult {
                        coinbase: String::new(),
                        txid: tx_hash(tag.wrapping_add(50)).to_string(),
                        vout: 0,
                        amount_in: 2.0,
                    }]
                },
                vout: vec![VoutResult {
                    value: 1.5,
                    script_pub_key: ScriptPubKeyResult {
                        hex: hex::encode(pk_script),
                        version: 0,
                        script_type: String::new(),
                    },
                }],
            },
        );
        hash
    }

    fn backend_with(node: Arc<StubNode>) -> (Arc<Backend>, NotificationSink, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (backend, sink) = Backend::new(node, Network::Mainnet, shutdown_rx);
        (backend, sink, shutdown_tx)
    }

    #[tokio::test]
    async fn test_coin_p2pkh() {
        let node = Arc::new(StubNode::default());
        let hash = install_utxo(&node, 1, 0, &p2pkh_script(&[7; 20]), 3, false);
        let (backend, _sink, _shutdown) = backend_with(node);

        let utxo = backend.coin(&encode_coin_id(&hash, 0), &[]).await.unwrap();
        assert_eq!(utxo.tx_hash, hash);
        assert_eq!(utxo.vout, 0);
        assert_eq!(utxo.height, 500);
        assert!(utxo.block_hash.is_some());
        assert_eq!(utxo.maturity, 0);
        assert_eq!(utxo.script_type, crate::asset::ScriptType::P2pkh);
        assert_eq!(utxo.num_required_sigs, 1);
        assert_eq!(utxo.spend_size, 108 + TXIN_OVERHEAD);
        assert_eq!(utxo.value, COIN + COIN / 2);
        assert!(utxo.last_lookup.is_none());
    }

    #[tokio::test]
    async fn test_coin_rejects_bad_id() {
        let node = Arc::new(StubNode::default());
        let (backend, _sink, _shutdown) = backend_with(node);
        assert!(matches!(
            backend.coin(&[0; 35], &[]).await,
            Err(AssetError::InvalidCoinId(35))
        ));
    }

    #[tokio::test]
    async fn test_coin_spent_or_missing() {
        let node = Arc::new(StubNode::default());
        let (backend, _sink, _shutdown) = backend_with(node);
        let id = encode_coin_id(&tx_hash(9), 1);
        assert!(matches!(
            backend.coin(&id, &[]).await,
            Err(AssetError::NoUnspentOutput { vout: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_coin_p2sh_redeem_binding() {
        let node = Arc::new(StubNode::default());
        let redeem = vec![0x51, 0xac];
        let hash = install_utxo(&node, 2, 0, &p2sh_script(&hash160(&redeem)), 3, false);
        let (backend, _sink, _shutdown) = backend_with(node);
        let id = encode_coin_id(&hash, 0);

        // The wrong redeem script fails the hash binding.
        let err = backend.coin(&id, &[0x52, 0xac]).await.unwrap_err();
        assert!(matches!(err, AssetError::ScriptHashMismatch { .. }));

        // The right one passes and shows up on the utxo.
        let utxo = backend.coin(&id, &redeem).await.unwrap();
        assert!(utxo.script_type.is_p2sh());
        assert_eq!(utxo.redeem_script.as_deref(), Some(redeem.as_slice()));
    }

    #[tokio::test]
    async fn test_coin_unsupported_script() {
        let node = Arc::new(StubNode::default());
        let hash = install_utxo(&node, 3, 0, &[0xac], 3, false);
        let (backend, _sink, _shutdown) = backend_with(node);
        assert!(matches!(
            backend.coin(&encode_coin_id(&hash, 0), &[]).await,
            Err(AssetError::UnsupportedScript)
        ));
    }

    #[tokio::test]
    async fn test_coin_coinbase_maturity() {
        let node = Arc::new(StubNode::default());
        let maturity = Network::Mainnet.params().coinbase_maturity as i64;
        let young = install_utxo(&node, 4, 0, &p2pkh_script(&[7; 20]), maturity - 1, true);
        let ripe = install_utxo(&node, 5, 0, &p2pkh_script(&[7; 20]), maturity, true);
        let (backend, _sink, _shutdown) = backend_with(node);

        assert!(matches!(
            backend.coin(&encode_coin_id(&young, 0), &[]).await,
            Err(AssetError::ImmatureOutput)
        ));
        let utxo = backend.coin(&encode_coin_id(&ripe, 0), &[]).await.unwrap();
        assert_eq!(utxo.maturity, maturity as u32);
    }

    #[tokio::test]
    async fn test_coin_stake_maturity() {
        let node = Arc::new(StubNode::default());
        let mut stake_script = vec![0xba];
        stake_script.extend_from_slice(&p2pkh_script(&[7; 20]));
        let hash = install_utxo(&node, 6, 0, &stake_script, 2, false);
        let (backend, _sink, _shutdown) = backend_with(node);

        assert!(matches!(
            backend.coin(&encode_coin_id(&hash, 0), &[]).await,
            Err(AssetError::ImmatureOutput)
        ));
    }

    #[tokio::test]
    async fn test_mempool_coin_records_tip() {
        let node = Arc::new(StubNode::default());
        let hash = install_utxo(&node, 7, 0, &p2pkh_script(&[7; 20]), 0, false);
        let tip = block_at(200, 600);
        let tip_hash = Hash256::from_hex(&tip.hash).unwrap();
        node.blocks.lock().insert(tip_hash, tip);

        let (backend, sink, _shutdown) = backend_with(node);
        let mut heights = backend.block_channel(4);
        sink.block_connected(tip_hash);
        tokio::time::timeout(Duration::from_secs(5), heights.recv())
            .await
            .expect("block event")
            .expect("open channel");

        let utxo = backend.coin(&encode_coin_id(&hash, 0), &[]).await.unwrap();
        assert_eq!(utxo.height, 0);
        assert!(utxo.block_hash.is_none());
        assert_eq!(utxo.last_lookup, Some(tip_hash));
    }

    #[tokio::test]
    async fn test_unspent_details_p2pkh_only() {
        let node = Arc::new(StubNode::default());
        let pkh = [9; 20];
        let good = install_utxo(&node, 8, 0, &p2pkh_script(&pkh), 2, false);
        let bad = install_utxo(&node, 9, 0, &p2sh_script(&[1; 20]), 2, false);
        let (backend, _sink, _shutdown) = backend_with(node);

        let (addr, value, confirmations) = backend
            .unspent_details(&good.to_string(), 0)
            .await
            .unwrap();
        assert_eq!(addr, pkh_address(&pkh, Network::Mainnet.params()));
        assert_eq!(value, COIN + COIN / 2);
        assert_eq!(confirmations, 2);

        assert!(matches!(
            backend.unspent_details(&bad.to_string(), 0).await,
            Err(AssetError::UnsupportedScript)
        ));
    }

    #[tokio::test]
    async fn test_transaction_fee_rate() {
        let node = Arc::new(StubNode::default());
        let hash = install_utxo(&node, 10, 0, &p2pkh_script(&[7; 20]), 2, false);
        let (backend, _sink, _shutdown) = backend_with(node);

        // 2.0 in, 1.5 out, 250 serialized bytes.
        let tx = backend.transaction(&hash).await.unwrap();
        assert!(!tx.is_coinbase);
        assert_eq!(tx.fee_rate, (COIN / 2) / 250);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, COIN + COIN / 2);
    }

    #[tokio::test]
    async fn test_transaction_fee_underflow_fails_loudly() {
        let node = Arc::new(StubNode::default());
        let hash = install_utxo(&node, 11, 0, &p2pkh_script(&[7; 20]), 2, false);
        node.txs.lock().get_mut(&hash).unwrap().vin[0].amount_in = 1.0;
        let (backend, _sink, _shutdown) = backend_with(node);

        assert!(matches!(
            backend.transaction(&hash).await,
            Err(AssetError::FeeUnderflow { .. })
        ));
    }

    #[tokio::test]
    async fn test_coinbase_fee_rate_zero() {
        let node = Arc::new(StubNode::default());
        let maturity = Network::Mainnet.params().coinbase_maturity as i64;
        let hash = install_utxo(&node, 12, 0, &p2pkh_script(&[7; 20]), maturity, true);
        let (backend, _sink, _shutdown) = backend_with(node);

        let tx = backend.transaction(&hash).await.unwrap();
        assert!(tx.is_coinbase);
        assert_eq!(tx.fee_rate, 0);
    }

    #[tokio::test]
    async fn test_block_events_fan_out_in_order() {
        let node = Arc::new(StubNode::default());
        for (tag, height) in [(50u8, 700i64), (51, 701)] {
            let block = block_at(tag, height);
            node.blocks
                .lock()
                .insert(Hash256::from_hex(&block.hash).unwrap(), block);
        }
        let (backend, sink, _shutdown) = backend_with(node);
        let mut heights = backend.block_channel(8);

        sink.block_connected(tx_hash(50));
        sink.block_connected(tx_hash(51));

        let first = tokio::time::timeout(Duration::from_secs(5), heights.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), heights.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((first, second), (700, 701));
        assert_eq!(backend.cache.tip_height(), Some(701));
    }

    #[tokio::test]
    async fn test_reorg_block_reconciles_cache() {
        let node = Arc::new(StubNode::default());
        for (tag, height) in [(50u8, 700i64), (51, 701), (52, 702)] {
            let block = block_at(tag, height);
            node.blocks
                .lock()
                .insert(Hash256::from_hex(&block.hash).unwrap(), block);
        }
        // A competing block back at height 701.
        let fork = block_at(99, 701);
        node.blocks
            .lock()
            .insert(Hash256::from_hex(&fork.hash).unwrap(), fork);

        let (backend, sink, _shutdown) = backend_with(node);
        let mut heights = backend.block_channel(8);
        for tag in [50, 51, 52, 99] {
            sink.block_connected(tx_hash(tag));
        }
        for _ in 0..4 {
            tokio::time::timeout(Duration::from_secs(5), heights.recv())
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(backend.cache.tip_height(), Some(701));
        assert_eq!(
            backend.cache.at_height(701).unwrap().hash,
            tx_hash(99),
        );
        assert_eq!(backend.cache.at_height(702), None);
    }

    #[tokio::test]
    async fn test_slow_subscriber_dropped_not_blocking() {
        let node = Arc::new(StubNode::default());
        for (tag, height) in [(50u8, 700i64), (51, 701)] {
            let block = block_at(tag, height);
            node.blocks
                .lock()
                .insert(Hash256::from_hex(&block.hash).unwrap(), block);
        }
        let (backend, sink, _shutdown) = backend_with(node);
        // Capacity one: the second update has nowhere to go and is dropped.
        let mut heights = backend.block_channel(1);

        sink.block_connected(tx_hash(50));
        sink.block_connected(tx_hash(51));

        // The cache still advanced even though the subscriber missed 701.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while backend.cache.tip_height() != Some(701) {
            assert!(tokio::time::Instant::now() < deadline, "consumer stalled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(heights.recv().await, Some(700));
    }

    #[tokio::test]
    async fn test_mainchain_block_lookup() {
        let node = Arc::new(StubNode::default());
        let block = block_at(50, 700);
        node.blocks
            .lock()
            .insert(Hash256::from_hex(&block.hash).unwrap(), block);
        let (backend, _sink, _shutdown) = backend_with(node);

        let found = backend.mainchain_block(700).await.unwrap().unwrap();
        assert_eq!(found.height, 700);
        // Second lookup is answered by the cache.
        assert_eq!(backend.cache.at_height(700), Some(found));
        // Nothing mined at 701 yet.
        assert!(backend.mainchain_block(701).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_reaches_node() {
        let node = Arc::new(StubNode::default());
        let (_backend, _sink, shutdown_tx) = backend_with(node.clone());

        shutdown_tx.send(true).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while node.shutdowns.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline, "no shutdown call");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
