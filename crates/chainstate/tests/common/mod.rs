#![allow(dead_code)]

use std::collections::BTreeMap;

use crossbeam_channel::Receiver;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use utxod_chainstate::address_index::AddressEncoder;
use utxod_chainstate::{Branch, ChainEvent, EngineError, EngineOptions, ValidationEngine};
use utxod_consensus::money::COIN;
use utxod_consensus::{chain_params, ChainParams, Hash256, Network};
use utxod_pow::difficulty::check_proof_of_work;
use utxod_primitives::block::{Block, BlockHeader};
use utxod_primitives::hash::hash160;
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_script::sighash::{signature_hash, SIGHASH_ALL};
use utxod_script::standard::p2pkh_script;
use utxod_script::verify::SignatureChecker;
use utxod_storage::memory::MemoryStore;

pub const GENESIS_TIME: u32 = 1_400_000_000;
pub const SPACING: u32 = 600;
pub const SUBSIDY: i64 = 50 * COIN;
pub const MATURITY: u32 = 2;
pub const BITS: u32 = 0x207f_ffff;

pub type Engine = ValidationEngine<MemoryStore, SignatureChecker>;

pub struct Wallet {
    secret: SecretKey,
    pubkey: Vec<u8>,
}

impl Wallet {
    pub fn new(tag: u8) -> Self {
        let secret = SecretKey::from_slice(&[tag; 32]).expect("secret key");
        let pubkey = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret)
            .serialize()
            .to_vec();
        Self { secret, pubkey }
    }

    pub fn script_pubkey(&self) -> Vec<u8> {
        p2pkh_script(&hash160(&self.pubkey))
    }

    pub fn address(&self, params: &ChainParams) -> String {
        AddressEncoder::new(params)
            .addresses(&self.script_pubkey())
            .remove(0)
    }

    pub fn output(&self, value: i64) -> TxOut {
        TxOut {
            value,
            script_pubkey: self.script_pubkey(),
        }
    }

    /// Spends outputs paying to this wallet.
    pub fn spend(&self, prevouts: &[OutPoint], outputs: Vec<TxOut>) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            vin: prevouts
                .iter()
                .map(|prevout| TxIn {
                    prevout: prevout.clone(),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                })
                .collect(),
            vout: outputs,
            lock_time: 0,
        };
        let script_pubkey = self.script_pubkey();
        let signer = Secp256k1::signing_only();
        let mut script_sigs = Vec::with_capacity(tx.vin.len());
        for index in 0..tx.vin.len() {
            let digest = signature_hash(&tx, index, &script_pubkey, SIGHASH_ALL);
            let signature = signer.sign_ecdsa(&Message::from_digest(digest), &self.secret);
            let mut sig = signature.serialize_der().to_vec();
            sig.push(SIGHASH_ALL as u8);
            let mut script_sig = Vec::new();
            script_sig.push(sig.len() as u8);
            script_sig.extend_from_slice(&sig);
            script_sig.push(self.pubkey.len() as u8);
            script_sig.extend_from_slice(&self.pubkey);
            script_sigs.push(script_sig);
        }
        for (input, script_sig) in tx.vin.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        tx
    }
}

pub fn coinbase(height: u32, tag: u8, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: vec![0x01, height as u8, 0x01, tag],
            sequence: u32::MAX,
        }],
        vout: outputs,
        lock_time: 0,
    }
}

/// Grinds the nonce until the header meets its bits. The merkle root is
/// left alone.
pub fn grind(mut block: Block, params: &ChainParams) -> Block {
    while check_proof_of_work(&block.header.hash(), block.header.bits, &params.consensus).is_err() {
        block.header.nonce += 1;
    }
    block
}

pub fn mine(mut block: Block, params: &ChainParams) -> Block {
    block.header.merkle_root = block.compute_merkle_root();
    grind(block, params)
}

/// A mined block at `height` on `prev` whose coinbase pays `coinbase_value`
/// to `miner`. `tag` keeps sibling coinbases and timestamps distinct.
pub fn child(
    params: &ChainParams,
    miner: &Wallet,
    prev: Hash256,
    height: u32,
    tag: u8,
    coinbase_value: i64,
    txs: Vec<Transaction>,
) -> Block {
    let mut transactions = vec![coinbase(height, tag, vec![miner.output(coinbase_value)])];
    transactions.extend(txs);
    let time = GENESIS_TIME + height * SPACING + tag as u32;
    mine(unmined_block(prev, time, transactions), params)
}

pub fn unmined_block(prev: Hash256, time: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 2,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: BITS,
            nonce: 0,
        },
        transactions,
    }
}

/// Regtest with a short maturity, a four-block upgrade window and a genesis
/// paying `miner`.
pub fn test_params(miner: &Wallet) -> (ChainParams, Block) {
    let mut params = chain_params(Network::Regtest);
    params.consensus.coinbase_maturity = MATURITY;
    params.consensus.majority_window = 4;
    params.consensus.majority_enforce_block_upgrade = 3;
    params.consensus.majority_reject_block_outdated = 4;

    let genesis = mine(
        unmined_block(
            [0u8; 32],
            GENESIS_TIME,
            vec![coinbase(0, 0, vec![miner.output(SUBSIDY)])],
        ),
        &params,
    );
    params.consensus.hash_genesis_block = genesis.hash();
    (params, genesis)
}

pub struct Harness {
    pub engine: Engine,
    pub params: ChainParams,
    pub genesis: Block,
    pub miner: Wallet,
    pub events: Receiver<ChainEvent>,
}

impl Harness {
    pub fn new() -> Self {
        let miner = Wallet::new(1);
        let (params, genesis) = test_params(&miner);
        Self::from_params(miner, params, genesis)
    }

    pub fn from_params(miner: Wallet, params: ChainParams, genesis: Block) -> Self {
        let mut engine = ValidationEngine::new(
            MemoryStore::new(),
            params.clone(),
            EngineOptions::default(),
            SignatureChecker,
        );
        let events = engine.subscribe();
        let mut harness = Self {
            engine,
            params,
            genesis,
            miner,
            events,
        };
        let genesis = harness.genesis.clone();
        assert!(harness.process(&genesis).expect("genesis"));
        harness.drain_events();
        harness
    }

    pub fn now(&self) -> i64 {
        GENESIS_TIME as i64 + 1_000_000
    }

    pub fn process(&mut self, block: &Block) -> Result<bool, EngineError> {
        let now = self.now();
        self.engine.process_block(block, true, Some(now))
    }

    pub fn submit(&mut self, tx: &Transaction) -> Result<bool, EngineError> {
        self.engine.process_transaction(tx, true)
    }

    pub fn tip(&self) -> Hash256 {
        self.engine
            .store()
            .mainchain_tip_hash()
            .expect("tip")
            .expect("tip set")
    }

    pub fn height_of(&self, hash: &Hash256) -> u32 {
        self.engine
            .store()
            .block_record(hash)
            .expect("record")
            .expect("known block")
            .height
    }

    pub fn tip_height(&self) -> u32 {
        self.height_of(&self.tip())
    }

    /// A child of the stored block `prev`.
    pub fn block_on(
        &self,
        prev: &Hash256,
        tag: u8,
        coinbase_value: i64,
        txs: Vec<Transaction>,
    ) -> Block {
        let height = self.height_of(prev) + 1;
        child(&self.params, &self.miner, *prev, height, tag, coinbase_value, txs)
    }

    /// Mines `txs` on the current tip, paying the subsidy only.
    pub fn next_block(&self, txs: Vec<Transaction>) -> Block {
        self.block_on(&self.tip(), 0, SUBSIDY, txs)
    }

    pub fn extend(&mut self, count: usize) -> Vec<Block> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let block = self.next_block(Vec::new());
            assert!(self.process(&block).expect("extend"));
            blocks.push(block);
        }
        blocks
    }

    pub fn genesis_coinbase(&self) -> OutPoint {
        OutPoint::new(self.genesis.transactions[0].txid(), 0)
    }

    pub fn balance(&self, wallet: &Wallet) -> i64 {
        self.engine
            .store()
            .address_balance(&wallet.address(&self.params))
            .expect("balance")
    }

    pub fn ledger_balance(&self, wallet: &Wallet) -> i64 {
        self.engine
            .store()
            .address_ledger_balance(&wallet.address(&self.params))
            .expect("ledger balance")
    }

    pub fn in_pool(&self, txid: &Hash256) -> bool {
        self.engine
            .pool()
            .exists(self.engine.store(), txid)
            .expect("pool lookup")
    }

    /// An output row is unspent on the main branch exactly when the UTXO
    /// set holds it, with the same amount.
    pub fn assert_utxo_set_consistent(&self) {
        let store = self.engine.store();
        let utxos: BTreeMap<OutPoint, i64> =
            store.utxos().expect("utxo scan").into_iter().collect();
        let outputs = store.outputs().expect("output scan");
        for (outpoint, record) in &outputs {
            let spendable = !record.spent && record.branch == Branch::Main;
            assert_eq!(
                utxos.get(outpoint).copied(),
                spendable.then_some(record.amount),
                "{outpoint:?} spent={} branch={:?}",
                record.spent,
                record.branch
            );
        }
        for outpoint in utxos.keys() {
            assert!(
                outputs.iter().any(|(stored, _)| stored == outpoint),
                "{outpoint:?} is in the utxo set without an output row"
            );
        }
    }

    pub fn drain_events(&self) -> Vec<ChainEvent> {
        self.events.try_iter().collect()
    }
}

pub fn reason(err: EngineError) -> String {
    err.as_validation()
        .map(|err| err.reason().to_string())
        .unwrap_or_else(|| panic!("expected a validation error, got {err}"))
}
