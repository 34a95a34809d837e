use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use cinder_chainstate::blockfiles::BlockFileStore;
use cinder_chainstate::notify::ChainNotifier;
use cinder_chainstate::state::{ChainState, BlockOutcome};
use cinder_chainstate::validation::ValidationFlags;
use cinder_consensus::money::COIN;
use cinder_consensus::{chain_params, ChainParams, Hash256, Network};
use cinder_pow::difficulty::{compact_to_target, hash_meets_target};
use cinder_primitives::block::{Block, BlockHeader};
use cinder_primitives::outpoint::OutPoint;
use cinder_primitives::transaction::{Transaction, TxIn, TxOut};
use cinder_script::ScriptVerifier;
use cinder_storage::memory::MemoryStore;

const SPACING: u32 = 90;

struct PermissiveScripts;

impl ScriptVerifier for PermissiveScripts {
    fn verify_spend(
        &self,
        _tx: &Transaction,
        _input_index: usize,
        _prev_script_pubkey: &[u8],
        _strict_p2sh: bool,
    ) -> bool {
        true
    }
}

#[derive(Default)]
struct EventRecorder {
    connected: Mutex<Vec<Block>>,
    disconnected: Mutex<Vec<Block>>,
}

impl ChainNotifier for EventRecorder {
    fn block_connected(&self, block: &Block) {
        self.connected.lock().expect("lock").push(block.clone());
    }

    fn block_disconnected(&self, block: &Block) {
        self.disconnected.lock().expect("lock").push(block.clone());
    }
}

fn test_flags() -> ValidationFlags {
    ValidationFlags {
        check_pow: true,
        check_signatures: false,
        check_block_signature: false,
        check_kernel: false,
    }
}

fn base_time() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    now - 100_000
}

fn new_chain(dir: &std::path::Path) -> (ChainState, ChainParams, Hash256) {
    let params = chain_params(Network::Regtest);
    let store = Arc::new(MemoryStore::new());
    let files = BlockFileStore::open(dir, params.magic).expect("block files");
    let chain = ChainState::new(store, files, params.clone(), Arc::new(PermissiveScripts))
        .expect("chain state");
    let genesis = chain.init_genesis().expect("genesis");
    (chain, params, genesis)
}

fn p2pkh(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn coinbase_tx(time: u32, height: u32, salt: u8) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.push(salt);
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(50 * COIN, p2pkh(0x11))],
        lock_time: 0,
    }
}

fn mine_pow(
    chain: &ChainState,
    params: &ChainParams,
    prev: Hash256,
    height: u32,
    time: u32,
    salt: u8,
    extra: Vec<Transaction>,
) -> Block {
    let (bits, burn_bits) = chain.next_targets(&prev, false).expect("targets");
    let mut transactions = vec![coinbase_tx(time, height, salt)];
    transactions.extend(extra);
    let burned: i64 = transactions
        .iter()
        .filter_map(|tx| {
            tx.burn_output_index(&params.consensus.burn_script_pubkey)
                .map(|index| tx.vout[index].value)
        })
        .sum();
    let effective = chain
        .expected_effective_coins(&prev, true, burned)
        .expect("effective coins");
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits,
            burn_bits,
            nonce: 0,
        },
        transactions,
        signature: Vec::new(),
        pob: None,
        effective_burn_coins: effective,
    };
    block.header.merkle_root = block.compute_merkle_root();
    let target = compact_to_target(bits).expect("target");
    while !hash_meets_target(&block.hash(), &target) {
        block.header.nonce += 1;
    }
    block
}

/// Genesis plus twelve empty PoW blocks; returns the block hashes by height.
fn build_main_chain(
    chain: &ChainState,
    params: &ChainParams,
    genesis: Hash256,
    start: u32,
    flags: &ValidationFlags,
) -> (Vec<Hash256>, Vec<Hash256>) {
    let mut hashes = vec![genesis];
    let mut coinbases = Vec::new();
    let mut prev = genesis;
    for height in 1..=12u32 {
        let block = mine_pow(
            chain,
            params,
            prev,
            height,
            start + height * SPACING,
            0,
            Vec::new(),
        );
        coinbases.push(block.transactions[0].txid());
        chain.process_block(&block, flags).expect("main block");
        prev = block.hash();
        hashes.push(prev);
    }
    (hashes, coinbases)
}

#[test]
fn heavier_fork_triggers_reorganization() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (chain, params, genesis) = new_chain(dir.path());
    let recorder = Arc::new(EventRecorder::default());
    chain.register_notifier(recorder.clone());
    let flags = test_flags();
    let start = base_time();

    let (hashes, coinbases) = build_main_chain(&chain, &params, genesis, start, &flags);

    // Height 13 carries a user transaction spending the mature coinbase.
    let spend = Transaction {
        version: 1,
        time: start + 13 * SPACING,
        vin: vec![TxIn {
            prevout: OutPoint::new(coinbases[0], 0),
            script_sig: vec![0x01, 0xaa],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(49 * COIN, p2pkh(0x22))],
        lock_time: 0,
    };
    let spend_txid = spend.txid();
    let b13 = mine_pow(
        &chain,
        &params,
        hashes[12],
        13,
        start + 13 * SPACING,
        0,
        vec![spend],
    );
    chain.process_block(&b13, &flags).expect("b13");
    assert_eq!(chain.best_hash(), Some(b13.hash()));
    assert!(chain.contains_tx(&spend_txid).expect("tx index"));

    // Fork from height 11: four salted blocks, two heavier than the tip.
    let mut fork_hashes = Vec::new();
    let mut prev = hashes[11];
    for (offset, height) in (12..=15u32).enumerate() {
        let block = mine_pow(
            &chain,
            &params,
            prev,
            height,
            start + height * SPACING,
            0xf0 + offset as u8,
            Vec::new(),
        );
        prev = block.hash();
        fork_hashes.push(prev);
        chain.process_block(&block, &flags).expect("fork block");
    }

    // The fork won: the spend from the abandoned branch is disconnected.
    assert_eq!(chain.best_hash(), Some(*fork_hashes.last().expect("tip")));
    assert_eq!(chain.best_height(), 15);
    assert!(!chain.is_in_main_chain(&b13.hash()));
    assert!(!chain.is_in_main_chain(&hashes[12]));
    assert!(chain.is_in_main_chain(&fork_hashes[0]));
    assert_eq!(chain.next_in_main_chain(&hashes[11]), Some(fork_hashes[0]));
    assert_eq!(chain.next_in_main_chain(&hashes[12]), None);
    assert_eq!(chain.next_in_main_chain(&b13.hash()), None);
    assert!(!chain.contains_tx(&spend_txid).expect("tx index"));
    assert_eq!(
        chain.read_best_chain_hash().expect("meta"),
        Some(*fork_hashes.last().expect("tip"))
    );

    // The observer saw the abandoned blocks go and the fork come in, with
    // the user transaction available for resurrection.
    let disconnected = recorder.disconnected.lock().expect("lock");
    assert!(disconnected
        .iter()
        .any(|block| block.transactions.iter().any(|tx| tx.txid() == spend_txid)));
    let connected = recorder.connected.lock().expect("lock");
    assert!(connected
        .iter()
        .any(|block| block.hash() == fork_hashes[0]));
}

#[test]
fn failed_reorganization_is_atomic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (chain, params, genesis) = new_chain(dir.path());
    let flags = test_flags();
    let start = base_time();

    let (hashes, _) = build_main_chain(&chain, &params, genesis, start, &flags);
    let main_tip = hashes[12];
    assert_eq!(chain.best_hash(), Some(main_tip));

    // A longer fork whose middle block spends an unknown output: context-free
    // checks pass, connection must fail.
    let bogus_spend = Transaction {
        version: 1,
        time: start + 12 * SPACING,
        vin: vec![TxIn {
            prevout: OutPoint::new([0x5a; 32], 0),
            script_sig: vec![0x01, 0xcc],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(5 * COIN, p2pkh(0x44))],
        lock_time: 0,
    };

    let f12 = mine_pow(
        &chain,
        &params,
        hashes[11],
        12,
        start + 12 * SPACING,
        0xe0,
        vec![bogus_spend],
    );
    chain.process_block(&f12, &flags).expect("fork block 12");

    // This one lifts the fork's trust above the tip and triggers the switch,
    // which must abort on the bogus spend.
    let f13 = mine_pow(
        &chain,
        &params,
        f12.hash(),
        13,
        start + 13 * SPACING,
        0xe1,
        Vec::new(),
    );
    assert!(chain.process_block(&f13, &flags).is_err());

    assert_eq!(chain.best_hash(), Some(main_tip));
    assert_eq!(chain.read_best_chain_hash().expect("meta"), Some(main_tip));
    assert!(chain.is_in_main_chain(&hashes[12]));
    assert!(!chain.is_in_main_chain(&f12.hash()));
    assert_eq!(chain.next_in_main_chain(&hashes[11]), Some(hashes[12]));
}

#[test]
fn equal_trust_keeps_the_first_seen_tip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (chain, params, genesis) = new_chain(dir.path());
    let flags = test_flags();
    let start = base_time();

    let b1 = mine_pow(&chain, &params, genesis, 1, start + SPACING, 0, Vec::new());
    chain.process_block(&b1, &flags).expect("b1");

    let rival = mine_pow(&chain, &params, genesis, 1, start + SPACING, 0x99, Vec::new());
    let outcome = chain.process_block(&rival, &flags).expect("rival");
    assert_eq!(outcome, BlockOutcome::Accepted { new_best: false });
    assert_eq!(chain.best_hash(), Some(b1.hash()));
}
