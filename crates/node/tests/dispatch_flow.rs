use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cinder_chainstate::blockfiles::BlockFileStore;
use cinder_chainstate::state::ChainState;
use cinder_chainstate::validation::ValidationFlags;
use cinder_consensus::constants::PROTOCOL_VERSION;
use cinder_consensus::money::COIN;
use cinder_consensus::{chain_params, Hash256, Network};
use cinder_node::dispatch::{Action, Dispatcher, Peer};
use cinder_node::mempool::Mempool;
use cinder_node::sync::MempoolSync;
use cinder_node::wire::{AlertPayload, Inventory, NetAddr, NetMessage, VersionPayload};
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

fn p2pkh(tag: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn coinbase_tx(time: u32, height: u32) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(50 * COIN, p2pkh(0x11))],
        lock_time: 0,
    }
}

fn mine_pow(chain: &ChainState, prev: Hash256, height: u32, time: u32) -> Block {
    let (bits, burn_bits) = chain.next_targets(&prev, false).expect("targets");
    let effective = chain
        .expected_effective_coins(&prev, true, 0)
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
        transactions: vec![coinbase_tx(time, height)],
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

struct Fixture {
    chain: Arc<ChainState>,
    mempool: Arc<Mempool>,
    dispatcher: Dispatcher,
    coinbases: Vec<Hash256>,
    start: u32,
    tip: Hash256,
}

fn fixture(dir: &std::path::Path, height: u32) -> Fixture {
    let params = chain_params(Network::Regtest);
    let store = Arc::new(MemoryStore::new());
    let files = BlockFileStore::open(dir, params.magic).expect("block files");
    let chain = Arc::new(
        ChainState::new(store, files, params, Arc::new(PermissiveScripts)).expect("chain state"),
    );
    let mempool = Arc::new(Mempool::default());
    chain.register_notifier(Arc::new(MempoolSync::new(
        Arc::downgrade(&chain),
        Arc::clone(&mempool),
    )));

    let mut tip = chain.init_genesis().expect("genesis");
    let start = base_time();
    let flags = test_flags();
    let mut coinbases = Vec::new();
    for h in 1..=height {
        let block = mine_pow(&chain, tip, h, start + h * SPACING);
        coinbases.push(block.transactions[0].txid());
        chain.process_block(&block, &flags).expect("block");
        tip = block.hash();
    }

    let dispatcher = Dispatcher::new(Arc::clone(&chain), Arc::clone(&mempool), test_flags());
    Fixture {
        chain,
        mempool,
        dispatcher,
        coinbases,
        start,
        tip,
    }
}

fn version_message(start_height: i32) -> NetMessage {
    NetMessage::Version(VersionPayload {
        version: PROTOCOL_VERSION,
        services: 1,
        timestamp: 0,
        addr_recv: NetAddr::unroutable(),
        addr_from: NetAddr::unroutable(),
        nonce: 7,
        sub_version: "/cinder:0.1.0/".to_string(),
        start_height,
    })
}

fn handshake(dispatcher: &Dispatcher, peer: &mut Peer) {
    let actions = dispatcher.handle(peer, version_message(0));
    assert!(actions
        .iter()
        .any(|action| matches!(action, Action::Send(NetMessage::Verack))));
    dispatcher.handle(peer, NetMessage::Verack);
}

fn spend(prevout_tx: Hash256, time: u32, value: i64, tag: u8) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::new(prevout_tx, 0),
            script_sig: vec![0x01, tag],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut::new(value, p2pkh(tag))],
        lock_time: 0,
    }
}

#[test]
fn no_command_is_accepted_before_version() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 2);
    let mut peer = Peer::new(1);

    let actions = fixture.dispatcher.handle(&mut peer, NetMessage::Ping(9));
    assert!(actions.is_empty());
    assert_eq!(peer.misbehavior, 1);

    handshake(&fixture.dispatcher, &mut peer);
    let actions = fixture.dispatcher.handle(&mut peer, NetMessage::Ping(9));
    assert_eq!(actions, vec![Action::Send(NetMessage::Pong(9))]);
}

#[test]
fn second_version_is_misbehaviour() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 2);
    let mut peer = Peer::new(1);

    handshake(&fixture.dispatcher, &mut peer);
    let before = peer.misbehavior;
    fixture.dispatcher.handle(&mut peer, version_message(5));
    assert_eq!(peer.misbehavior, before + 1);
}

#[test]
fn accepted_blocks_are_relayed_and_orphans_requested() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 2);
    let mut peer = Peer::new(1);
    handshake(&fixture.dispatcher, &mut peer);

    let b3 = mine_pow(
        &fixture.chain,
        fixture.tip,
        3,
        fixture.start + 3 * SPACING,
    );
    let b4 = mine_pow(
        &fixture.chain,
        b3.hash(),
        4,
        fixture.start + 4 * SPACING,
    );

    // The out-of-order child is shunted to the orphan pool and its missing
    // parent requested from the peer.
    let actions = fixture
        .dispatcher
        .handle(&mut peer, NetMessage::Block(b4.clone()));
    assert!(actions
        .iter()
        .any(|action| matches!(action, Action::RequestBlocks { .. })));
    assert!(actions
        .iter()
        .any(|action| *action == Action::AskFor(Inventory::block(b3.hash()))));

    let actions = fixture
        .dispatcher
        .handle(&mut peer, NetMessage::Block(b3.clone()));
    assert!(actions
        .iter()
        .any(|action| *action == Action::Relay(Inventory::block(b3.hash()))));
    assert_eq!(fixture.chain.best_hash(), Some(b4.hash()));
}

#[test]
fn invalid_blocks_accumulate_misbehaviour_to_a_ban() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 2);
    let mut peer = Peer::new(1);
    handshake(&fixture.dispatcher, &mut peer);

    let mut bad = mine_pow(
        &fixture.chain,
        fixture.tip,
        3,
        fixture.start + 3 * SPACING,
    );
    bad.effective_burn_coins = 999;
    let target = compact_to_target(bad.header.bits).expect("target");
    while !hash_meets_target(&bad.hash(), &target) {
        bad.header.nonce += 1;
    }

    // Effective-coin mismatch scores 50; two strikes ban the peer.
    fixture
        .dispatcher
        .handle(&mut peer, NetMessage::Block(bad.clone()));
    assert_eq!(peer.misbehavior, 50);
    assert!(!peer.banned);

    bad.header.nonce += 1;
    let target = compact_to_target(bad.header.bits).expect("target");
    while !hash_meets_target(&bad.hash(), &target) {
        bad.header.nonce += 1;
    }
    let actions = fixture.dispatcher.handle(&mut peer, NetMessage::Block(bad));
    assert!(peer.banned);
    assert!(actions.contains(&Action::Disconnect));
}

#[test]
fn transactions_relay_and_drain_their_orphans() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 13);
    let mut peer = Peer::new(1);
    handshake(&fixture.dispatcher, &mut peer);

    let tx_time = fixture.start + 14 * SPACING;
    let parent = spend(fixture.coinbases[0], tx_time, 49 * COIN, 0x61);
    let child = spend(parent.txid(), tx_time, 48 * COIN, 0x62);

    // Child first: missing inputs put it into the orphan transaction pool.
    let actions = fixture
        .dispatcher
        .handle(&mut peer, NetMessage::Tx(child.clone()));
    assert!(actions.is_empty());
    assert!(fixture.mempool.has_orphan(&child.txid()));

    // Parent arrival admits both and relays both.
    let actions = fixture
        .dispatcher
        .handle(&mut peer, NetMessage::Tx(parent.clone()));
    assert!(actions.contains(&Action::Relay(Inventory::transaction(parent.txid()))));
    assert!(actions.contains(&Action::Relay(Inventory::transaction(child.txid()))));
    assert!(fixture.mempool.contains(&parent.txid()));
    assert!(fixture.mempool.contains(&child.txid()));
    assert!(!fixture.mempool.has_orphan(&child.txid()));
}

#[test]
fn getdata_serves_blocks_and_pool_transactions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 13);
    let mut peer = Peer::new(1);
    handshake(&fixture.dispatcher, &mut peer);

    let tx_time = fixture.start + 14 * SPACING;
    let tx = spend(fixture.coinbases[0], tx_time, 49 * COIN, 0x71);
    fixture
        .dispatcher
        .handle(&mut peer, NetMessage::Tx(tx.clone()));

    let actions = fixture.dispatcher.handle(
        &mut peer,
        NetMessage::GetData(vec![
            Inventory::block(fixture.tip),
            Inventory::transaction(tx.txid()),
        ]),
    );
    assert!(actions.iter().any(|action| matches!(
        action,
        Action::Send(NetMessage::Block(block)) if block.hash() == fixture.tip
    )));
    assert!(actions.iter().any(|action| matches!(
        action,
        Action::Send(NetMessage::Tx(sent)) if sent.txid() == tx.txid()
    )));
}

#[test]
fn getblocks_answers_with_main_chain_inventory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 5);
    let mut peer = Peer::new(1);
    handshake(&fixture.dispatcher, &mut peer);

    let actions = fixture.dispatcher.handle(
        &mut peer,
        NetMessage::GetBlocks {
            locator: Vec::new(),
            hash_stop: [0u8; 32],
        },
    );
    let inv = actions.iter().find_map(|action| match action {
        Action::Send(NetMessage::Inv(entries)) => Some(entries.clone()),
        _ => None,
    });
    let entries = inv.expect("inventory response");
    assert_eq!(entries.len(), 6);
    assert_eq!(entries.last().expect("tip entry").hash, fixture.tip);
}

fn halt_alert_bytes() -> Vec<u8> {
    cinder_primitives::encoding::to_bytes(&AlertPayload {
        version: 1,
        relay_until: 0,
        expiration: 0,
        id: 1,
        cancel: 0,
        min_ver: 0,
        max_ver: 999_999,
        priority: 5_000,
        comment: String::new(),
        status_bar: "upgrade required".to_string(),
    })
}

#[test]
fn alerts_are_ignored_without_an_alert_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 2);
    let mut peer = Peer::new(1);
    handshake(&fixture.dispatcher, &mut peer);

    fixture.dispatcher.handle(
        &mut peer,
        NetMessage::Alert {
            payload: halt_alert_bytes(),
            signature: vec![0x30, 0x44],
        },
    );
    assert!(!fixture.dispatcher.safe_mode());
}

#[test]
fn only_properly_signed_alerts_enter_safe_mode() {
    use cinder_primitives::hash::sha256d;
    use cinder_script::secp::{pubkey_for_secret, sign_hash};

    let secret = [0x51u8; 32];
    let mut params = chain_params(Network::Regtest);
    params.consensus.alert_pubkey = Some(pubkey_for_secret(&secret).expect("pubkey"));

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let files = BlockFileStore::open(dir.path(), params.magic).expect("block files");
    let chain = Arc::new(
        ChainState::new(store, files, params, Arc::new(PermissiveScripts)).expect("chain state"),
    );
    chain.init_genesis().expect("genesis");
    let mempool = Arc::new(Mempool::default());
    let dispatcher = Dispatcher::new(Arc::clone(&chain), Arc::clone(&mempool), test_flags());

    let mut peer = Peer::new(1);
    handshake(&dispatcher, &mut peer);
    let payload = halt_alert_bytes();

    // A forged signature is penalized and changes nothing.
    dispatcher.handle(
        &mut peer,
        NetMessage::Alert {
            payload: payload.clone(),
            signature: vec![1, 2, 3],
        },
    );
    assert!(!dispatcher.safe_mode());
    assert_eq!(peer.misbehavior, 10);

    // The authentic alert restricts the node.
    let signature = sign_hash(&secret, &sha256d(&payload)).expect("sign");
    dispatcher.handle(&mut peer, NetMessage::Alert { payload, signature });
    assert!(dispatcher.safe_mode());
}

#[test]
fn reorganization_resurrects_pool_transactions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fixture = fixture(dir.path(), 12);
    let flags = test_flags();
    let start = fixture.start;

    // Mined spend at height 13.
    let spend_tx = spend(fixture.coinbases[0], start + 13 * SPACING, 49 * COIN, 0x81);
    let (bits, burn_bits) = fixture
        .chain
        .next_targets(&fixture.tip, false)
        .expect("targets");
    let effective = fixture
        .chain
        .expected_effective_coins(&fixture.tip, true, 0)
        .expect("effective coins");
    let mut b13 = Block {
        header: BlockHeader {
            version: 1,
            prev_block: fixture.tip,
            merkle_root: [0u8; 32],
            time: start + 13 * SPACING,
            bits,
            burn_bits,
            nonce: 0,
        },
        transactions: vec![coinbase_tx(start + 13 * SPACING, 13), spend_tx.clone()],
        signature: Vec::new(),
        pob: None,
        effective_burn_coins: effective,
    };
    b13.header.merkle_root = b13.compute_merkle_root();
    let target = compact_to_target(bits).expect("target");
    while !hash_meets_target(&b13.hash(), &target) {
        b13.header.nonce += 1;
    }
    fixture.chain.process_block(&b13, &flags).expect("b13");
    assert!(fixture.chain.contains_tx(&spend_tx.txid()).expect("index"));

    // Build a heavier fork from height 12 that does not carry the spend.
    let fork_parent = fixture.tip;
    let mut prev = fork_parent;
    for height in 13..=15u32 {
        let mut block = mine_pow(&fixture.chain, prev, height, start + height * SPACING);
        // Salt the coinbase so the fork blocks differ from the main chain.
        block.transactions[0].vin[0].script_sig.push(0xfe);
        block.header.merkle_root = block.compute_merkle_root();
        let target = compact_to_target(block.header.bits).expect("target");
        while !hash_meets_target(&block.hash(), &target) {
            block.header.nonce += 1;
        }
        fixture.chain.process_block(&block, &flags).expect("fork block");
        prev = block.hash();
    }

    // The spend from the abandoned block is back in the pool.
    assert!(!fixture.chain.contains_tx(&spend_tx.txid()).expect("index"));
    assert!(fixture.mempool.contains(&spend_tx.txid()));
}
