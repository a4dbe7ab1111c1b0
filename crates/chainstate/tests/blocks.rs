mod common;

use common::{
    child, coinbase, grind, mine, reason, test_params, unmined_block, Harness, Wallet,
    GENESIS_TIME, SPACING, SUBSIDY,
};
use utxod_chainstate::{Branch, ChainEvent};
use utxod_consensus::money::COIN;
use utxod_consensus::{hash256_to_hex, Checkpoint};
use utxod_primitives::outpoint::OutPoint;

const FEE: i64 = COIN / 100;

#[test]
fn linear_chain_tracks_utxos_and_ledger() {
    let mut h = Harness::new();
    let alice = Wallet::new(2);
    let bob = Wallet::new(3);
    h.extend(2);

    let pay_alice = h.miner.spend(
        &[h.genesis_coinbase()],
        vec![alice.output(30 * COIN), h.miner.output(20 * COIN - FEE)],
    );
    assert!(h.submit(&pay_alice).expect("submit"));
    assert!(h.in_pool(&pay_alice.txid()));

    let third = h.block_on(&h.tip(), 0, SUBSIDY + FEE, vec![pay_alice.clone()]);
    assert!(h.process(&third).expect("third"));
    assert!(!h.in_pool(&pay_alice.txid()));
    assert!(h.drain_events().contains(&ChainEvent::BlockConnected {
        hash: third.hash(),
        height: 3,
    }));

    let pay_bob = alice.spend(
        &[OutPoint::new(pay_alice.txid(), 0)],
        vec![bob.output(10 * COIN), alice.output(20 * COIN - FEE)],
    );
    let fourth = h.next_block(vec![pay_bob]);
    assert!(h.process(&fourth).expect("fourth"));

    assert_eq!(h.tip(), fourth.hash());
    assert_eq!(h.tip_height(), 4);
    assert_eq!(h.balance(&alice), 20 * COIN - FEE);
    assert_eq!(h.balance(&bob), 10 * COIN);
    assert_eq!(h.balance(&h.miner), 4 * SUBSIDY + FEE + 20 * COIN - FEE);
    for wallet in [&alice, &bob, &h.miner] {
        assert_eq!(h.balance(wallet), h.ledger_balance(wallet));
    }

    let stats = h.engine.store().stats().expect("stats");
    assert_eq!(stats.blocks, 5);
    assert_eq!(stats.txs, 7);
    assert_eq!(stats.outputs, 9);
    assert_eq!(stats.utxos, 7);
    assert_eq!(stats.unconfirmed_txs, 0);
    assert_eq!(h.engine.metrics().snapshot().blocks, 4);

    let record = h
        .engine
        .store()
        .block_record(&third.hash())
        .expect("record")
        .expect("third stored");
    assert_eq!(record.branch, Branch::Main);
    assert_eq!(record.summary.fee, FEE);
}

#[test]
fn seventh_block_splits_an_output_from_the_first() {
    let mut h = Harness::new();
    let original = Wallet::new(4);
    let alice = Wallet::new(2);
    let bob = Wallet::new(3);

    let first = child(&h.params, &original, h.tip(), 1, 0, SUBSIDY, Vec::new());
    assert!(h.process(&first).expect("first"));
    assert_eq!(h.balance(&original), SUBSIDY);
    h.extend(5);

    let split = original.spend(
        &[OutPoint::new(first.transactions[0].txid(), 0)],
        vec![alice.output(SUBSIDY / 2), bob.output(SUBSIDY / 2)],
    );
    let seventh = h.next_block(vec![split]);
    assert!(h.process(&seventh).expect("seventh"));
    assert_eq!(h.tip_height(), 7);

    let stats = h.engine.store().stats().expect("stats");
    assert_eq!(stats.blocks, 8);
    assert_eq!(stats.txs, 9);
    assert_eq!(h.balance(&alice), SUBSIDY / 2);
    assert_eq!(h.balance(&bob), SUBSIDY / 2);
    assert_eq!(h.balance(&original), 0);
    assert_eq!(h.ledger_balance(&original), 0);

    let outputs = h
        .engine
        .store()
        .address_outputs(&original.address(&h.params))
        .expect("outputs");
    assert_eq!(outputs.len(), 1);
    assert!(outputs[0].1.spent);
}

#[test]
fn reprocessing_a_block_is_a_no_op() {
    let mut h = Harness::new();
    let blocks = h.extend(2);
    let before = h.engine.store().stats().expect("stats");
    h.drain_events();

    assert!(h.process(&blocks[1]).expect("again"));
    assert!(h.process(&h.genesis.clone()).expect("genesis again"));

    assert_eq!(h.engine.store().stats().expect("stats"), before);
    assert!(h.drain_events().is_empty());
    assert_eq!(h.tip(), blocks[1].hash());
}

#[test]
fn orphan_block_waits_for_its_parent() {
    let mut h = Harness::new();
    let first = h.next_block(Vec::new());
    let second = child(&h.params, &h.miner, first.hash(), 2, 0, SUBSIDY, Vec::new());
    let third = child(&h.params, &h.miner, second.hash(), 3, 0, SUBSIDY, Vec::new());

    assert!(h.process(&third).expect("third"));
    assert!(h.process(&second).expect("second"));
    let store = h.engine.store();
    assert!(store.is_block_orphan(&second.hash()).expect("orphan"));
    assert!(!store.is_block_valid(&third.hash()).expect("valid"));
    assert_eq!(h.tip(), h.genesis.hash());

    assert!(h.process(&first).expect("first"));
    assert_eq!(h.tip(), third.hash());
    assert_eq!(h.tip_height(), 3);
    assert!(!h.engine.store().is_block_orphan(&second.hash()).expect("orphan"));

    let connected: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            ChainEvent::BlockConnected { hash, height } => Some((hash, height)),
            _ => None,
        })
        .collect();
    assert_eq!(
        connected,
        vec![(first.hash(), 1), (second.hash(), 2), (third.hash(), 3)]
    );
    assert_eq!(h.balance(&h.miner), 4 * SUBSIDY);
    assert_eq!(h.ledger_balance(&h.miner), 4 * SUBSIDY);
    h.assert_utxo_set_consistent();
}

fn assert_rejected(h: &mut Harness, block: &utxod_primitives::block::Block, expected: &str) {
    let tip = h.tip();
    let err = h.process(block).expect_err("block should be rejected");
    assert_eq!(reason(err), expected);
    assert_eq!(h.tip(), tip);
    let store = h.engine.store();
    assert!(!store.is_block_processed(&block.hash()).expect("processed"));
    assert!(store.raw_block(&block.hash()).expect("raw").is_none());
}

#[test]
fn rejects_merkle_mismatch() {
    let mut h = Harness::new();
    let mut block = h.next_block(Vec::new());
    block.header.merkle_root = [9u8; 32];
    let block = grind(block, &h.params);
    assert_rejected(&mut h, &block, "CheckBlock() : hashMerkleRoot mismatch");
}

#[test]
fn rejects_overpaying_coinbase() {
    let mut h = Harness::new();
    let block = h.block_on(&h.tip(), 0, SUBSIDY + 1, Vec::new());
    assert_rejected(
        &mut h,
        &block,
        "ConnectBlock() : coinbase pays too much (actual=5000000001 vs limit=5000000000)",
    );

    let now = h.now();
    assert!(!h.engine.process_block(&block, false, Some(now)).expect("quiet"));
}

#[test]
fn rejects_timestamp_at_median() {
    let mut h = Harness::new();
    h.extend(2);
    let block = mine(
        unmined_block(
            h.tip(),
            GENESIS_TIME + SPACING,
            vec![coinbase(3, 0, vec![h.miner.output(SUBSIDY)])],
        ),
        &h.params,
    );
    assert_rejected(&mut h, &block, "AcceptBlock() : block's timestamp is too early");
}

#[test]
fn rejects_immature_coinbase_spend() {
    let mut h = Harness::new();
    let first = h.extend(1).remove(0);
    let spend = h.miner.spend(
        &[OutPoint::new(first.transactions[0].txid(), 0)],
        vec![h.miner.output(SUBSIDY - FEE)],
    );
    let block = h.next_block(vec![spend]);
    assert_rejected(
        &mut h,
        &block,
        "CheckInputs() : tried to spend coinbase at depth 1 < 2",
    );
}

#[test]
fn rejects_bad_signature() {
    let mut h = Harness::new();
    h.extend(2);
    let thief = Wallet::new(9);
    let spend = thief.spend(&[h.genesis_coinbase()], vec![thief.output(SUBSIDY)]);
    let block = h.next_block(vec![spend]);
    assert_rejected(&mut h, &block, "Script evaluation failed");
}

#[test]
fn rejects_missing_and_double_spent_inputs() {
    let mut h = Harness::new();
    h.extend(2);

    let missing = h
        .miner
        .spend(&[OutPoint::new([7u8; 32], 0)], vec![h.miner.output(COIN)]);
    let block = h.next_block(vec![missing]);
    assert_rejected(&mut h, &block, "ConnectBlock() : inputs missing/spent");

    let alice = Wallet::new(2);
    let first = h
        .miner
        .spend(&[h.genesis_coinbase()], vec![alice.output(SUBSIDY - FEE)]);
    let second = h
        .miner
        .spend(&[h.genesis_coinbase()], vec![h.miner.output(SUBSIDY - FEE)]);
    let block = h.next_block(vec![first, second]);
    assert_rejected(&mut h, &block, "ConnectBlock() : inputs missing/spent");
    assert_eq!(h.balance(&alice), 0);
}

#[test]
fn enforces_version_two_after_supermajority() {
    let mut h = Harness::new();
    h.extend(3);

    let mut outdated = h.next_block(Vec::new());
    outdated.header.version = 1;
    let outdated = grind(outdated, &h.params);
    let expected = format!(
        "AcceptBlock() : rejected nVersion=1 block {}",
        hash256_to_hex(&outdated.hash())
    );
    assert_rejected(&mut h, &outdated, &expected);

    let wrong_height = mine(
        unmined_block(
            h.tip(),
            GENESIS_TIME + 4 * SPACING,
            vec![coinbase(9, 0, vec![h.miner.output(SUBSIDY)])],
        ),
        &h.params,
    );
    assert_rejected(
        &mut h,
        &wrong_height,
        "AcceptBlock() : block height mismatch in coinbase",
    );
}

#[test]
fn accepts_version_one_before_supermajority() {
    let mut h = Harness::new();
    let mut block = h.next_block(Vec::new());
    block.header.version = 1;
    let block = grind(block, &h.params);
    assert!(h.process(&block).expect("version one"));
    assert_eq!(h.tip(), block.hash());
}

#[test]
fn checkpoints_pin_blocks_and_forks() {
    let miner = Wallet::new(1);
    let (mut params, genesis) = test_params(&miner);
    let first = child(&params, &miner, genesis.hash(), 1, 0, SUBSIDY, Vec::new());
    let second = child(&params, &miner, first.hash(), 2, 0, SUBSIDY, Vec::new());
    let impostor = child(&params, &miner, first.hash(), 2, 5, SUBSIDY, Vec::new());
    params.consensus.checkpoints = vec![Checkpoint {
        height: 2,
        hash: second.hash(),
    }];
    let mut h = Harness::from_params(miner, params, genesis);

    assert!(h.process(&first).expect("first"));
    assert_rejected(
        &mut h,
        &impostor,
        "AcceptBlock() : rejected by checkpoint lock-in at 2",
    );
    assert!(h.process(&second).expect("second"));
    assert_eq!(
        h.engine.latest_checkpoint_hash().expect("checkpoint"),
        Some(second.hash())
    );
    assert_eq!(h.engine.height_of_checkpoint(&second.hash()), Some(2));

    let stale = mine(
        unmined_block(
            h.genesis.hash(),
            GENESIS_TIME + SPACING + 1,
            vec![coinbase(1, 7, vec![h.miner.output(SUBSIDY)])],
        ),
        &h.params,
    );
    assert_rejected(
        &mut h,
        &stale,
        "ProcessBlock() : block with timestamp before last checkpoint",
    );

    let old_fork = mine(
        unmined_block(
            h.genesis.hash(),
            GENESIS_TIME + 10 * SPACING,
            vec![coinbase(1, 8, vec![h.miner.output(SUBSIDY)])],
        ),
        &h.params,
    );
    assert_rejected(
        &mut h,
        &old_fork,
        "AcceptBlock() : forked chain older than last checkpoint (height 1)",
    );
}
