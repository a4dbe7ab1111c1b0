//! Context-free block and transaction rules, plus the relay policy checks.

use std::collections::HashSet;

use utxod_consensus::constants::{
    CURRENT_TX_VERSION, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_SIZE,
    MAX_STANDARD_SCRIPT_SIG_SIZE, MAX_STANDARD_TX_SIZE, MIN_COINBASE_SCRIPT_SIZE,
    MIN_RELAY_TX_FEE,
};
use utxod_consensus::money::{money_range, Amount, MAX_MONEY};
use utxod_consensus::{ConsensusParams, ZERO_HASH};
use utxod_pow::difficulty::check_proof_of_work;
use utxod_primitives::block::Block;
use utxod_primitives::transaction::{Transaction, TxOut};
use utxod_script::standard::{args_expected, classify, is_standard, ScriptType};
use utxod_script::{
    has_canonical_pushes, instructions, is_push_only, legacy_sigop_count, p2sh_sigop_count,
};

/// Why a block or transaction was refused.
///
/// `MissingInputs` is recoverable: the transaction is parked until its
/// parents show up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    Block(String),
    Tx(String),
    MissingInputs(String),
}

impl ValidationError {
    pub fn reason(&self) -> &str {
        match self {
            ValidationError::Block(reason)
            | ValidationError::Tx(reason)
            | ValidationError::MissingInputs(reason) => reason,
        }
    }

    pub fn is_missing_inputs(&self) -> bool {
        matches!(self, ValidationError::MissingInputs(_))
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Block(reason) => write!(f, "invalid block: {reason}"),
            ValidationError::Tx(reason) => write!(f, "invalid transaction: {reason}"),
            ValidationError::MissingInputs(reason) => write!(f, "missing inputs: {reason}"),
        }
    }
}

impl std::error::Error for ValidationError {}

fn block_error(reason: &str) -> ValidationError {
    ValidationError::Block(format!("CheckBlock() : {reason}"))
}

fn tx_error(reason: &str) -> ValidationError {
    ValidationError::Tx(format!("CheckTransaction() : {reason}"))
}

pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(tx_error("vin empty"));
    }
    if tx.vout.is_empty() {
        return Err(tx_error("vout empty"));
    }
    if tx.size() > MAX_BLOCK_SIZE {
        return Err(tx_error("size limits failed"));
    }

    let mut total: Amount = 0;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(tx_error("txout.nValue negative"));
        }
        if output.value > MAX_MONEY {
            return Err(tx_error("txout.nValue too high"));
        }
        total += output.value;
        if total > MAX_MONEY {
            return Err(tx_error("txout total out of range"));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    if !tx.vin.iter().all(|input| seen.insert(input.prevout.key())) {
        return Err(tx_error("duplicate inputs"));
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(tx_error("coinbase script size"));
        }
    } else if tx.vin.iter().any(|input| input.prevout.hash == ZERO_HASH) {
        return Err(tx_error("prevout is null"));
    }
    Ok(())
}

/// Rules that need no chain context. `max_time` is the latest acceptable
/// header timestamp.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    max_time: i64,
    check_pow: bool,
) -> Result<(), ValidationError> {
    if block.transactions.is_empty()
        || block.transactions.len() > MAX_BLOCK_SIZE
        || block.size() > MAX_BLOCK_SIZE
    {
        return Err(block_error("size limits failed"));
    }

    if check_pow && check_proof_of_work(&block.header.hash(), block.header.bits, params).is_err() {
        return Err(block_error("proof of work failed"));
    }

    if block.header.time as i64 > max_time {
        return Err(block_error("block timestamp too far in the future"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(block_error("first tx is not coinbase"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(block_error("more than one coinbase"));
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
    }

    let txids = block.txids();
    let mut seen = HashSet::with_capacity(txids.len());
    if !txids.iter().all(|txid| seen.insert(*txid)) {
        return Err(block_error("duplicate transaction"));
    }

    let sigops: u32 = block.transactions.iter().map(legacy_sigops).sum();
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(block_error("out-of-bounds signature operations count"));
    }

    if block.header.merkle_root != block.compute_merkle_root() {
        return Err(block_error("hashMerkleRoot mismatch"));
    }
    Ok(())
}

pub fn legacy_sigops(tx: &Transaction) -> u32 {
    let inputs: u32 = tx.vin.iter().map(|input| legacy_sigop_count(&input.script_sig)).sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| legacy_sigop_count(&output.script_pubkey))
        .sum();
    inputs + outputs
}

/// Redeem-script sigops of the inputs spending P2SH outputs.
/// `prev_scripts[i]` is the script spent by input `i`.
pub fn p2sh_sigops(tx: &Transaction, prev_scripts: &[Vec<u8>]) -> u32 {
    if tx.is_coinbase() {
        return 0;
    }
    tx.vin
        .iter()
        .zip(prev_scripts)
        .filter(|(_, script)| classify(script) == ScriptType::ScriptHash)
        .map(|(input, _)| p2sh_sigop_count(&input.script_sig))
        .sum()
}

/// Sum of output values, rejecting any value or partial sum outside the
/// money range.
pub fn value_out(tx: &Transaction) -> Result<Amount, ValidationError> {
    let mut total: Amount = 0;
    for output in &tx.vout {
        total = total.saturating_add(output.value);
        if !money_range(output.value) || !money_range(total) {
            return Err(ValidationError::Tx(
                "CTransaction::GetValueOut() : value out of range".to_string(),
            ));
        }
    }
    Ok(total)
}

pub fn is_dust(output: &TxOut) -> bool {
    let size = 148 + output.serialized_size() as i64;
    output.value < 3 * (MIN_RELAY_TX_FEE * size / 1000)
}

/// Relay policy. Returns the short rejection reason.
pub fn is_standard_tx(tx: &Transaction, height: u32, time: i64) -> Result<(), &'static str> {
    if tx.version > CURRENT_TX_VERSION || tx.version < 1 {
        return Err("version");
    }
    if !tx.is_final(height, time) {
        return Err("non-final");
    }
    if tx.size() >= MAX_STANDARD_TX_SIZE {
        return Err("tx-size");
    }

    for input in &tx.vin {
        if input.script_sig.len() > MAX_STANDARD_SCRIPT_SIG_SIZE {
            return Err("scriptsig-size");
        }
        if !is_push_only(&input.script_sig) {
            return Err("scriptsig-not-pushonly");
        }
        if !has_canonical_pushes(&input.script_sig) {
            return Err("scriptsig-non-canonical-push");
        }
    }

    let mut op_returns = 0usize;
    for output in &tx.vout {
        let script_type = classify(&output.script_pubkey);
        if script_type == ScriptType::NonStandard {
            return Err("scriptpubkey");
        }
        if script_type == ScriptType::NullData {
            op_returns += 1;
        } else if is_dust(output) {
            return Err("dust");
        }
    }
    if op_returns > 1 {
        return Err("multi-op-return");
    }
    Ok(())
}

/// Every input pushes exactly the arguments its output template (and a
/// P2SH redeem script) consumes.
pub fn are_inputs_standard(tx: &Transaction, prev_scripts: &[Vec<u8>]) -> bool {
    if tx.is_coinbase() {
        return true;
    }
    for (input, script_pubkey) in tx.vin.iter().zip(prev_scripts) {
        if !is_standard(script_pubkey) {
            return false;
        }
        let script_type = classify(script_pubkey);
        let Some(mut expected) = args_expected(script_type, script_pubkey) else {
            return false;
        };

        let Ok(pushes) = instructions(&input.script_sig).collect::<Result<Vec<_>, _>>() else {
            return false;
        };

        if script_type == ScriptType::ScriptHash {
            let Some(last) = pushes.last() else {
                return false;
            };
            let redeem: &[u8] = match last {
                utxod_script::Instruction::Push { data, .. } => data,
                utxod_script::Instruction::Op(_) => return false,
            };
            let inner = classify(redeem);
            if inner == ScriptType::ScriptHash || !is_standard(redeem) {
                return false;
            }
            let Some(inner_expected) = args_expected(inner, redeem) else {
                return false;
            };
            expected += inner_expected;
        }

        if expected != pushes.len() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::{chain_params, Network};
    use utxod_primitives::block::BlockHeader;
    use utxod_primitives::outpoint::OutPoint;
    use utxod_primitives::transaction::TxIn;
    use utxod_script::standard::{p2pkh_script, p2sh_script};

    fn spend(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([4u8; 32], 0),
                script_sig: vec![0x01, 0x20, 0x01, 0x21],
                sequence: u32::MAX,
            }],
            vout: outputs,
            lock_time: 0,
        }
    }

    fn pay(value: Amount) -> TxOut {
        TxOut {
            value,
            script_pubkey: p2pkh_script(&[9u8; 20]),
        }
    }

    #[test]
    fn rejects_duplicate_inputs() {
        let mut tx = spend(vec![pay(10_000)]);
        tx.vin.push(tx.vin[0].clone());
        assert_eq!(
            check_transaction(&tx),
            Err(ValidationError::Tx("CheckTransaction() : duplicate inputs".to_string()))
        );
    }

    #[test]
    fn rejects_null_prevout_outside_coinbase() {
        let mut tx = spend(vec![pay(10_000)]);
        tx.vin.push(TxIn {
            prevout: OutPoint::new(ZERO_HASH, 3),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        });
        assert_eq!(
            check_transaction(&tx).map_err(|err| err.reason().to_string()),
            Err("CheckTransaction() : prevout is null".to_string())
        );
    }

    #[test]
    fn dust_threshold_tracks_output_size() {
        // a p2pkh output serializes to 34 bytes: 3 * (1000 * 182 / 1000)
        assert!(is_dust(&pay(545)));
        assert!(!is_dust(&pay(546)));
    }

    #[test]
    fn standard_policy_reasons() {
        assert_eq!(is_standard_tx(&spend(vec![pay(10_000)]), 1, 0), Ok(()));
        assert_eq!(is_standard_tx(&spend(vec![pay(100)]), 1, 0), Err("dust"));

        let mut versioned = spend(vec![pay(10_000)]);
        versioned.version = 2;
        assert_eq!(is_standard_tx(&versioned, 1, 0), Err("version"));

        let op_return = TxOut {
            value: 0,
            script_pubkey: vec![0x6a, 0x01, 0x01],
        };
        assert_eq!(
            is_standard_tx(&spend(vec![op_return.clone(), pay(10_000)]), 1, 0),
            Ok(())
        );
        assert_eq!(
            is_standard_tx(&spend(vec![op_return.clone(), op_return]), 1, 0),
            Err("multi-op-return")
        );

        let mut non_push = spend(vec![pay(10_000)]);
        non_push.vin[0].script_sig = vec![0x76];
        assert_eq!(is_standard_tx(&non_push, 1, 0), Err("scriptsig-not-pushonly"));
    }

    #[test]
    fn p2sh_inputs_count_redeem_arguments() {
        // 1-of-1 multisig redeem script: OP_1 <33-byte key> OP_1 OP_CHECKMULTISIG
        let mut redeem = vec![0x51, 33, 0x02];
        redeem.extend_from_slice(&[7u8; 32]);
        redeem.extend_from_slice(&[0x51, 0xae]);
        let prev = vec![p2sh_script(&utxod_primitives::hash::hash160(&redeem))];

        let mut tx = spend(vec![pay(10_000)]);
        let mut script_sig = vec![0x00, 0x01, 0x30];
        script_sig.push(redeem.len() as u8);
        script_sig.extend_from_slice(&redeem);
        tx.vin[0].script_sig = script_sig;
        // OP_0, one signature, the redeem script
        assert!(are_inputs_standard(&tx, &prev));

        tx.vin[0].script_sig.insert(0, 0x00);
        assert!(!are_inputs_standard(&tx, &prev));
    }

    fn coinbase_paying(tag: u8, script_pubkey: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, tag, 0x01, 0x00],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey,
            }],
            lock_time: 0,
        }
    }

    fn block_of(transactions: Vec<Transaction>) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 2,
                prev_block: [1u8; 32],
                merkle_root: [0u8; 32],
                time: 1_000,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }

    fn block_verdict(block: &Block) -> Result<(), String> {
        let params = chain_params(Network::Regtest).consensus;
        check_block(block, &params, 2_000, false).map_err(|err| err.reason().to_string())
    }

    #[test]
    fn structural_block_failures() {
        let coinbase = coinbase_paying(1, p2pkh_script(&[9u8; 20]));
        let payment = spend(vec![pay(10_000)]);
        assert_eq!(block_verdict(&block_of(vec![coinbase.clone(), payment.clone()])), Ok(()));

        let cases = [
            (block_of(Vec::new()), "CheckBlock() : size limits failed"),
            (
                block_of(vec![coinbase_paying(1, vec![0x6a; MAX_BLOCK_SIZE])]),
                "CheckBlock() : size limits failed",
            ),
            (block_of(vec![payment.clone()]), "CheckBlock() : first tx is not coinbase"),
            (
                block_of(vec![coinbase.clone(), coinbase_paying(2, pay(1).script_pubkey)]),
                "CheckBlock() : more than one coinbase",
            ),
            (
                block_of(vec![coinbase.clone(), payment.clone(), payment.clone()]),
                "CheckBlock() : duplicate transaction",
            ),
            (
                block_of(vec![coinbase_paying(1, vec![0xac; MAX_BLOCK_SIGOPS as usize + 1])]),
                "CheckBlock() : out-of-bounds signature operations count",
            ),
        ];
        for (block, reason) in cases {
            assert_eq!(block_verdict(&block), Err(reason.to_string()));
        }

        let mut late = block_of(vec![coinbase.clone()]);
        late.header.time = 2_001;
        assert_eq!(
            block_verdict(&late),
            Err("CheckBlock() : block timestamp too far in the future".to_string())
        );

        let mut tampered = block_of(vec![coinbase, payment]);
        tampered.header.merkle_root = [0u8; 32];
        assert_eq!(
            block_verdict(&tampered),
            Err("CheckBlock() : hashMerkleRoot mismatch".to_string())
        );
    }
}
