//! Input script verification.

use std::sync::OnceLock;

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use utxod_primitives::hash::hash160;
use utxod_primitives::transaction::Transaction;

use crate::sighash::signature_hash;
use crate::standard::{classify, multisig_keys, pubkey_hash, pubkey_of, script_hash, ScriptType};
use crate::{push_data, ScriptError};

pub const SCRIPT_VERIFY_NONE: u32 = 0;
/// Evaluate the redeem script of pay-to-script-hash outputs (BIP16).
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;

/// Decides whether a transaction input may spend an output script.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_pubkey: &[u8],
        flags: u32,
    ) -> Result<(), ScriptError>;
}

/// Accepts every input. For nodes that trust their block source.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoScriptChecks;

impl ScriptVerifier for NoScriptChecks {
    fn verify_input(&self, _: &Transaction, _: usize, _: &[u8], _: u32) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Verifies ECDSA signatures for the standard templates (pubkey, pubkey
/// hash, bare multisig and P2SH wrapping one of those). Any other output
/// script is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignatureChecker;

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

impl ScriptVerifier for SignatureChecker {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_pubkey: &[u8],
        flags: u32,
    ) -> Result<(), ScriptError> {
        let input = tx.vin.get(input_index).ok_or(ScriptError::StackSize)?;
        let mut stack = push_data(&input.script_sig).ok_or(ScriptError::NonPushScriptSig)?;

        if classify(script_pubkey) == ScriptType::ScriptHash {
            let expected = script_hash(script_pubkey).ok_or(ScriptError::UnsupportedTemplate)?;
            let redeem = stack.pop().ok_or(ScriptError::StackSize)?;
            if hash160(&redeem) != expected {
                return Err(ScriptError::HashMismatch);
            }
            if flags & SCRIPT_VERIFY_P2SH == 0 {
                return Ok(());
            }
            if classify(&redeem) == ScriptType::ScriptHash {
                return Err(ScriptError::UnsupportedTemplate);
            }
            return check_template(tx, input_index, &redeem, &stack);
        }

        check_template(tx, input_index, script_pubkey, &stack)
    }
}

fn check_template(
    tx: &Transaction,
    input_index: usize,
    script: &[u8],
    stack: &[Vec<u8>],
) -> Result<(), ScriptError> {
    match classify(script) {
        ScriptType::PubKey => {
            let [sig] = stack else {
                return Err(ScriptError::StackSize);
            };
            let pubkey = pubkey_of(script).ok_or(ScriptError::UnsupportedTemplate)?;
            check_sig(tx, input_index, script, sig, pubkey)
        }
        ScriptType::PubKeyHash => {
            let [sig, pubkey] = stack else {
                return Err(ScriptError::StackSize);
            };
            let expected = pubkey_hash(script).ok_or(ScriptError::UnsupportedTemplate)?;
            if hash160(pubkey) != expected {
                return Err(ScriptError::HashMismatch);
            }
            check_sig(tx, input_index, script, sig, pubkey)
        }
        ScriptType::Multisig => {
            let (required, keys) = multisig_keys(script).ok_or(ScriptError::UnsupportedTemplate)?;
            // CHECKMULTISIG pops one extra item.
            let Some((_, sigs)) = stack.split_first() else {
                return Err(ScriptError::StackSize);
            };
            if sigs.len() != required {
                return Err(ScriptError::StackSize);
            }
            let mut keys = keys.into_iter();
            for sig in sigs {
                loop {
                    let key = keys.next().ok_or(ScriptError::SignatureFailed)?;
                    if check_sig(tx, input_index, script, sig, key).is_ok() {
                        break;
                    }
                }
            }
            Ok(())
        }
        ScriptType::NullData => Err(ScriptError::Unspendable),
        ScriptType::ScriptHash | ScriptType::NonStandard => Err(ScriptError::UnsupportedTemplate),
    }
}

fn check_sig(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sig: &[u8],
    pubkey: &[u8],
) -> Result<(), ScriptError> {
    let (hash_type, der) = sig.split_last().ok_or(ScriptError::SignatureFailed)?;
    let mut signature = Signature::from_der_lax(der).map_err(|_| ScriptError::SignatureFailed)?;
    signature.normalize_s();
    let pubkey = PublicKey::from_slice(pubkey).map_err(|_| ScriptError::SignatureFailed)?;
    let digest = signature_hash(tx, input_index, script_code, *hash_type as u32);
    let message = Message::from_digest(digest);
    secp()
        .verify_ecdsa(&message, &signature, &pubkey)
        .map_err(|_| ScriptError::SignatureFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sighash::SIGHASH_ALL;
    use crate::standard::{p2pkh_script, p2sh_script};
    use secp256k1::SecretKey;
    use utxod_primitives::outpoint::OutPoint;
    use utxod_primitives::transaction::{TxIn, TxOut};

    fn key(tag: u8) -> (SecretKey, Vec<u8>) {
        let secret = SecretKey::from_slice(&[tag; 32]).expect("secret key");
        let public = PublicKey::from_secret_key(&Secp256k1::signing_only(), &secret);
        (secret, public.serialize().to_vec())
    }

    fn spend() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([3; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 1_000,
                script_pubkey: p2pkh_script(&[8; 20]),
            }],
            lock_time: 0,
        }
    }

    fn sign(tx: &Transaction, script_code: &[u8], secret: &SecretKey) -> Vec<u8> {
        let digest = signature_hash(tx, 0, script_code, SIGHASH_ALL);
        let sig = Secp256k1::signing_only().sign_ecdsa(&Message::from_digest(digest), secret);
        let mut out = sig.serialize_der().to_vec();
        out.push(SIGHASH_ALL as u8);
        out
    }

    fn push(script: &mut Vec<u8>, data: &[u8]) {
        script.push(data.len() as u8);
        script.extend_from_slice(data);
    }

    #[test]
    fn verifies_pubkey_hash_spend() {
        let (secret, pubkey) = key(1);
        let script_pubkey = p2pkh_script(&hash160(&pubkey));
        let mut tx = spend();
        let sig = sign(&tx, &script_pubkey, &secret);
        let mut script_sig = Vec::new();
        push(&mut script_sig, &sig);
        push(&mut script_sig, &pubkey);
        tx.vin[0].script_sig = script_sig;

        assert_eq!(SignatureChecker.verify_input(&tx, 0, &script_pubkey, SCRIPT_VERIFY_NONE), Ok(()));

        let mut tampered = tx.clone();
        tampered.vout[0].value = 999;
        assert_eq!(
            SignatureChecker.verify_input(&tampered, 0, &script_pubkey, SCRIPT_VERIFY_NONE),
            Err(ScriptError::SignatureFailed)
        );

        let (_, other) = key(2);
        let wrong = p2pkh_script(&hash160(&other));
        assert_eq!(
            SignatureChecker.verify_input(&tx, 0, &wrong, SCRIPT_VERIFY_NONE),
            Err(ScriptError::HashMismatch)
        );
    }

    #[test]
    fn verifies_p2sh_multisig_spend() {
        let (secret_a, pubkey_a) = key(1);
        let (secret_b, pubkey_b) = key(2);
        let (_, pubkey_c) = key(3);
        let mut redeem = vec![crate::opcodes::OP_2];
        for pubkey in [&pubkey_a, &pubkey_b, &pubkey_c] {
            push(&mut redeem, pubkey);
        }
        redeem.push(crate::opcodes::OP_3);
        redeem.push(crate::opcodes::OP_CHECKMULTISIG);
        let script_pubkey = p2sh_script(&hash160(&redeem));

        let mut tx = spend();
        let mut script_sig = vec![crate::opcodes::OP_0];
        push(&mut script_sig, &sign(&tx, &redeem, &secret_a));
        push(&mut script_sig, &sign(&tx, &redeem, &secret_b));
        script_sig.push(crate::opcodes::OP_PUSHDATA1);
        push(&mut script_sig, &redeem);
        tx.vin[0].script_sig = script_sig;

        assert_eq!(SignatureChecker.verify_input(&tx, 0, &script_pubkey, SCRIPT_VERIFY_P2SH), Ok(()));

        let mut swapped = vec![crate::opcodes::OP_0];
        push(&mut swapped, &sign(&tx, &redeem, &secret_b));
        push(&mut swapped, &sign(&tx, &redeem, &secret_a));
        swapped.push(crate::opcodes::OP_PUSHDATA1);
        push(&mut swapped, &redeem);
        let mut out_of_order = tx.clone();
        out_of_order.vin[0].script_sig = swapped;
        assert_eq!(
            SignatureChecker.verify_input(&out_of_order, 0, &script_pubkey, SCRIPT_VERIFY_P2SH),
            Err(ScriptError::SignatureFailed)
        );
    }

    #[test]
    fn rejects_non_push_script_sig() {
        let mut tx = spend();
        tx.vin[0].script_sig = vec![crate::opcodes::OP_DUP];
        assert_eq!(
            SignatureChecker.verify_input(&tx, 0, &p2pkh_script(&[0; 20]), SCRIPT_VERIFY_NONE),
            Err(ScriptError::NonPushScriptSig)
        );
        assert_eq!(NoScriptChecks.verify_input(&tx, 0, &[], SCRIPT_VERIFY_NONE), Ok(()));
    }
}
