//! Address projections: which outputs and ledger entries belong to an address.

use utxod_consensus::money::Amount;
use utxod_consensus::ChainParams;
use utxod_primitives::outpoint::OutPoint;
use utxod_script::standard::extract_addresses;
use utxod_storage::{Column, KeyValueStore, StagedStore, StoreError};

use crate::records::{LedgerEntry, OutputRecord};

/// Ledger rows for outputs and inputs without a recognizable address are
/// filed under the empty address.
pub const UNKNOWN_ADDRESS: &str = "";

const OUTPOINT_KEY_LEN: usize = 36;

/// Length-prefixed address bytes, so one address is never a prefix of another.
pub fn address_prefix(address: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.len() + 1 + OUTPOINT_KEY_LEN);
    key.push(address.len() as u8);
    key.extend_from_slice(address.as_bytes());
    key
}

pub fn address_outpoint_key(address: &str, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(&outpoint.key());
    key
}

fn outpoint_from_key(address: &str, key: &[u8]) -> Option<OutPoint> {
    let start = address.len() + 1;
    if key.len() != start + OUTPOINT_KEY_LEN {
        return None;
    }
    OutPoint::from_key(&key[start..])
}

/// Renders script destinations as base58check strings for one network.
#[derive(Clone, Copy, Debug)]
pub struct AddressEncoder {
    pubkey_prefix: u8,
    script_prefix: u8,
}

impl AddressEncoder {
    pub fn new(params: &ChainParams) -> Self {
        Self {
            pubkey_prefix: params.pubkey_address_prefix,
            script_prefix: params.script_address_prefix,
        }
    }

    pub fn addresses(&self, script_pubkey: &[u8]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for address in extract_addresses(script_pubkey) {
            let encoded = address.encode(self.pubkey_prefix, self.script_prefix);
            if !out.contains(&encoded) {
                out.push(encoded);
            }
        }
        out
    }
}

/// Addresses a row is filed under: its own, or the unknown address.
pub fn ledger_addresses(addresses: &[String]) -> Vec<&str> {
    if addresses.is_empty() {
        vec![UNKNOWN_ADDRESS]
    } else {
        addresses.iter().map(String::as_str).collect()
    }
}

pub(crate) fn put_address_outputs<S: KeyValueStore>(
    db: &mut StagedStore<S>,
    outpoint: &OutPoint,
    record: &OutputRecord,
) -> Result<(), StoreError> {
    for address in ledger_addresses(&record.addresses) {
        db.put(
            Column::AddressOutput,
            address_outpoint_key(address, outpoint),
            Vec::new(),
        )?;
    }
    Ok(())
}

/// Keeps the UTXO projection in step with an output's spendability.
pub(crate) fn sync_utxo<S: KeyValueStore>(
    db: &mut StagedStore<S>,
    outpoint: &OutPoint,
    record: &OutputRecord,
) -> Result<(), StoreError> {
    let key = outpoint.key().to_vec();
    if record.is_spendable() {
        db.put(Column::Utxo, key, record.amount.to_le_bytes().to_vec())?;
        for address in ledger_addresses(&record.addresses) {
            db.put(
                Column::AddressUtxo,
                address_outpoint_key(address, outpoint),
                record.amount.to_le_bytes().to_vec(),
            )?;
        }
    } else {
        db.delete(Column::Utxo, key)?;
        for address in ledger_addresses(&record.addresses) {
            db.delete(Column::AddressUtxo, address_outpoint_key(address, outpoint))?;
        }
    }
    Ok(())
}

pub(crate) fn put_ledger_entry<S: KeyValueStore>(
    db: &mut StagedStore<S>,
    entry: &LedgerEntry,
) -> Result<(), StoreError> {
    let amount = entry.amount.to_le_bytes().to_vec();
    db.put(Column::Ledger, entry.key(), amount.clone())?;
    db.put(Column::AddressLedger, entry.address_key(), amount)
}

pub(crate) fn delete_ledger_entry<S: KeyValueStore>(
    db: &mut StagedStore<S>,
    entry: &LedgerEntry,
) -> Result<(), StoreError> {
    db.delete(Column::Ledger, entry.key())?;
    db.delete(Column::AddressLedger, entry.address_key())
}

/// Outpoints ever paid to `address`, in key order.
pub(crate) fn address_outpoints<S: KeyValueStore>(
    db: &StagedStore<S>,
    address: &str,
) -> Result<Vec<OutPoint>, StoreError> {
    let prefix = address_prefix(address);
    let entries = db.scan_prefix(Column::AddressOutput, &prefix)?;
    Ok(entries
        .iter()
        .filter_map(|(key, _)| outpoint_from_key(address, key))
        .collect())
}

/// Sum of the UTXO projection for `address`.
pub(crate) fn utxo_balance<S: KeyValueStore>(
    db: &StagedStore<S>,
    address: &str,
) -> Result<Amount, StoreError> {
    let prefix = address_prefix(address);
    let mut total: Amount = 0;
    for (_, value) in db.scan_prefix(Column::AddressUtxo, &prefix)? {
        let mut bytes = [0u8; 8];
        if value.len() == 8 {
            bytes.copy_from_slice(&value);
        }
        total += i64::from_le_bytes(bytes);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_consensus::{chain_params, Network};
    use utxod_primitives::transaction::TxOut;
    use utxod_script::standard::p2pkh_script;
    use utxod_storage::memory::MemoryStore;

    use crate::records::Branch;

    #[test]
    fn address_prefixes_do_not_collide() {
        let short = address_prefix("1abc");
        let long = address_prefix("1abcd");
        assert!(!long.starts_with(&short));
    }

    #[test]
    fn encodes_p2pkh_destination() {
        let encoder = AddressEncoder::new(&chain_params(Network::Mainnet));
        let script = p2pkh_script(&[0u8; 20]);
        assert_eq!(
            encoder.addresses(&script),
            vec!["1111111111111111111114oLvT2".to_string()]
        );
        assert!(encoder.addresses(&[0x6a]).is_empty());
    }

    #[test]
    fn utxo_projection_follows_spent_flag() {
        let mut db = StagedStore::new(MemoryStore::new());
        let outpoint = OutPoint::new([3u8; 32], 1);
        let mut record = OutputRecord::new(
            &TxOut {
                value: 700,
                script_pubkey: vec![0x51],
            },
            vec!["addr".to_string()],
            false,
            Branch::Main,
        );
        put_address_outputs(&mut db, &outpoint, &record).expect("address rows");
        sync_utxo(&mut db, &outpoint, &record).expect("utxo");
        assert_eq!(utxo_balance(&db, "addr").expect("balance"), 700);
        assert_eq!(address_outpoints(&db, "addr").expect("outpoints"), vec![outpoint.clone()]);

        record.spent = true;
        sync_utxo(&mut db, &outpoint, &record).expect("utxo");
        assert_eq!(utxo_balance(&db, "addr").expect("balance"), 0);
        assert!(db.get(Column::Utxo, &outpoint.key()).expect("get").is_none());
    }
}
