//! Hard-coded genesis blocks.

use utxod_consensus::money::COIN;
use utxod_consensus::params::Network;

use crate::block::{merkle_root, Block, BlockHeader};
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut};

const GENESIS_TIMESTAMP: &[u8] = b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_PUBKEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

pub fn genesis_block(network: Network) -> Block {
    let (time, bits, nonce) = match network {
        Network::Mainnet => (1_231_006_505, 0x1d00_ffff, 2_083_236_893),
        Network::Testnet => (1_296_688_602, 0x1d00_ffff, 414_098_458),
        Network::Regtest => (1_296_688_602, 0x207f_ffff, 2),
    };

    let mut script_sig = vec![0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04];
    script_sig.push(GENESIS_TIMESTAMP.len() as u8);
    script_sig.extend_from_slice(GENESIS_TIMESTAMP);

    let mut script_pubkey = Vec::with_capacity(67);
    script_pubkey.push(GENESIS_PUBKEY.len() as u8);
    script_pubkey.extend_from_slice(&GENESIS_PUBKEY);
    script_pubkey.push(0xac);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey,
        }],
        lock_time: 0,
    };

    Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: merkle_root(&[coinbase.txid()]),
            time,
            bits,
            nonce,
        },
        transactions: vec![coinbase],
    }
}
