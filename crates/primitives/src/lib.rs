//! Core block/transaction types and consensus serialization.

pub mod address;
pub mod block;
pub mod encoding;
pub mod genesis;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use address::{Address, AddressError, AddressKind};
pub use block::{merkle_root, Block, BlockHeader};
pub use genesis::genesis_block;
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
