//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use encoding::sha256d;
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
