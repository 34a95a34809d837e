//! Wire codec, hashing, and the transaction/block data model.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader, PobFields};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
