//! Block index, validator, best-chain selection, and reorganization.

pub mod blockfiles;
pub mod blockindex;
pub mod index;
pub mod kernel;
pub mod notify;
pub mod state;
pub mod trust;
pub mod txindex;
pub mod validation;

pub use blockfiles::{BlockFilePos, BlockFileStore};
pub use notify::ChainNotifier;
pub use state::{BlockOutcome, ChainState, TxSource};
pub use validation::{ErrorKind, ValidationError, ValidationFlags};
