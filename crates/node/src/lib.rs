//! Node-side plumbing around the consensus core: the memory pool, the gossip
//! dispatcher, and the wire message model.

pub mod dispatch;
pub mod mempool;
pub mod sync;
pub mod wire;
