// Thin re-export module: block types live in `blockchain/block.rs`, the
// canonical chain in `blockchain/ledger.rs`.

pub mod block;
pub mod ledger;

pub use block::*;
pub use ledger::*;
