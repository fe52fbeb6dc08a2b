// The ledger lives in `blockchain/core`: block and chain types, the derived
// state fold, and block validation.

pub mod core;
pub use core::*;
