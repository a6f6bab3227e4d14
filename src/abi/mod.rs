//! ABI registry and signature resolution

mod finder;
mod store;

pub use finder::{AbiFinder, AbiFinderResult, UNKNOWN};
pub use store::{ContractMap, ContractStore};
