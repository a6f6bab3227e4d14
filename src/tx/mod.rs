//! Transaction lifecycle: nonce management, fee estimation, gas bumping

pub mod bump;
pub mod gas;
pub mod nonce;
