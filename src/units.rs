//! Wei conversion helpers for fee logging

use ethers::types::U256;

const WEI_PER_GWEI: f64 = 1e9;
const WEI_PER_ETH: f64 = 1e18;

/// Lossy conversion for log output; values beyond u128 saturate
fn to_f64(wei: U256) -> f64 {
    wei.min(U256::from(u128::MAX)).as_u128() as f64
}

pub fn wei_to_gwei(wei: U256) -> f64 {
    to_f64(wei) / WEI_PER_GWEI
}

pub fn wei_to_eth(wei: U256) -> f64 {
    to_f64(wei) / WEI_PER_ETH
}

pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(9)
}

pub fn eth(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(18)
}
