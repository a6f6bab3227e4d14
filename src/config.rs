//! Configuration for the sleuth client
//!
//! Loads configuration from TOML with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Transaction priority tier. Selects the historical fee percentile and the
/// price adjustment factor used during gas estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Undocumented tier for when the highest possible gas price is needed
    Degen,
    Fast,
    Standard,
    Slow,
    /// Let the node decide; no adjustments are applied
    Auto,
}

/// Strategy for aggregating per-block gas-used ratios into a congestion metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionStrategy {
    /// Each block has the same weight
    Simple,
    /// Newer blocks weigh more (logarithmic decay)
    NewestFirst,
}

/// Experimental toggles. These are unsafe on live networks and must be
/// opted into explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Experiment {
    /// Clamps base fee and tip to the same order of magnitude when they
    /// differ by more than 3 decimal orders. DO NOT enable on live networks.
    UnsafeFeeEqualizer,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    #[serde(default)]
    pub gas_bump: GasBumpConfig,
    #[serde(default)]
    pub nonce_manager: NonceManagerConfig,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    /// Directory for per-transaction decoded call JSON artifacts, if any
    #[serde(default)]
    pub trace_output_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub chain_id: Option<u64>,
    /// Private keys of the signing keys managed by the client, hex-encoded
    #[serde(default)]
    pub private_keys: Vec<String>,
    /// How long to wait for a transaction to be mined before declaring it stuck
    #[serde(default = "default_txn_timeout_secs")]
    pub txn_timeout_secs: u64,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Use EIP-1559 dynamic fees instead of legacy gas price
    #[serde(default = "default_true")]
    pub eip1559_dynamic_fees: bool,
    /// Static fallback prices used when estimation is disabled or fails
    #[serde(default)]
    pub gas_price: u64,
    #[serde(default)]
    pub gas_fee_cap: u64,
    #[serde(default)]
    pub gas_tip_cap: u64,
    pub gas_estimation: GasEstimationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasEstimationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of historical blocks used for fee percentiles and congestion.
    /// Zero disables both history and congestion buffering.
    #[serde(default = "default_estimation_blocks")]
    pub blocks: u64,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_congestion_strategy")]
    pub congestion_strategy: CongestionStrategy,
    /// How many times node fee suggestions are retried before giving up
    #[serde(default = "default_attempt_count")]
    pub attempt_count: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GasBumpConfig {
    /// Number of gas bump attempts for a stuck transaction; zero disables bumping
    #[serde(default)]
    pub retries: u32,
    /// Hard ceiling in wei for any bumped price; zero means no ceiling
    #[serde(default)]
    pub max_gas_price: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NonceManagerConfig {
    /// Sync polls per second allowed across all key watchers
    pub key_sync_rate_limit_per_sec: u32,
    pub key_sync_timeout_secs: u64,
    pub key_sync_retries: u32,
    pub key_sync_retry_delay_millis: u64,
}

impl Default for NonceManagerConfig {
    fn default() -> Self {
        Self {
            key_sync_rate_limit_per_sec: 10,
            key_sync_timeout_secs: 30,
            key_sync_retries: 30,
            key_sync_retry_delay_millis: 1_000,
        }
    }
}

fn default_txn_timeout_secs() -> u64 {
    300
}

fn default_dial_timeout_secs() -> u64 {
    60
}

fn default_estimation_blocks() -> u64 {
    20
}

fn default_attempt_count() -> u32 {
    3
}

fn default_priority() -> Priority {
    Priority::Standard
}

fn default_congestion_strategy() -> CongestionStrategy {
    CongestionStrategy::NewestFirst
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML string with `${ENV_VAR}` substitution
    pub fn from_toml(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        let config: Config =
            toml::from_str(&substituted).with_context(|| "Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&raw)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.network.rpc_urls.is_empty() {
            anyhow::bail!("Network '{}' has no RPC URLs configured", self.network.name);
        }
        if self.nonce_manager.key_sync_rate_limit_per_sec == 0 {
            anyhow::bail!(
                "key_sync_rate_limit_per_sec must be positive; it controls how many sync attempts per second are allowed"
            );
        }
        if self.nonce_manager.key_sync_timeout_secs == 0 {
            anyhow::bail!(
                "key_sync_timeout_secs must be positive; it is how long to wait for a key to sync before timing out"
            );
        }
        if self.nonce_manager.key_sync_retries == 0 {
            anyhow::bail!(
                "key_sync_retries must be positive; it is how many times to retry syncing a key before giving up"
            );
        }
        if self.network.gas_estimation.attempt_count == 0 {
            anyhow::bail!("gas_estimation.attempt_count must be positive");
        }
        if self.is_experiment_enabled(Experiment::UnsafeFeeEqualizer) {
            tracing::warn!(
                "UNSAFE_FEE_EQUALIZER experiment is enabled. It silently clamps base fee and tip \
                 to the same order of magnitude and is dangerous on live networks"
            );
        }
        Ok(())
    }

    pub fn is_experiment_enabled(&self, experiment: Experiment) -> bool {
        self.experiments.contains(&experiment)
    }

    pub fn txn_timeout(&self) -> Duration {
        Duration::from_secs(self.network.txn_timeout_secs)
    }

    /// Whether gas bumping of stuck transactions is enabled
    pub fn gas_bumps_enabled(&self) -> bool {
        self.gas_bump.retries > 0
    }

    pub fn has_max_bump_gas_price(&self) -> bool {
        self.gas_bump.max_gas_price > 0
    }
}

impl NetworkConfig {
    /// How long the initial node handshake may take before giving up
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

impl NonceManagerConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.key_sync_timeout_secs)
    }

    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_millis(self.key_sync_retry_delay_millis)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
