//! Error types for the sleuth client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum SleuthError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC connection error: {0}")]
    RpcConnection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for {address}: {message}")]
    Nonce { address: String, message: String },

    #[error("Key sync timeout after {timeout_secs}s, consider increasing key_sync_timeout or adding more keys")]
    KeySyncTimeout { timeout_secs: u64 },

    #[error("Key #{key_num} failed to sync after {retries} retries: {message}")]
    KeySyncFailed {
        key_num: usize,
        retries: u32,
        message: String,
    },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Failed to fetch enough block headers for congestion calculation: {0}")]
    BlockFetching(String),

    #[error("Bumped gas price {attempted} exceeds configured maximum {ceiling}")]
    BumpCeiling { attempted: String, ceiling: String },

    #[error("Transaction was confirmed before bumping gas: {0}")]
    AlreadyConfirmed(String),

    #[error("Sender {0} not found among configured signing keys")]
    UnknownSender(String),

    #[error("No ABI method found for selector 0x{selector}")]
    NoAbiMethod { selector: String },

    #[error("No ABI named '{0}' in contract store")]
    NoAbiFound(String),

    #[error("Failed to decode transaction input: {0}")]
    DecodeInput(String),

    #[error("No trace found for transaction {0}")]
    NoTrace(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SleuthError {
    /// Check if error is retryable at the transport level
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SleuthError::RpcConnection(_) | SleuthError::Timeout { .. }
        )
    }
}

/// Result type for client operations
pub type SleuthResult<T> = Result<T, SleuthError>;
