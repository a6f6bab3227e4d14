//! Replacement of stuck transactions with gas-bumped copies
//!
//! A transaction that has not been mined within the configured timeout is
//! re-signed with higher fees at the same nonce and re-broadcast, up to the
//! configured number of retries.

use crate::chain::NodeProvider;
use crate::config::{Config, Priority};
use crate::error::{SleuthError, SleuthResult};

use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maps a previous gas price to a bumped one
pub type GasBumpStrategy = Arc<dyn Fn(U256) -> U256 + Send + Sync>;

/// Bump strategy matching a priority tier: degen doubles the price, fast
/// adds 30%, standard 15%, slow 5%. Auto applies no bump.
pub fn priority_based_bump_strategy(priority: Priority) -> GasBumpStrategy {
    match priority {
        Priority::Degen => Arc::new(|price| price * 2u64),
        Priority::Fast => Arc::new(|price| price * 130u64 / 100u64),
        Priority::Standard => Arc::new(|price| price * 115u64 / 100u64),
        Priority::Slow => Arc::new(|price| price * 105u64 / 100u64),
        Priority::Auto => Arc::new(|price| price),
    }
}

/// Waits for transactions to be mined and replaces stuck ones
pub struct TxBumper {
    provider: Arc<NodeProvider>,
    cfg: Arc<Config>,
    wallets: HashMap<Address, LocalWallet>,
    strategy: GasBumpStrategy,
}

impl TxBumper {
    pub fn new(
        provider: Arc<NodeProvider>,
        cfg: Arc<Config>,
        wallets: HashMap<Address, LocalWallet>,
        strategy: GasBumpStrategy,
    ) -> Self {
        Self {
            provider,
            cfg,
            wallets,
            strategy,
        }
    }

    /// Hash of the signed encoding of a transaction
    pub fn tx_hash(tx: &TypedTransaction, signature: &Signature) -> H256 {
        H256::from(keccak256(tx.rlp_signed(signature)))
    }

    /// Wait for a broadcast transaction to be mined. On timeout, if bumping
    /// is enabled, replace it with a higher-fee copy at the same nonce and
    /// keep waiting, up to the configured retries. The last concrete error
    /// is surfaced if every attempt fails.
    pub async fn wait_mined(
        &self,
        mut tx: TypedTransaction,
        mut signature: Signature,
    ) -> SleuthResult<TransactionReceipt> {
        let mut hash = Self::tx_hash(&tx, &signature);
        let timeout = self.cfg.txn_timeout();
        let attempts = if self.cfg.gas_bumps_enabled() {
            self.cfg.gas_bump.retries
        } else {
            0
        };

        for attempt in 0..=attempts {
            if let Some(receipt) = self.wait_for_receipt(hash, timeout).await? {
                if attempt > 0 {
                    info!(hash = ?hash, attempt, "Bumped transaction was mined");
                }
                return Ok(receipt);
            }

            // the receipt may have landed between the last poll and now
            if let Some(mined) = self.check_already_mined(hash).await? {
                return Ok(mined);
            }

            if attempt == attempts {
                break;
            }

            warn!(hash = ?hash, attempt, "Transaction still pending after timeout, bumping gas");
            (tx, signature) = self.bump_and_rebroadcast(tx, &signature).await?;
            hash = Self::tx_hash(&tx, &signature);
        }

        Err(SleuthError::Timeout {
            operation: format!("waiting for transaction {hash:?} to be mined"),
        })
    }

    /// Poll for a receipt until the timeout elapses. `Ok(None)` means the
    /// transaction is still pending.
    async fn wait_for_receipt(
        &self,
        hash: H256,
        timeout: Duration,
    ) -> SleuthResult<Option<TransactionReceipt>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut ticker = tokio::time::interval(RECEIPT_POLL_INTERVAL);
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            ticker.tick().await;
            if let Some(receipt) = self.provider.get_transaction_receipt(hash).await? {
                return Ok(Some(receipt));
            }
        }
    }

    /// If the transaction was mined while we were deciding to bump, return
    /// its receipt instead of replacing it
    async fn check_already_mined(&self, hash: H256) -> SleuthResult<Option<TransactionReceipt>> {
        match self.provider.get_transaction(hash).await? {
            Some(tx) if tx.block_number.is_some() => {
                match self.provider.get_transaction_receipt(hash).await? {
                    Some(receipt) => Ok(Some(receipt)),
                    None => Err(SleuthError::AlreadyConfirmed(format!(
                        "transaction {hash:?} is mined but its receipt is not yet available"
                    ))),
                }
            }
            // still in the mempool, or dropped entirely; either way a
            // replacement at the same nonce is the right move
            _ => Ok(None),
        }
    }

    async fn bump_and_rebroadcast(
        &self,
        mut tx: TypedTransaction,
        old_signature: &Signature,
    ) -> SleuthResult<(TypedTransaction, Signature)> {
        let sender = old_signature
            .recover(tx.sighash())
            .map_err(|e| SleuthError::UnknownSender(e.to_string()))?;
        let wallet = self.wallets.get(&sender).ok_or_else(|| {
            SleuthError::UnknownSender(format!("no managed key for sender {sender:?}"))
        })?;

        self.bump_fees(&mut tx)?;

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SleuthError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = self.provider.send_raw_transaction(raw).await?;
        info!(hash = ?hash, nonce = ?tx.nonce(), "Broadcast replacement transaction");
        Ok((tx, signature))
    }

    /// Raise the fee fields of a transaction in place, enforcing the
    /// configured ceiling before any broadcast happens
    pub fn bump_fees(&self, tx: &mut TypedTransaction) -> SleuthResult<()> {
        match tx {
            TypedTransaction::Legacy(inner) => {
                let old = inner.gas_price.unwrap_or_default();
                let new = (self.strategy)(old);
                self.ensure_under_ceiling(new)?;
                debug!(old = %old, new = %new, "Bumped legacy gas price");
                inner.gas_price = Some(new);
            }
            TypedTransaction::Eip2930(inner) => {
                let old = inner.tx.gas_price.unwrap_or_default();
                let new = (self.strategy)(old);
                self.ensure_under_ceiling(new)?;
                debug!(old = %old, new = %new, "Bumped EIP-2930 gas price");
                inner.tx.gas_price = Some(new);
            }
            TypedTransaction::Eip1559(inner) => {
                let old_fee = inner.max_fee_per_gas.unwrap_or_default();
                let old_tip = inner.max_priority_fee_per_gas.unwrap_or_default();
                let new_fee = (self.strategy)(old_fee);
                let new_tip = (self.strategy)(old_tip);
                self.ensure_under_ceiling(new_fee)?;
                debug!(
                    old_fee = %old_fee, new_fee = %new_fee,
                    old_tip = %old_tip, new_tip = %new_tip,
                    "Bumped EIP-1559 fees"
                );
                inner.max_fee_per_gas = Some(new_fee);
                inner.max_priority_fee_per_gas = Some(new_tip.min(new_fee));
            }
        }
        Ok(())
    }

    fn ensure_under_ceiling(&self, price: U256) -> SleuthResult<()> {
        if self.cfg.has_max_bump_gas_price() {
            let ceiling = U256::from(self.cfg.gas_bump.max_gas_price);
            if price > ceiling {
                return Err(SleuthError::BumpCeiling {
                    attempted: price.to_string(),
                    ceiling: ceiling.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::transaction::eip1559::Eip1559TransactionRequest;
    use ethers::types::TransactionRequest;

    fn test_config(max_gas_price: u64) -> Arc<Config> {
        let raw = format!(
            r#"
            [network]
            name = "anvil"
            rpc_urls = ["http://localhost:1"]

            [network.gas_estimation]

            [gas_bump]
            retries = 3
            max_gas_price = {max_gas_price}
            "#
        );
        Arc::new(Config::from_toml(&raw).unwrap())
    }

    fn test_bumper(max_gas_price: u64, priority: Priority) -> TxBumper {
        let cfg = test_config(max_gas_price);
        let provider = Arc::new(NodeProvider::new(&cfg.network).unwrap());
        TxBumper::new(
            provider,
            cfg,
            HashMap::new(),
            priority_based_bump_strategy(priority),
        )
    }

    #[test]
    fn test_bump_strategy_percentages() {
        let price = U256::from(1_000u64);
        assert_eq!(priority_based_bump_strategy(Priority::Degen)(price), U256::from(2_000u64));
        assert_eq!(priority_based_bump_strategy(Priority::Fast)(price), U256::from(1_300u64));
        assert_eq!(priority_based_bump_strategy(Priority::Standard)(price), U256::from(1_150u64));
        assert_eq!(priority_based_bump_strategy(Priority::Slow)(price), U256::from(1_050u64));
        assert_eq!(priority_based_bump_strategy(Priority::Auto)(price), price);
    }

    #[test]
    fn test_bump_legacy_gas_price() {
        let bumper = test_bumper(0, Priority::Standard);
        let mut tx: TypedTransaction = TransactionRequest::new()
            .gas_price(U256::from(100u64))
            .into();
        bumper.bump_fees(&mut tx).unwrap();
        assert_eq!(tx.gas_price(), Some(U256::from(115u64)));
    }

    #[test]
    fn test_bump_eip1559_raises_both_fees() {
        let bumper = test_bumper(0, Priority::Fast);
        let mut tx: TypedTransaction = Eip1559TransactionRequest::new()
            .max_fee_per_gas(U256::from(1_000u64))
            .max_priority_fee_per_gas(U256::from(100u64))
            .into();
        bumper.bump_fees(&mut tx).unwrap();
        let TypedTransaction::Eip1559(inner) = tx else {
            panic!("expected an EIP-1559 transaction");
        };
        assert_eq!(inner.max_fee_per_gas, Some(U256::from(1_300u64)));
        assert_eq!(inner.max_priority_fee_per_gas, Some(U256::from(130u64)));
    }

    #[test]
    fn test_bump_ceiling_rejected_before_broadcast() {
        let bumper = test_bumper(110, Priority::Standard);
        let mut tx: TypedTransaction = TransactionRequest::new()
            .gas_price(U256::from(100u64))
            .into();
        let err = bumper.bump_fees(&mut tx).unwrap_err();
        assert!(matches!(err, SleuthError::BumpCeiling { .. }));
        // the original price must be left untouched
        assert_eq!(tx.gas_price(), Some(U256::from(100u64)));
    }

    #[test]
    fn test_ceiling_disabled_when_zero() {
        let bumper = test_bumper(0, Priority::Degen);
        let mut tx: TypedTransaction = TransactionRequest::new()
            .gas_price(U256::from(u64::MAX))
            .into();
        assert!(bumper.bump_fees(&mut tx).is_ok());
    }

    #[test]
    fn test_tip_never_exceeds_fee_cap() {
        let bumper = test_bumper(0, Priority::Degen);
        let mut tx: TypedTransaction = Eip1559TransactionRequest::new()
            .max_fee_per_gas(U256::from(100u64))
            .max_priority_fee_per_gas(U256::from(90u64))
            .into();
        bumper.bump_fees(&mut tx).unwrap();
        let TypedTransaction::Eip1559(inner) = tx else {
            panic!("expected an EIP-1559 transaction");
        };
        assert!(inner.max_priority_fee_per_gas.unwrap() <= inner.max_fee_per_gas.unwrap());
    }
}
