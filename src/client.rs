//! The sleuth client: wiring of provider, keys, nonces, gas and tracing
//!
//! `Client` drives the full lifecycle of a transaction: fill (nonce, fees,
//! gas limit), sign, broadcast, wait with gas bumps, then decode the receipt
//! and the call trace into a human-readable form.

use crate::abi::{AbiFinder, ContractMap, ContractStore};
use crate::cache::LfuHeaderCache;
use crate::chain::NodeProvider;
use crate::config::Config;
use crate::error::{SleuthError, SleuthResult};
use crate::trace::{DecodedCall, Tracer};
use crate::tx::bump::{priority_based_bump_strategy, TxBumper};
use crate::tx::gas::GasAdjuster;
use crate::tx::nonce::NonceManager;
use crate::units::wei_to_gwei;

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default headroom for the LFU header cache: enough for one congestion
/// window per estimation plus reuse across calls
const HEADER_CACHE_CAPACITY: u64 = 1_000;

/// A signed transaction that has been handed to the node
#[derive(Debug, Clone)]
pub struct SentTransaction {
    pub tx: TypedTransaction,
    pub signature: Signature,
    pub hash: H256,
}

/// A mined transaction with its receipt, decoded revert reason (when it
/// failed) and decoded call tree
#[derive(Debug, Clone)]
pub struct DecodedTransaction {
    pub receipt: TransactionReceipt,
    pub revert_reason: Option<String>,
    pub calls: Vec<DecodedCall>,
}

impl DecodedTransaction {
    pub fn reverted(&self) -> bool {
        self.receipt.status == Some(U64::zero())
    }
}

/// Programmable Ethereum client for automated testing
pub struct Client {
    cfg: Arc<Config>,
    chain_id: u64,
    provider: Arc<NodeProvider>,
    wallets: Vec<LocalWallet>,
    addresses: Vec<Address>,
    pub nonce_manager: Arc<NonceManager>,
    pub gas_adjuster: GasAdjuster,
    bumper: TxBumper,
    pub contract_store: Arc<ContractStore>,
    pub tracer: Tracer,
    errors: tokio::sync::Mutex<Vec<SleuthError>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("chain_id", &self.chain_id)
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the configured network with a fresh contract store
    pub async fn connect(cfg: Config) -> SleuthResult<Self> {
        Self::connect_with_store(cfg, Arc::new(ContractStore::new()), ContractMap::new()).await
    }

    /// Connect with a prebuilt contract store and address map, so several
    /// clients can share ABI knowledge
    pub async fn connect_with_store(
        cfg: Config,
        contract_store: Arc<ContractStore>,
        contract_map: ContractMap,
    ) -> SleuthResult<Self> {
        let cfg = Arc::new(cfg);
        let provider = Arc::new(NodeProvider::new(&cfg.network)?);

        let chain_id = match cfg.network.chain_id {
            Some(id) => id,
            None => tokio::time::timeout(cfg.network.dial_timeout(), provider.chain_id())
                .await
                .map_err(|_| SleuthError::Timeout {
                    operation: format!("dialing network '{}'", cfg.network.name),
                })??,
        };
        info!(network = %cfg.network.name, chain_id, "Connecting sleuth client");

        let mut wallets = Vec::with_capacity(cfg.network.private_keys.len());
        let mut addresses = Vec::with_capacity(cfg.network.private_keys.len());
        for key in &cfg.network.private_keys {
            let wallet: LocalWallet = key
                .trim_start_matches("0x")
                .parse::<LocalWallet>()
                .map_err(|e| SleuthError::Wallet(e.to_string()))?
                .with_chain_id(chain_id);
            addresses.push(wallet.address());
            wallets.push(wallet);
        }

        let nonce_manager = Arc::new(NonceManager::new(
            cfg.nonce_manager.clone(),
            provider.clone(),
            addresses.clone(),
        ));
        if !addresses.is_empty() {
            nonce_manager.resync_all().await?;
        }

        let header_cache = Arc::new(LfuHeaderCache::new(HEADER_CACHE_CAPACITY));
        let gas_adjuster = GasAdjuster::new(provider.clone(), header_cache, cfg.clone());

        let wallet_map: HashMap<Address, LocalWallet> = addresses
            .iter()
            .copied()
            .zip(wallets.iter().cloned())
            .collect();
        let bumper = TxBumper::new(
            provider.clone(),
            cfg.clone(),
            wallet_map,
            priority_based_bump_strategy(cfg.network.gas_estimation.priority),
        );

        let finder = Arc::new(AbiFinder::new(contract_store.clone(), contract_map));
        let own_addresses: HashSet<String> = addresses
            .iter()
            .map(|a| format!("{a:?}").to_lowercase())
            .collect();
        let tracer = Tracer::new(provider.clone(), finder, own_addresses, cfg.clone());

        Ok(Self {
            cfg,
            chain_id,
            provider,
            wallets,
            addresses,
            nonce_manager,
            gas_adjuster,
            bumper,
            contract_store,
            tracer,
            errors: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn provider(&self) -> &Arc<NodeProvider> {
        &self.provider
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Address of a managed key. Key 0 is the root key.
    pub fn address_of(&self, key_num: usize) -> SleuthResult<Address> {
        self.addresses.get(key_num).copied().ok_or_else(|| {
            SleuthError::UnknownSender(format!(
                "key #{key_num} out of range, {} keys configured",
                self.addresses.len()
            ))
        })
    }

    pub fn root_address(&self) -> SleuthResult<Address> {
        self.address_of(0)
    }

    /// Empty transaction of the network's default type: EIP-1559 when the
    /// network supports dynamic fees, legacy otherwise
    pub fn transaction_template(&self) -> TypedTransaction {
        if self.cfg.network.eip1559_dynamic_fees {
            Eip1559TransactionRequest::new().into()
        } else {
            TransactionRequest::new().into()
        }
    }

    /// Fill, sign and broadcast a transaction from the given key.
    ///
    /// Fields the caller already set are left alone; nonce, chain id, fees
    /// and gas limit are filled in where missing.
    pub async fn send_transaction(
        &self,
        key_num: usize,
        mut tx: TypedTransaction,
    ) -> SleuthResult<SentTransaction> {
        let from = self.address_of(key_num)?;
        let wallet = &self.wallets[key_num];

        tx.set_from(from);
        tx.set_chain_id(self.chain_id);
        if tx.nonce().is_none() {
            let nonce = self.nonce_manager.next_nonce(from).await;
            tx.set_nonce(nonce);
        }
        self.fill_fees(&mut tx).await?;
        if tx.gas().is_none() {
            let estimated = self.provider.estimate_gas(&tx).await?;
            tx.set_gas(estimated);
        }

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SleuthError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = self.provider.send_raw_transaction(raw).await?;
        debug!(hash = ?hash, key = key_num, nonce = ?tx.nonce(), "Broadcast transaction");
        Ok(SentTransaction {
            tx,
            signature,
            hash,
        })
    }

    /// Fill fee fields that the caller left unset, using either the gas
    /// estimator or the static fallbacks from configuration
    async fn fill_fees(&self, tx: &mut TypedTransaction) -> SleuthResult<()> {
        let estimation = &self.cfg.network.gas_estimation;
        match tx {
            TypedTransaction::Eip1559(inner) => {
                if inner.max_fee_per_gas.is_some() {
                    return Ok(());
                }
                let (fee_cap, tip_cap) = if estimation.enabled {
                    self.gas_adjuster
                        .suggest_eip1559_fees(estimation.priority)
                        .await?
                } else {
                    (
                        U256::from(self.cfg.network.gas_fee_cap),
                        U256::from(self.cfg.network.gas_tip_cap),
                    )
                };
                debug!(
                    fee_cap_gwei = wei_to_gwei(fee_cap),
                    tip_cap_gwei = wei_to_gwei(tip_cap),
                    "Filled EIP-1559 fees"
                );
                inner.max_fee_per_gas = Some(fee_cap);
                inner.max_priority_fee_per_gas = Some(tip_cap.min(fee_cap));
            }
            TypedTransaction::Legacy(_) | TypedTransaction::Eip2930(_) => {
                if tx.gas_price().is_some() {
                    return Ok(());
                }
                let price = if estimation.enabled {
                    self.gas_adjuster
                        .suggest_legacy_fee(estimation.priority)
                        .await?
                } else {
                    U256::from(self.cfg.network.gas_price)
                };
                debug!(gas_price_gwei = wei_to_gwei(price), "Filled legacy gas price");
                tx.set_gas_price(price);
            }
        }
        Ok(())
    }

    /// Wait for a sent transaction to be mined, bumping its gas if it gets
    /// stuck, then decode the receipt and call trace
    pub async fn execute_transaction(
        &self,
        key_num: usize,
        tx: TypedTransaction,
    ) -> SleuthResult<DecodedTransaction> {
        let sent = self.send_transaction(key_num, tx).await?;
        let receipt = self.bumper.wait_mined(sent.tx, sent.signature).await?;
        self.decode_transaction(receipt).await
    }

    /// Decode a mined transaction: revert reason for failures, then the
    /// full call trace. Failure to resolve the root call is fatal; deeper
    /// decode failures degrade to placeholders inside the call list.
    pub async fn decode_transaction(
        &self,
        receipt: TransactionReceipt,
    ) -> SleuthResult<DecodedTransaction> {
        let hash = receipt.transaction_hash;
        let reverted = receipt.status == Some(U64::zero());
        let revert_reason = if reverted {
            let reason = self.revert_reason(&receipt).await;
            warn!(hash = ?hash, reason = ?reason, "Transaction reverted");
            if reason.is_none() {
                self.record_error(SleuthError::Transaction(format!(
                    "transaction {hash:?} reverted but no revert reason could be decoded"
                )))
                .await;
            }
            reason
        } else {
            None
        };

        let calls = self.tracer.trace_and_decode(hash).await?;
        Ok(DecodedTransaction {
            receipt,
            revert_reason,
            calls,
        })
    }

    /// Replay a failed transaction as a call at its mined block and decode
    /// the revert payload the node returns
    async fn revert_reason(&self, receipt: &TransactionReceipt) -> Option<String> {
        let tx = match self.provider.get_transaction(receipt.transaction_hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return None,
            Err(e) => {
                debug!("Could not fetch transaction for revert replay due to: {e}");
                return None;
            }
        };

        let mut replay = TransactionRequest::new()
            .from(tx.from)
            .value(tx.value)
            .data(tx.input.clone())
            .gas(tx.gas);
        if let Some(to) = tx.to {
            replay = replay.to(to);
        }
        let block = receipt.block_number.map(Into::into);

        match self.provider.call_raw(&replay.into(), block).await {
            Ok(_) => None,
            Err(e) => self.revert_data_from_error(&e).and_then(|data| {
                self.tracer.decoder().decode_revert(&data)
            }),
        }
    }

    fn revert_data_from_error(&self, error: &ProviderError) -> Option<Vec<u8>> {
        let rpc_error = ethers::providers::RpcError::as_error_response(error)?;
        let data = rpc_error.data.as_ref()?;
        let encoded = data.as_str()?.strip_prefix("0x")?;
        hex::decode(encoded).ok()
    }

    /// Decode an ABI-encoded revert payload against the loaded ABIs
    pub fn decode_revert_data(&self, data: &[u8]) -> Option<String> {
        self.tracer.decoder().decode_revert(data)
    }

    /// Deploy a contract whose ABI and bytecode are registered in the store.
    /// The deployed address is recorded in the contract map so later traces
    /// resolve it by name.
    pub async fn deploy_contract(
        &self,
        key_num: usize,
        name: &str,
        constructor_args: &[ethers::abi::Token],
    ) -> SleuthResult<(Address, DecodedTransaction)> {
        let abi = self
            .contract_store
            .get_abi(name)
            .ok_or_else(|| SleuthError::NoAbiFound(name.to_string()))?;
        let bin = self.contract_store.get_bin(name).ok_or_else(|| {
            SleuthError::Config(format!("no bytecode registered for contract '{name}'"))
        })?;

        let data = match abi.constructor() {
            Some(constructor) => constructor
                .encode_input(bin, constructor_args)
                .map_err(|e| SleuthError::Transaction(e.to_string()))?,
            None if constructor_args.is_empty() => bin,
            None => {
                return Err(SleuthError::Transaction(format!(
                    "contract '{name}' has no constructor but arguments were given"
                )))
            }
        };

        let mut tx = self.transaction_template();
        tx.set_data(data.into());
        let sent = self.send_transaction(key_num, tx).await?;
        let receipt = self.bumper.wait_mined(sent.tx, sent.signature).await?;
        let address = receipt.contract_address.ok_or_else(|| {
            SleuthError::Transaction(format!(
                "deployment of '{name}' mined without a contract address"
            ))
        })?;

        self.tracer
            .decoder()
            .contract_map()
            .add_contract(format!("{address:?}"), name);
        info!(contract = name, address = ?address, "Contract deployed");

        let decoded = DecodedTransaction {
            revert_reason: None,
            calls: Vec::new(),
            receipt,
        };
        Ok((address, decoded))
    }

    pub(crate) async fn record_error(&self, error: SleuthError) {
        self.errors.lock().await.push(error);
    }

    /// Drain every error recorded by the client and its nonce manager since
    /// the last call
    pub async fn take_errors(&self) -> Vec<SleuthError> {
        let mut all = self.nonce_manager.take_errors().await;
        all.append(&mut *self.errors.lock().await);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config(network_extra: &str) -> Config {
        // a fixed chain id and no keys keep connect() off the network
        let raw = format!(
            r#"
            [network]
            name = "anvil"
            rpc_urls = ["http://localhost:1"]
            chain_id = 31337
            {network_extra}

            [network.gas_estimation]
            "#
        );
        Config::from_toml(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_transaction_template_follows_fee_configuration() {
        let client = Client::connect(offline_config("eip1559_dynamic_fees = true"))
            .await
            .unwrap();
        assert!(matches!(
            client.transaction_template(),
            TypedTransaction::Eip1559(_)
        ));

        let client = Client::connect(offline_config("eip1559_dynamic_fees = false"))
            .await
            .unwrap();
        assert!(matches!(
            client.transaction_template(),
            TypedTransaction::Legacy(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_gives_up_dialing_after_the_configured_timeout() {
        let raw = r#"
            [network]
            name = "unreachable"
            rpc_urls = ["http://localhost:1"]
            dial_timeout_secs = 0

            [network.gas_estimation]
        "#;
        let cfg = Config::from_toml(raw).unwrap();
        // no chain id configured, so connect must ask the (dead) node
        let err = Client::connect(cfg).await.unwrap_err();
        assert!(matches!(err, SleuthError::Timeout { .. }));
    }

    #[test]
    fn test_decoded_transaction_reverted_flag() {
        let mut receipt = TransactionReceipt::default();
        receipt.status = Some(U64::zero());
        let decoded = DecodedTransaction {
            receipt,
            revert_reason: Some("balance too low".to_string()),
            calls: Vec::new(),
        };
        assert!(decoded.reverted());

        let mut receipt = TransactionReceipt::default();
        receipt.status = Some(U64::one());
        let decoded = DecodedTransaction {
            receipt,
            revert_reason: None,
            calls: Vec::new(),
        };
        assert!(!decoded.reverted());
    }
}
