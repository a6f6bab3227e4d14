//! RPC provider with multi-URL support and automatic failover

use crate::config::NetworkConfig;
use crate::error::{SleuthError, SleuthResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::{
    CallConfig, FeeHistory, GethDebugBuiltInTracerConfig, GethDebugBuiltInTracerType,
    GethDebugTracerConfig, GethDebugTracerType, GethDebugTracingOptions, GethTrace,
    GethTraceFrame, transaction::eip2718::TypedTransaction,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider wrapper over the node's JSON-RPC surface
pub struct NodeProvider {
    network_name: String,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl NodeProvider {
    pub fn new(config: &NetworkConfig) -> SleuthResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SleuthError::RpcConnection(format!(
                "no valid RPC providers for network '{}'",
                config.name
            )));
        }

        Ok(Self {
            network_name: config.name.clone(),
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to the next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Network {} failover to provider {}", self.network_name, next);
    }

    fn rpc_err(&self, e: impl std::fmt::Display) -> SleuthError {
        SleuthError::RpcConnection(format!("{}: {}", self.network_name, e))
    }

    pub async fn chain_id(&self) -> SleuthResult<u64> {
        self.http()
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| self.rpc_err(e))
    }

    pub async fn block_number(&self) -> SleuthResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from {}: {}", self.network_name, e);
                    self.failover();
                }
            }
        }
        Err(SleuthError::RpcConnection(format!(
            "{}: all providers failed",
            self.network_name
        )))
    }

    /// Confirmed (latest) nonce for an address
    pub async fn confirmed_nonce(&self, address: Address) -> SleuthResult<u64> {
        self.http()
            .get_transaction_count(address, None)
            .await
            .map(|n| n.as_u64())
            .map_err(|e| SleuthError::Nonce {
                address: format!("{address:?}"),
                message: e.to_string(),
            })
    }

    /// Pending nonce for an address (includes mempool transactions)
    pub async fn pending_nonce(&self, address: Address) -> SleuthResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| SleuthError::Nonce {
                address: format!("{address:?}"),
                message: e.to_string(),
            })
    }

    pub async fn gas_price(&self) -> SleuthResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| SleuthError::GasEstimation(e.to_string()))
    }

    /// Node's suggested priority tip (`eth_maxPriorityFeePerGas`)
    pub async fn max_priority_fee(&self) -> SleuthResult<U256> {
        self.http()
            .request("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e: ProviderError| SleuthError::GasEstimation(e.to_string()))
    }

    pub async fn fee_history(
        &self,
        block_count: u64,
        last_block: BlockNumber,
        reward_percentiles: &[f64],
    ) -> SleuthResult<FeeHistory> {
        self.http()
            .fee_history(U256::from(block_count), last_block, reward_percentiles)
            .await
            .map_err(|e| SleuthError::GasEstimation(e.to_string()))
    }

    pub async fn get_block(&self, block_number: u64) -> SleuthResult<Option<Block<H256>>> {
        self.http()
            .get_block(block_number)
            .await
            .map_err(|e| self.rpc_err(e))
    }

    pub async fn get_latest_block(&self) -> SleuthResult<Option<Block<H256>>> {
        self.http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.rpc_err(e))
    }

    pub async fn get_transaction(&self, hash: H256) -> SleuthResult<Option<Transaction>> {
        self.http()
            .get_transaction(hash)
            .await
            .map_err(|e| self.rpc_err(e))
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> SleuthResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.rpc_err(e))
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> SleuthResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| SleuthError::Transaction(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> SleuthResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| SleuthError::GasEstimation(e.to_string()))
    }

    /// Execute a call locally. The raw provider error is returned so callers
    /// can extract ABI-encoded revert data from it.
    pub async fn call_raw(
        &self,
        tx: &TypedTransaction,
        block: Option<BlockId>,
    ) -> Result<Bytes, ProviderError> {
        self.http().call(tx, block).await
    }

    pub async fn get_code(&self, address: Address, block: Option<BlockId>) -> SleuthResult<Bytes> {
        self.http()
            .get_code(address, block)
            .await
            .map_err(|e| self.rpc_err(e))
    }

    /// Full nested call tree from the node's call tracer, with logs
    pub async fn trace_call_frame(&self, hash: H256) -> SleuthResult<CallFrame> {
        let options = GethDebugTracingOptions {
            tracer: Some(GethDebugTracerType::BuiltInTracer(
                GethDebugBuiltInTracerType::CallTracer,
            )),
            tracer_config: Some(GethDebugTracerConfig::BuiltInTracer(
                GethDebugBuiltInTracerConfig::CallTracer(CallConfig {
                    only_top_call: Some(false),
                    with_log: Some(true),
                }),
            )),
            ..Default::default()
        };
        let trace = self
            .http()
            .debug_trace_transaction(hash, options)
            .await
            .map_err(|e| self.rpc_err(e))?;
        match trace {
            GethTrace::Known(GethTraceFrame::CallTracer(frame)) => Ok(frame),
            other => Err(SleuthError::NoTrace(format!(
                "unexpected call tracer response for {hash:?}: {other:?}"
            ))),
        }
    }

    /// Histogram of observed 4-byte selectors, keyed `"0x<selector>-<argSize>"`
    pub async fn trace_four_byte(&self, hash: H256) -> SleuthResult<BTreeMap<String, u64>> {
        let options = GethDebugTracingOptions {
            tracer: Some(GethDebugTracerType::BuiltInTracer(
                GethDebugBuiltInTracerType::FourByteTracer,
            )),
            ..Default::default()
        };
        let trace = self
            .http()
            .debug_trace_transaction(hash, options)
            .await
            .map_err(|e| self.rpc_err(e))?;
        match trace {
            GethTrace::Known(GethTraceFrame::FourByteTracer(frame)) => Ok(frame.0),
            other => Err(SleuthError::NoTrace(format!(
                "unexpected 4byte tracer response for {hash:?}: {other:?}"
            ))),
        }
    }

    /// Raw per-opcode execution trace (the default struct logger)
    pub async fn trace_opcodes(&self, hash: H256) -> SleuthResult<GethTrace> {
        self.http()
            .debug_trace_transaction(hash, GethDebugTracingOptions::default())
            .await
            .map_err(|e| self.rpc_err(e))
    }
}
