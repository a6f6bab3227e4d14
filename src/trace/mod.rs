//! Transaction tracing and call-tree decoding
//!
//! Traces are fetched with the node's built-in call and 4-byte tracers,
//! decoded against the loaded ABIs, and retained in memory for the lifetime
//! of the client so failed tests can inspect or dump them afterwards.

mod decode;

pub use decode::{
    canonical_signature, decode_function_input, parse_selector, token_to_value, CallDecoder,
    DecodedCall, DecodedEvent, FAILED_TO_DECODE,
};

use crate::abi::AbiFinder;
use crate::chain::NodeProvider;
use crate::config::Config;
use crate::error::{SleuthError, SleuthResult};

use ethers::types::{CallFrame, GethTrace, H256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Raw tracer outputs for one transaction
#[derive(Debug, Clone)]
pub struct TraceBundle {
    pub tx_hash: H256,
    /// 4-byte tracer histogram, keyed `"0x<selector>-<argSize>"`
    pub four_byte: BTreeMap<String, u64>,
    pub call_frame: CallFrame,
    /// Per-opcode trace, heavy enough that it is only fetched on demand
    pub opcodes: Option<GethTrace>,
}

/// Fetches, decodes and retains transaction traces
pub struct Tracer {
    provider: Arc<NodeProvider>,
    decoder: CallDecoder,
    cfg: Arc<Config>,
    traces: RwLock<HashMap<H256, TraceBundle>>,
    decoded: RwLock<HashMap<H256, Vec<DecodedCall>>>,
}

impl Tracer {
    pub fn new(
        provider: Arc<NodeProvider>,
        finder: Arc<AbiFinder>,
        own_addresses: HashSet<String>,
        cfg: Arc<Config>,
    ) -> Self {
        Self {
            provider,
            decoder: CallDecoder::new(finder, own_addresses),
            cfg,
            traces: RwLock::new(HashMap::new()),
            decoded: RwLock::new(HashMap::new()),
        }
    }

    pub fn decoder(&self) -> &CallDecoder {
        &self.decoder
    }

    /// Trace a mined transaction and decode its full call tree.
    ///
    /// Both tracer outputs and the decoded calls are retained; repeat calls
    /// for the same hash return the retained result without hitting the node.
    pub async fn trace_and_decode(&self, tx_hash: H256) -> SleuthResult<Vec<DecodedCall>> {
        if let Some(existing) = self.decoded_calls(tx_hash) {
            return Ok(existing);
        }

        let bundle = self.fetch_trace(tx_hash).await?;
        let calls = self
            .decoder
            .decode_call_tree(&bundle.call_frame, &bundle.four_byte)?;

        self.traces.write().unwrap().insert(tx_hash, bundle);
        self.decoded
            .write()
            .unwrap()
            .insert(tx_hash, calls.clone());

        if self.cfg.trace_output_dir.is_some() {
            self.save_decoded_calls_as_json(tx_hash)?;
        }
        Ok(calls)
    }

    async fn fetch_trace(&self, tx_hash: H256) -> SleuthResult<TraceBundle> {
        debug!(hash = ?tx_hash, "Fetching transaction traces");
        let four_byte = self.provider.trace_four_byte(tx_hash).await?;
        let call_frame = self.provider.trace_call_frame(tx_hash).await?;
        Ok(TraceBundle {
            tx_hash,
            four_byte,
            call_frame,
            opcodes: None,
        })
    }

    /// Raw per-opcode trace, retained in the bundle once fetched
    pub async fn opcode_trace(&self, tx_hash: H256) -> SleuthResult<GethTrace> {
        if let Some(bundle) = self.traces.read().unwrap().get(&tx_hash) {
            if let Some(opcodes) = &bundle.opcodes {
                return Ok(opcodes.clone());
            }
        }
        let opcodes = self.provider.trace_opcodes(tx_hash).await?;
        if let Some(bundle) = self.traces.write().unwrap().get_mut(&tx_hash) {
            bundle.opcodes = Some(opcodes.clone());
        }
        Ok(opcodes)
    }

    /// Previously decoded calls for a transaction, if any
    pub fn decoded_calls(&self, tx_hash: H256) -> Option<Vec<DecodedCall>> {
        self.decoded.read().unwrap().get(&tx_hash).cloned()
    }

    /// Raw trace bundle for a transaction, if retained
    pub fn trace_bundle(&self, tx_hash: H256) -> Option<TraceBundle> {
        self.traces.read().unwrap().get(&tx_hash).cloned()
    }

    /// Write the decoded calls for a transaction as pretty-printed JSON into
    /// the configured trace output directory
    pub fn save_decoded_calls_as_json(&self, tx_hash: H256) -> SleuthResult<PathBuf> {
        let dir = self.cfg.trace_output_dir.as_deref().ok_or_else(|| {
            SleuthError::Config("trace_output_dir is not configured".to_string())
        })?;
        let calls = self.decoded_calls(tx_hash).ok_or_else(|| {
            SleuthError::NoTrace(format!("{tx_hash:?} has not been decoded"))
        })?;

        std::fs::create_dir_all(dir)
            .map_err(|e| SleuthError::Internal(format!("failed to create {dir}: {e}")))?;
        let path = PathBuf::from(dir).join(format!("{tx_hash:?}.json"));
        let json = serde_json::to_string_pretty(&calls)
            .map_err(|e| SleuthError::Internal(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| SleuthError::Internal(format!("failed to write trace json: {e}")))?;
        info!(path = %path.display(), "Saved decoded calls");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ContractMap, ContractStore};
    use ethers::abi::{Abi, Token};
    use ethers::types::U256;

    fn tracer_with_output_dir(dir: &str) -> Tracer {
        let raw = format!(
            r#"
            trace_output_dir = "{dir}"

            [network]
            name = "anvil"
            rpc_urls = ["http://localhost:1"]

            [network.gas_estimation]
            "#
        );
        let cfg = Arc::new(Config::from_toml(&raw).unwrap());
        let provider = Arc::new(NodeProvider::new(&cfg.network).unwrap());
        let store = Arc::new(ContractStore::new());
        let abi: Abi = serde_json::from_str(
            r#"[{"type":"function","name":"transfer","inputs":[
                {"name":"to","type":"address"},{"name":"amount","type":"uint256"}
            ],"outputs":[]}]"#,
        )
        .unwrap();
        store.add_abi("Token", abi);
        let finder = Arc::new(AbiFinder::new(store, ContractMap::new()));
        Tracer::new(provider, finder, HashSet::new(), cfg)
    }

    fn decoded_transfer(hash: H256, tracer: &Tracer) -> Vec<DecodedCall> {
        let abi_fn = |input: &[Token]| {
            let abi: Abi = serde_json::from_str(
                r#"[{"type":"function","name":"transfer","inputs":[
                    {"name":"to","type":"address"},{"name":"amount","type":"uint256"}
                ],"outputs":[]}]"#,
            )
            .unwrap();
            abi.function("transfer").unwrap().encode_input(input).unwrap()
        };
        let input = abi_fn(&[
            Token::Address("0x2222222222222222222222222222222222222222".parse().unwrap()),
            Token::Uint(U256::from(7u64)),
        ]);
        let frame: CallFrame = serde_json::from_value(serde_json::json!({
            "from": "0x1111111111111111111111111111111111111111",
            "gas": "0x186a0",
            "gasUsed": "0x7530",
            "to": "0x3333333333333333333333333333333333333333",
            "input": format!("0x{}", hex::encode(input)),
            "value": "0x0",
            "type": "CALL"
        }))
        .unwrap();
        let calls = tracer
            .decoder()
            .decode_call_tree(&frame, &BTreeMap::new())
            .unwrap();
        tracer.decoded.write().unwrap().insert(hash, calls.clone());
        calls
    }

    #[test]
    fn test_save_decoded_calls_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = tracer_with_output_dir(dir.path().to_str().unwrap());
        let hash = H256::repeat_byte(0xab);
        decoded_transfer(hash, &tracer);

        let path = tracer.save_decoded_calls_as_json(hash).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed[0]["method"], "transfer(address,uint256)");
    }

    #[test]
    fn test_save_without_decoded_trace_fails() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = tracer_with_output_dir(dir.path().to_str().unwrap());
        let err = tracer.save_decoded_calls_as_json(H256::zero());
        assert!(matches!(err, Err(SleuthError::NoTrace(_))));
    }

    #[test]
    fn test_decoded_calls_retained_per_hash() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = tracer_with_output_dir(dir.path().to_str().unwrap());
        let hash = H256::repeat_byte(0x01);
        assert!(tracer.decoded_calls(hash).is_none());
        decoded_transfer(hash, &tracer);
        assert_eq!(tracer.decoded_calls(hash).unwrap().len(), 1);
        assert!(tracer.decoded_calls(H256::repeat_byte(0x02)).is_none());
    }
}
