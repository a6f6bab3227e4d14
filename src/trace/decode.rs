//! Decoding of call-tracer frames into human-readable call descriptions

use crate::abi::{AbiFinder, UNKNOWN};
use crate::error::{SleuthError, SleuthResult};

use ethers::abi::{Abi, Event, Function, RawLog, Token};
use ethers::types::{Address, Bytes, CallFrame, CallLogFrame, NameOrAddress, U256};
use ethers::utils::keccak256;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Placeholder method name for frames whose decoding failed
pub const FAILED_TO_DECODE: &str = "failed to decode";

/// One event emitted during a call, decoded against the resolved ABI
#[derive(Debug, Clone, Serialize)]
pub struct DecodedEvent {
    pub signature: String,
    pub log_data: HashMap<String, serde_json::Value>,
    pub address: String,
}

/// One call in the decoded transaction tree. Produced in the same pre-order
/// as the node's call tracer emits frames.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedCall {
    /// CALL, DELEGATECALL, STATICCALL or CREATE
    pub call_type: String,
    /// Hex-encoded 4-byte selector, `0x`-prefixed
    pub signature: String,
    /// Canonical method signature, e.g. `transfer(address,uint256)`
    pub method: String,
    pub from_address: String,
    pub to_address: String,
    /// Human-readable names: `you` for a managed key, the contract name
    /// where known, `unknown` otherwise
    pub from_name: String,
    pub to_name: String,
    /// Decoded inputs keyed by parameter name, or by index where unnamed
    pub input: HashMap<String, serde_json::Value>,
    pub output: HashMap<String, serde_json::Value>,
    pub events: Vec<DecodedEvent>,
    /// Advisory text: ambiguous selector matches, decode failures, calls
    /// reconstructed from the 4-byte histogram
    pub comment: String,
    /// Revert reason, when the call failed
    pub error: Option<String>,
    pub nesting_level: usize,
    /// Selector of the calling frame, empty at the root
    pub parent_signature: String,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_used: u64,
}

/// Decodes call-tracer frames against the loaded ABIs
pub struct CallDecoder {
    finder: Arc<AbiFinder>,
    /// Lower-cased addresses of the keys this client signs with
    own_addresses: HashSet<String>,
}

impl CallDecoder {
    pub fn new(finder: Arc<AbiFinder>, own_addresses: HashSet<String>) -> Self {
        Self {
            finder,
            own_addresses,
        }
    }

    pub fn contract_map(&self) -> &crate::abi::ContractMap {
        self.finder.contract_map()
    }

    /// Decode a full call tree into a flat pre-order list.
    ///
    /// Failure to decode the root frame is fatal; a failing child frame
    /// produces a placeholder entry and decoding continues. Afterwards the
    /// 4-byte histogram is reconciled against the decoded tree and any
    /// selectors the call tracer missed are appended as synthetic entries.
    pub fn decode_call_tree(
        &self,
        root: &CallFrame,
        four_byte: &BTreeMap<String, u64>,
    ) -> SleuthResult<Vec<DecodedCall>> {
        // arena of (frame, parent index) in pre-order
        let mut arena: Vec<(&CallFrame, Option<usize>, usize)> = Vec::new();
        flatten(root, None, 0, &mut arena);

        let mut decoded: Vec<DecodedCall> = Vec::with_capacity(arena.len());
        for (idx, (frame, parent, level)) in arena.iter().enumerate() {
            let parent_signature = parent
                .map(|p| decoded[p].signature.clone())
                .unwrap_or_default();
            match self.decode_frame(frame, *level, parent_signature.clone()) {
                Ok(call) => decoded.push(call),
                Err(e) if idx == 0 => return Err(e),
                Err(e) => {
                    debug!(nesting = level, "Failed to decode call frame due to: {e}");
                    decoded.push(placeholder_call(frame, *level, parent_signature, &e));
                }
            }
        }

        self.reconcile_four_byte(four_byte, &mut decoded);
        Ok(decoded)
    }

    /// Decode a single frame
    fn decode_frame(
        &self,
        frame: &CallFrame,
        nesting_level: usize,
        parent_signature: String,
    ) -> SleuthResult<DecodedCall> {
        let from_address = format_address(&frame.from);
        let to_address = frame
            .to
            .as_ref()
            .map(format_name_or_address)
            .unwrap_or_else(|| UNKNOWN.to_string());

        let mut call = DecodedCall {
            call_type: frame.typ.clone(),
            signature: String::new(),
            method: String::new(),
            from_name: self.name_for(&from_address),
            to_name: self.name_for(&to_address),
            from_address,
            to_address,
            input: HashMap::new(),
            output: HashMap::new(),
            events: Vec::new(),
            comment: String::new(),
            error: frame.error.clone(),
            nesting_level,
            parent_signature,
            value: frame.value.unwrap_or_default(),
            gas_limit: frame.gas.as_u64(),
            gas_used: frame.gas_used.as_u64(),
        };

        // plain value transfers carry no calldata to decode
        if frame.input.len() < 4 {
            return Ok(call);
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&frame.input[..4]);
        call.signature = format!("0x{}", hex::encode(selector));

        let result = self.finder.find_by_selector(&call.to_address, selector)?;
        call.method = canonical_signature(&result.function);
        if call.to_name == UNKNOWN {
            call.to_name = result.contract_name.clone();
        }
        if let Some(comment) = result.duplicates_comment() {
            call.comment = comment;
        }

        call.input = decode_function_input(&result.function, &frame.input)?;
        if let Some(output) = &frame.output {
            match self.decode_output_or_revert(&result.function, frame, output) {
                DecodedOutput::Values(values) => call.output = values,
                DecodedOutput::Revert(reason) => call.error = Some(reason),
                DecodedOutput::None => {}
            }
        }

        if let Some(logs) = &frame.logs {
            call.events = self.decode_logs(&result.abi, logs);
        }
        Ok(call)
    }

    /// Interpret a frame's output bytes as return values on success or as a
    /// revert payload on failure
    fn decode_output_or_revert(
        &self,
        function: &Function,
        frame: &CallFrame,
        output: &Bytes,
    ) -> DecodedOutput {
        if frame.error.is_some() {
            if let Some(reason) = self.decode_revert(output) {
                return DecodedOutput::Revert(reason);
            }
            return DecodedOutput::None;
        }
        if output.is_empty() {
            return DecodedOutput::None;
        }
        match function.decode_output(output) {
            Ok(tokens) => DecodedOutput::Values(tokens_to_map(&function.outputs, &tokens)),
            Err(e) => {
                debug!(method = %function.name, "Failed to decode output due to: {e}");
                DecodedOutput::None
            }
        }
    }

    /// Decode an ABI-encoded revert payload: the standard `Error(string)` and
    /// `Panic(uint256)` shapes, then custom errors from the loaded ABIs
    pub fn decode_revert(&self, data: &[u8]) -> Option<String> {
        if data.len() < 4 {
            return None;
        }
        let selector = &data[..4];
        let payload = &data[4..];

        // Error(string)
        if selector == [0x08, 0xc3, 0x79, 0xa0] {
            let tokens =
                ethers::abi::decode(&[ethers::abi::ParamType::String], payload).ok()?;
            if let Some(Token::String(reason)) = tokens.into_iter().next() {
                return Some(reason);
            }
            return None;
        }
        // Panic(uint256)
        if selector == [0x4e, 0x48, 0x7b, 0x71] {
            let tokens =
                ethers::abi::decode(&[ethers::abi::ParamType::Uint(256)], payload).ok()?;
            if let Some(Token::Uint(code)) = tokens.into_iter().next() {
                return Some(format!("panic, reason: {code}"));
            }
            return None;
        }
        self.decode_custom_abi_error(selector, payload)
    }

    /// Scan every loaded ABI's custom errors for one matching the selector
    fn decode_custom_abi_error(&self, selector: &[u8], payload: &[u8]) -> Option<String> {
        for (_, abi) in self.finder.store().all_abis() {
            for error in abi.errors.values().flatten() {
                let signature = format!(
                    "{}({})",
                    error.name,
                    error
                        .inputs
                        .iter()
                        .map(|p| p.kind.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                );
                if keccak256(signature.as_bytes())[..4] != *selector {
                    continue;
                }
                let kinds: Vec<ethers::abi::ParamType> =
                    error.inputs.iter().map(|p| p.kind.clone()).collect();
                let values = match ethers::abi::decode(&kinds, payload) {
                    Ok(tokens) => tokens
                        .iter()
                        .map(format_token)
                        .collect::<Vec<_>>()
                        .join(" "),
                    Err(_) => continue,
                };
                return Some(format!(
                    "error type: {}, error values: [{values}]",
                    error.name
                ));
            }
        }
        None
    }

    fn decode_logs(&self, abi: &Abi, logs: &[CallLogFrame]) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        for log in logs {
            let Some(topics) = &log.topics else { continue };
            let Some(topic0) = topics.first() else { continue };
            let Some(event) = abi.events().find(|e| e.signature() == *topic0) else {
                debug!(topic = ?topic0, "No matching event in resolved ABI");
                continue;
            };
            let raw = RawLog {
                topics: topics.clone(),
                data: log.data.clone().map(|d| d.to_vec()).unwrap_or_default(),
            };
            match event.parse_log(raw) {
                Ok(parsed) => {
                    let mut log_data = HashMap::new();
                    for param in parsed.params {
                        log_data.insert(param.name, token_to_value(&param.value));
                    }
                    events.push(DecodedEvent {
                        signature: canonical_event_signature(event),
                        log_data,
                        address: log
                            .address
                            .as_ref()
                            .map(format_address)
                            .unwrap_or_else(|| UNKNOWN.to_string()),
                    });
                }
                Err(e) => {
                    debug!(event = %event.name, "Failed to parse log due to: {e}");
                }
            }
        }
        events
    }

    /// Append synthetic entries for selectors the 4-byte tracer saw but the
    /// call tracer did not report. Keys look like `0xa9059cbb-64`.
    fn reconcile_four_byte(
        &self,
        four_byte: &BTreeMap<String, u64>,
        decoded: &mut Vec<DecodedCall>,
    ) {
        let mut seen: HashMap<String, u64> = HashMap::new();
        for call in decoded.iter() {
            if !call.signature.is_empty() {
                *seen.entry(call.signature.clone()).or_default() += 1;
            }
        }

        let mut expected: BTreeMap<String, u64> = BTreeMap::new();
        for (key, count) in four_byte {
            let Some(selector) = key.split('-').next() else { continue };
            *expected.entry(selector.to_string()).or_default() += count;
        }

        for (signature, expected_count) in expected {
            let seen_count = seen.get(&signature).copied().unwrap_or(0);
            for _ in seen_count..expected_count {
                warn!(
                    selector = %signature,
                    "Selector observed by the 4-byte tracer is missing from the call trace"
                );
                decoded.push(self.synthetic_call(&signature));
            }
        }
    }

    fn synthetic_call(&self, signature: &str) -> DecodedCall {
        let method = parse_selector(signature)
            .and_then(|selector| self.finder.find_by_selector(UNKNOWN, selector).ok())
            .map(|result| canonical_signature(&result.function))
            .unwrap_or_else(|| UNKNOWN.to_string());
        DecodedCall {
            call_type: UNKNOWN.to_uppercase(),
            signature: signature.to_string(),
            method,
            from_address: UNKNOWN.to_string(),
            to_address: UNKNOWN.to_string(),
            from_name: UNKNOWN.to_string(),
            to_name: UNKNOWN.to_string(),
            input: HashMap::new(),
            output: HashMap::new(),
            events: Vec::new(),
            comment: "call reported by the 4-byte tracer but absent from the call trace"
                .to_string(),
            error: None,
            nesting_level: 0,
            parent_signature: String::new(),
            value: U256::zero(),
            gas_limit: 0,
            gas_used: 0,
        }
    }

    fn name_for(&self, address: &str) -> String {
        let normalized = address.to_lowercase();
        if self.own_addresses.contains(&normalized) {
            return "you".to_string();
        }
        self.finder
            .contract_map()
            .get_contract_name(&normalized)
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}

enum DecodedOutput {
    Values(HashMap<String, serde_json::Value>),
    Revert(String),
    None,
}

/// Pre-order flattening with parent indices and nesting levels
fn flatten<'a>(
    frame: &'a CallFrame,
    parent: Option<usize>,
    level: usize,
    arena: &mut Vec<(&'a CallFrame, Option<usize>, usize)>,
) {
    arena.push((frame, parent, level));
    let own_index = arena.len() - 1;
    if let Some(calls) = &frame.calls {
        for child in calls {
            flatten(child, Some(own_index), level + 1, arena);
        }
    }
}

fn placeholder_call(
    frame: &CallFrame,
    nesting_level: usize,
    parent_signature: String,
    error: &SleuthError,
) -> DecodedCall {
    let signature = if frame.input.len() >= 4 {
        format!("0x{}", hex::encode(&frame.input[..4]))
    } else {
        String::new()
    };
    // a call whose ABI is simply not loaded is still worth keeping, with a
    // different marker than one that failed mid-decode
    let (method, comment) = match error {
        SleuthError::NoAbiMethod { .. } | SleuthError::NoAbiFound(_) => (
            UNKNOWN.to_string(),
            format!("missing ABI: {error}"),
        ),
        other => (FAILED_TO_DECODE.to_string(), other.to_string()),
    };
    DecodedCall {
        call_type: frame.typ.clone(),
        signature,
        method,
        from_address: format_address(&frame.from),
        to_address: frame
            .to
            .as_ref()
            .map(format_name_or_address)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        from_name: UNKNOWN.to_string(),
        to_name: UNKNOWN.to_string(),
        input: HashMap::new(),
        output: HashMap::new(),
        events: Vec::new(),
        comment,
        error: frame.error.clone(),
        nesting_level,
        parent_signature,
        value: frame.value.unwrap_or_default(),
        gas_limit: frame.gas.as_u64(),
        gas_used: frame.gas_used.as_u64(),
    }
}

/// Decode calldata (selector stripped) into a name-keyed map
pub fn decode_function_input(
    function: &Function,
    input: &Bytes,
) -> SleuthResult<HashMap<String, serde_json::Value>> {
    let tokens = function
        .decode_input(&input[4..])
        .map_err(|e| SleuthError::DecodeInput(e.to_string()))?;
    Ok(tokens_to_map(&function.inputs, &tokens))
}

fn tokens_to_map(
    params: &[ethers::abi::Param],
    tokens: &[Token],
) -> HashMap<String, serde_json::Value> {
    tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            let name = params
                .get(i)
                .map(|p| p.name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| i.to_string());
            (name, token_to_value(token))
        })
        .collect()
}

/// Convert one ABI token to a JSON value, stringifying numbers so that
/// 256-bit values survive serialization losslessly
pub fn token_to_value(token: &Token) -> serde_json::Value {
    match token {
        Token::Address(a) => serde_json::Value::String(format!("{a:?}")),
        Token::Bytes(b) | Token::FixedBytes(b) => {
            serde_json::Value::String(format!("0x{}", hex::encode(b)))
        }
        Token::Int(v) | Token::Uint(v) => serde_json::Value::String(v.to_string()),
        Token::Bool(b) => serde_json::Value::Bool(*b),
        Token::String(s) => serde_json::Value::String(s.clone()),
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            serde_json::Value::Array(items.iter().map(token_to_value).collect())
        }
    }
}

fn format_token(token: &Token) -> String {
    match token_to_value(token) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// `name(type1,type2)` without outputs
pub fn canonical_signature(function: &Function) -> String {
    format!(
        "{}({})",
        function.name,
        function
            .inputs
            .iter()
            .map(|p| p.kind.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

fn canonical_event_signature(event: &Event) -> String {
    format!(
        "{}({})",
        event.name,
        event
            .inputs
            .iter()
            .map(|p| p.kind.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

fn format_address(address: &Address) -> String {
    format!("{address:?}")
}

fn format_name_or_address(target: &NameOrAddress) -> String {
    match target {
        NameOrAddress::Address(a) => format_address(a),
        NameOrAddress::Name(n) => n.clone(),
    }
}

/// Parse a `0x`-prefixed selector string into 4 bytes
pub fn parse_selector(signature: &str) -> Option<[u8; 4]> {
    let stripped = signature.strip_prefix("0x")?;
    let bytes = hex::decode(stripped).ok()?;
    bytes.get(..4)?.try_into().ok()
}
