//! Resolves which contract and ABI method a 4-byte selector belongs to
//!
//! Several loaded contracts can expose a method with the same selector, so
//! the address→name map is sometimes a guess. Every lookup must therefore be
//! prepared to discover the map was wrong and repair it instead of
//! persistently misattributing calls.

use crate::abi::{ContractMap, ContractStore};
use crate::error::{SleuthError, SleuthResult};

use ethers::abi::{Abi, Function};
use std::sync::Arc;
use tracing::{debug, trace};

/// Placeholder used where an address is not recoverable from tracing data
pub const UNKNOWN: &str = "unknown";

/// Outcome of a selector lookup
#[derive(Debug, Clone)]
pub struct AbiFinderResult {
    pub abi: Abi,
    pub function: Function,
    pub contract_name: String,
    /// How many other loaded ABIs also expose a method with this exact
    /// selector. Zero means the match is certain; anything above means the
    /// first match was used and may be wrong.
    pub duplicate_count: usize,
}

impl AbiFinderResult {
    /// Advisory text attached to decoded calls when the match is ambiguous
    pub fn duplicates_comment(&self) -> Option<String> {
        if self.duplicate_count > 0 {
            Some(format!(
                "potentially inaccurate - method present in {} other contracts",
                self.duplicate_count
            ))
        } else {
            None
        }
    }
}

pub struct AbiFinder {
    store: Arc<ContractStore>,
    contract_map: ContractMap,
}

impl AbiFinder {
    pub fn new(store: Arc<ContractStore>, contract_map: ContractMap) -> Self {
        Self {
            store,
            contract_map,
        }
    }

    pub fn contract_map(&self) -> &ContractMap {
        &self.contract_map
    }

    pub fn store(&self) -> &Arc<ContractStore> {
        &self.store
    }

    /// Find the ABI method for `selector` called at `address`.
    ///
    /// A known address identifies the contract definitively, so ambiguity
    /// among other contracts is irrelevant and the duplicate count is forced
    /// to zero. If the mapped contract turns out not to contain the selector
    /// the map guessed wrong earlier; a full scan corrects the mapping. An
    /// unknown address triggers a scan over all loaded ABIs in deterministic
    /// order, with the duplicate count reported as an advisory.
    pub fn find_by_selector(
        &self,
        address: &str,
        selector: [u8; 4],
    ) -> SleuthResult<AbiFinderResult> {
        if let Some(mapped_name) = self.contract_map.get_contract_name(address) {
            let abi = self
                .store
                .get_abi(&mapped_name)
                .ok_or_else(|| SleuthError::NoAbiFound(mapped_name.clone()))?;

            if let Some(function) = function_by_selector(&abi, selector) {
                trace!(contract = %mapped_name, address, "Selector resolved via known address");
                return Ok(AbiFinderResult {
                    abi,
                    function,
                    contract_name: mapped_name,
                    duplicate_count: 0,
                });
            }

            // The map pointed at a contract that doesn't have this method:
            // an earlier ambiguous scan guessed wrong. Re-scan and repair.
            debug!(
                address,
                assumed = %mapped_name,
                selector = %hex::encode(selector),
                "Selector not found in mapped contract, repairing address map"
            );
            let original_err = SleuthError::NoAbiMethod {
                selector: hex::encode(selector),
            };
            match self.scan_all(selector) {
                Ok(corrected) => {
                    self.contract_map
                        .add_contract(address, corrected.contract_name.clone());
                    Ok(corrected)
                }
                Err(_) => Err(original_err),
            }
        } else {
            let result = self.scan_all(selector)?;
            if address != UNKNOWN {
                self.contract_map
                    .add_contract(address, result.contract_name.clone());
            }
            Ok(result)
        }
    }

    /// Scan all loaded ABIs for the selector. First match (in sorted-name
    /// order) wins; the duplicate count is how many other ABIs also matched.
    fn scan_all(&self, selector: [u8; 4]) -> SleuthResult<AbiFinderResult> {
        let mut first_match: Option<(String, Abi, Function)> = None;
        let mut matches = 0usize;

        for (name, abi) in self.store.all_abis() {
            if let Some(function) = function_by_selector(&abi, selector) {
                matches += 1;
                if first_match.is_none() {
                    first_match = Some((name, abi, function));
                }
            }
        }

        match first_match {
            Some((contract_name, abi, function)) => Ok(AbiFinderResult {
                abi,
                function,
                contract_name,
                duplicate_count: matches - 1,
            }),
            None => Err(SleuthError::NoAbiMethod {
                selector: hex::encode(selector),
            }),
        }
    }
}

fn function_by_selector(abi: &Abi, selector: [u8; 4]) -> Option<Function> {
    abi.functions()
        .find(|f| f.short_signature() == selector)
        .cloned()
}
