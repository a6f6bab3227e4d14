//! In-memory registry of contract ABIs and the shared address→name map

use dashmap::DashMap;
use ethers::abi::Abi;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Thread-safe registry of contract ABIs (and optional deployment bytecode),
/// keyed by contract name. ABIs are registered by test code or generated
/// bindings; the store itself never touches the filesystem.
#[derive(Default)]
pub struct ContractStore {
    abis: RwLock<HashMap<String, Abi>>,
    bins: RwLock<HashMap<String, Vec<u8>>>,
}

impl ContractStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_abi(&self, name: impl Into<String>, abi: Abi) {
        let name = name.into();
        debug!(contract = %name, "ABI registered");
        self.abis.write().unwrap().insert(name, abi);
    }

    pub fn get_abi(&self, name: &str) -> Option<Abi> {
        self.abis.read().unwrap().get(name).cloned()
    }

    /// All registered ABIs with their names, in sorted-name order so that
    /// signature scans are deterministic
    pub fn all_abis(&self) -> Vec<(String, Abi)> {
        let abis = self.abis.read().unwrap();
        let mut all: Vec<(String, Abi)> = abis.iter().map(|(n, a)| (n.clone(), a.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn add_bin(&self, name: impl Into<String>, bin: Vec<u8>) {
        self.bins.write().unwrap().insert(name.into(), bin);
    }

    pub fn get_bin(&self, name: &str) -> Option<Vec<u8>> {
        self.bins.read().unwrap().get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.abis.read().unwrap().is_empty()
    }
}

/// Shared map of lower-cased contract addresses to short contract names.
/// Entries are sometimes guessed from an ambiguous signature scan, so writers
/// overwrite on better evidence; that eventual consistency is deliberate.
#[derive(Clone, Default)]
pub struct ContractMap {
    inner: Arc<DashMap<String, String>>,
}

impl ContractMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(address: &str) -> String {
        address.to_lowercase()
    }

    pub fn is_known_address(&self, address: &str) -> bool {
        self.inner.contains_key(&Self::normalize(address))
    }

    pub fn get_contract_name(&self, address: &str) -> Option<String> {
        self.inner.get(&Self::normalize(address)).map(|e| e.clone())
    }

    pub fn add_contract(&self, address: impl AsRef<str>, name: impl Into<String>) {
        self.inner
            .insert(Self::normalize(address.as_ref()), name.into());
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_abi() -> Abi {
        serde_json::from_str(
            r#"[{"type":"function","name":"increment","inputs":[],"outputs":[]}]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_store_roundtrip() {
        let store = ContractStore::new();
        assert!(store.is_empty());
        store.add_abi("Counter", counter_abi());
        assert!(store.get_abi("Counter").is_some());
        assert!(store.get_abi("Missing").is_none());
    }

    #[test]
    fn test_all_abis_sorted_by_name() {
        let store = ContractStore::new();
        store.add_abi("Zeta", counter_abi());
        store.add_abi("Alpha", counter_abi());
        let names: Vec<String> = store.all_abis().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Alpha", "Zeta"]);
    }

    #[test]
    fn test_contract_map_is_case_insensitive_and_overwrites() {
        let map = ContractMap::new();
        map.add_contract("0xABCDEF0000000000000000000000000000000001", "TokenA");
        assert!(map.is_known_address("0xabcdef0000000000000000000000000000000001"));
        assert_eq!(
            map.get_contract_name("0xAbCdEf0000000000000000000000000000000001"),
            Some("TokenA".to_string())
        );

        // better evidence overwrites
        map.add_contract("0xabcdef0000000000000000000000000000000001", "TokenB");
        assert_eq!(
            map.get_contract_name("0xABCDEF0000000000000000000000000000000001"),
            Some("TokenB".to_string())
        );
        assert_eq!(map.len(), 1);
    }
}
