use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use starknet_types_core::felt::Felt;

use crate::types::Log;

/// Where the child address lives in a factory's deployment log.
///
/// `Topic(i)` reads `keys[i]`. `Offset(n)` interprets the data felt array as
/// 32-byte-wide elements and reads element `n / 32`; offsets are validated to
/// be 32-byte aligned at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildAddressLocation {
    #[serde(rename = "topic")]
    Topic(u8),
    #[serde(rename = "offset")]
    Offset(usize),
}

/// A factory contract definition. Observing a log that matches it yields a
/// child address, which from then on acts as an implicit member of any
/// downstream filter that references the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Factory {
    pub id: String,
    pub chain_id: u64,
    pub address: Felt,
    pub event_selector: Felt,
    pub child_address_location: ChildAddressLocation,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
}

impl Factory {
    pub fn in_range(&self, block_number: u64) -> bool {
        self.from_block.is_none_or(|from| block_number >= from)
            && self.to_block.is_none_or(|to| block_number <= to)
    }

    pub fn matches_log(&self, log: &Log) -> bool {
        self.in_range(log.block_number)
            && log.address == self.address
            && log.selector() == Some(&self.event_selector)
    }

    /// Extract the child address from a log already known to match.
    pub fn extract_child_address(&self, log: &Log) -> Option<Felt> {
        match self.child_address_location {
            ChildAddressLocation::Topic(i) => log.keys.get(i as usize).copied(),
            ChildAddressLocation::Offset(offset) => log.data.get(offset / 32).copied(),
        }
    }
}

/// Process-wide map of `factory id → (child address → first-seen block)`.
///
/// Mutated only by the sync engines; read by filter matching. First-seen
/// blocks use upsert-min semantics so replays can never move a discovery
/// later than it actually happened.
#[derive(Debug, Clone, Default)]
pub struct ChildAddresses {
    map: HashMap<String, HashMap<Felt, u64>>,
}

impl ChildAddresses {
    pub fn new() -> Self {
        ChildAddresses::default()
    }

    /// Record a discovery. Returns true when the entry was created or its
    /// first-seen block was lowered.
    pub fn insert_min(&mut self, factory_id: &str, address: Felt, block_number: u64) -> bool {
        let entry = self.map.entry(factory_id.to_string()).or_default();
        match entry.get(&address) {
            Some(&existing) if existing <= block_number => false,
            _ => {
                entry.insert(address, block_number);
                true
            }
        }
    }

    pub fn first_seen(&self, factory_id: &str, address: &Felt) -> Option<u64> {
        self.map.get(factory_id).and_then(|children| children.get(address)).copied()
    }

    /// True iff `address` was discovered for `factory_id` at or before
    /// `block_number`. A child deployed at block 500 does not retroactively
    /// match entities in block 499.
    pub fn contains_at(&self, factory_id: &str, address: &Felt, block_number: u64) -> bool {
        self.first_seen(factory_id, address).is_some_and(|first| first <= block_number)
    }

    pub fn addresses(&self, factory_id: &str) -> Vec<Felt> {
        self.map
            .get(factory_id)
            .map(|children| children.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, factory_id: &str) -> usize {
        self.map.get(factory_id).map(|children| children.len()).unwrap_or(0)
    }

    /// Remove every child whose first-seen block is in `removed_blocks`.
    /// Used to roll back discoveries on reorg.
    pub fn rollback(&mut self, removed_blocks: &HashSet<u64>) {
        for children in self.map.values_mut() {
            children.retain(|_, first_seen| !removed_blocks.contains(first_seen));
        }
    }

    pub fn remove(&mut self, factory_id: &str, address: &Felt) {
        if let Some(children) = self.map.get_mut(factory_id) {
            children.remove(address);
        }
    }

    /// Merge persisted entries loaded from the sync store.
    pub fn extend(&mut self, factory_id: &str, entries: impl IntoIterator<Item = (Felt, u64)>) {
        for (address, block_number) in entries {
            self.insert_min(factory_id, address, block_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> Factory {
        Factory {
            id: "pairs".to_string(),
            chain_id: 1,
            address: Felt::from(0xfa_u64),
            event_selector: Felt::from(0x5e1ec_u64),
            child_address_location: ChildAddressLocation::Topic(1),
            from_block: Some(100),
            to_block: None,
        }
    }

    fn log(address: u64, selector: u64, block: u64, keys: Vec<Felt>) -> Log {
        let mut all_keys = vec![Felt::from(selector)];
        all_keys.extend(keys);
        Log {
            address: Felt::from(address),
            block_hash: Felt::ONE,
            block_number: block,
            transaction_hash: Felt::TWO,
            transaction_index: 0,
            log_index: 0,
            keys: all_keys,
            data: vec![],
            removed: false,
        }
    }

    #[test]
    fn test_factory_match_and_topic_extraction() {
        let factory = factory();
        let child = Felt::from(0xabcd_u64);
        let deployment = log(0xfa, 0x5e1ec, 500, vec![child]);

        assert!(factory.matches_log(&deployment));
        assert_eq!(factory.extract_child_address(&deployment), Some(child));

        let before_range = log(0xfa, 0x5e1ec, 99, vec![child]);
        assert!(!factory.matches_log(&before_range));
    }

    #[test]
    fn test_offset_extraction_reads_32_byte_elements() {
        let mut factory = factory();
        factory.child_address_location = ChildAddressLocation::Offset(64);

        let mut deployment = log(0xfa, 0x5e1ec, 500, vec![]);
        deployment.data = vec![Felt::from(10u64), Felt::from(11u64), Felt::from(12u64)];

        assert_eq!(factory.extract_child_address(&deployment), Some(Felt::from(12u64)));
    }

    #[test]
    fn test_insert_min_keeps_earliest_block() {
        let mut children = ChildAddresses::new();
        let address = Felt::from(7u64);

        assert!(children.insert_min("pairs", address, 500));
        assert!(!children.insert_min("pairs", address, 600));
        assert_eq!(children.first_seen("pairs", &address), Some(500));

        assert!(children.insert_min("pairs", address, 400));
        assert_eq!(children.first_seen("pairs", &address), Some(400));
    }

    #[test]
    fn test_contains_at_respects_first_seen_block() {
        let mut children = ChildAddresses::new();
        let address = Felt::from(7u64);
        children.insert_min("pairs", address, 500);

        assert!(children.contains_at("pairs", &address, 500));
        assert!(children.contains_at("pairs", &address, 600));
        assert!(!children.contains_at("pairs", &address, 499));
    }

    #[test]
    fn test_rollback_removes_reorged_discoveries() {
        let mut children = ChildAddresses::new();
        children.insert_min("pairs", Felt::from(1u64), 500);
        children.insert_min("pairs", Felt::from(2u64), 501);

        let removed: HashSet<u64> = [501].into_iter().collect();
        children.rollback(&removed);

        assert_eq!(children.first_seen("pairs", &Felt::from(1u64)), Some(500));
        assert_eq!(children.first_seen("pairs", &Felt::from(2u64)), None);
    }
}
