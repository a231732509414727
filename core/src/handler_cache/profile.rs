//! Profile-based request prediction.
//!
//! During handler execution a sample of read-only calls is recorded as
//! *patterns*: structural descriptions of how the call's address and
//! arguments derive from the current event. Recovery is a pure function from
//! (pattern, event) to a concrete call, which is what makes the prefetch
//! machinery testable without a network.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use starknet_types_core::felt::Felt;

use crate::event::Event;
use crate::provider::CallRequest;

/// Patterns carrying at least one constant kept per event name. Constants
/// bind a pattern to specific contracts, so stale ones stop recovering and
/// are evicted least-recently-seen. Constant-free patterns generalize and are
/// kept unbounded.
const MAX_CONSTANT_PATTERNS: usize = 10;

/// A path into the current event's fields, the `derived` half of a pattern
/// member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFieldPath {
    #[serde(rename = "block_number")]
    BlockNumber,
    #[serde(rename = "block_timestamp")]
    BlockTimestamp,
    #[serde(rename = "transaction_hash")]
    TransactionHash,
    #[serde(rename = "transaction_sender")]
    TransactionSender,
    #[serde(rename = "log_address")]
    LogAddress,
    #[serde(rename = "log_key")]
    LogKey(usize),
    #[serde(rename = "log_data")]
    LogData(usize),
    #[serde(rename = "trace_from")]
    TraceFrom,
    #[serde(rename = "trace_to")]
    TraceTo,
    #[serde(rename = "trace_input")]
    TraceInput(usize),
    #[serde(rename = "transfer_from")]
    TransferFrom,
    #[serde(rename = "transfer_to")]
    TransferTo,
}

impl EventFieldPath {
    /// Resolve this path against a concrete event.
    pub fn resolve(&self, event: &Event) -> Option<Felt> {
        match (self, event) {
            (EventFieldPath::BlockNumber, _) => event.block_number().map(Felt::from),
            (EventFieldPath::BlockTimestamp, Event::Block { block, .. })
            | (EventFieldPath::BlockTimestamp, Event::Log { block, .. })
            | (EventFieldPath::BlockTimestamp, Event::Transaction { block, .. })
            | (EventFieldPath::BlockTimestamp, Event::Trace { block, .. })
            | (EventFieldPath::BlockTimestamp, Event::Transfer { block, .. }) => {
                Some(Felt::from(block.timestamp))
            }
            (EventFieldPath::TransactionHash, Event::Log { log, .. }) => {
                Some(log.transaction_hash)
            }
            (EventFieldPath::TransactionHash, Event::Transaction { transaction, .. }) => {
                Some(*transaction.hash())
            }
            (EventFieldPath::TransactionHash, Event::Trace { trace, .. })
            | (EventFieldPath::TransactionHash, Event::Transfer { trace, .. }) => {
                Some(trace.transaction_hash)
            }
            (EventFieldPath::TransactionSender, Event::Transaction { transaction, .. }) => {
                transaction.sender_address().copied()
            }
            (EventFieldPath::TransactionSender, Event::Log { transaction, .. }) => {
                transaction.as_ref().and_then(|t| t.sender_address().copied())
            }
            (EventFieldPath::LogAddress, Event::Log { log, .. }) => Some(log.address),
            (EventFieldPath::LogKey(i), Event::Log { log, .. }) => log.keys.get(*i).copied(),
            (EventFieldPath::LogData(i), Event::Log { log, .. }) => log.data.get(*i).copied(),
            (EventFieldPath::TraceFrom, Event::Trace { trace, .. }) => Some(trace.from),
            (EventFieldPath::TraceTo, Event::Trace { trace, .. }) => trace.to,
            (EventFieldPath::TraceInput(i), Event::Trace { trace, .. }) => {
                trace.input.get(*i).copied()
            }
            (EventFieldPath::TransferFrom, Event::Transfer { from, .. }) => Some(*from),
            (EventFieldPath::TransferTo, Event::Transfer { to, .. }) => Some(*to),
            _ => None,
        }
    }

    /// All paths that resolve on this event, paired with their values. Used
    /// when deriving a pattern from an observed call.
    fn candidates(event: &Event) -> Vec<(EventFieldPath, Felt)> {
        let mut paths: Vec<EventFieldPath> = vec![
            EventFieldPath::BlockNumber,
            EventFieldPath::BlockTimestamp,
            EventFieldPath::TransactionHash,
            EventFieldPath::TransactionSender,
            EventFieldPath::LogAddress,
            EventFieldPath::TraceFrom,
            EventFieldPath::TraceTo,
            EventFieldPath::TransferFrom,
            EventFieldPath::TransferTo,
        ];
        if let Event::Log { log, .. } = event {
            paths.extend((0..log.keys.len()).map(EventFieldPath::LogKey));
            paths.extend((0..log.data.len()).map(EventFieldPath::LogData));
        }
        if let Event::Trace { trace, .. } = event {
            paths.extend((0..trace.input.len()).map(EventFieldPath::TraceInput));
        }

        paths
            .into_iter()
            .filter_map(|path| path.resolve(event).map(|value| (path, value)))
            .collect()
    }
}

/// One member of a pattern: a literal value or a path into the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternValue {
    #[serde(rename = "constant")]
    Constant(Felt),
    #[serde(rename = "derived")]
    Derived(EventFieldPath),
}

impl PatternValue {
    pub fn recover(&self, event: &Event) -> Option<Felt> {
        match self {
            PatternValue::Constant(value) => Some(*value),
            PatternValue::Derived(path) => path.resolve(event),
        }
    }

    fn is_constant(&self) -> bool {
        matches!(self, PatternValue::Constant(_))
    }
}

/// Structural description of a read-only contract call relative to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePattern {
    pub contract_address: PatternValue,
    pub entry_point_selector: PatternValue,
    pub calldata: Vec<PatternValue>,
}

impl ProfilePattern {
    /// Derive a pattern from an observed call: every felt that matches an
    /// event field becomes `derived`, everything else `constant`.
    pub fn derive(event: &Event, call: &CallRequest) -> ProfilePattern {
        let candidates = EventFieldPath::candidates(event);
        let classify = |value: &Felt| -> PatternValue {
            candidates
                .iter()
                .find(|(_, candidate)| candidate == value)
                .map(|(path, _)| PatternValue::Derived(*path))
                .unwrap_or(PatternValue::Constant(*value))
        };

        ProfilePattern {
            contract_address: classify(&call.contract_address),
            entry_point_selector: classify(&call.entry_point_selector),
            calldata: call.calldata.iter().map(classify).collect(),
        }
    }

    /// Recover a concrete call from this pattern against a new event. Pure;
    /// `None` when any derived member is absent on this event.
    pub fn recover(&self, event: &Event) -> Option<CallRequest> {
        Some(CallRequest {
            contract_address: self.contract_address.recover(event)?,
            entry_point_selector: self.entry_point_selector.recover(event)?,
            calldata: self
                .calldata
                .iter()
                .map(|member| member.recover(event))
                .collect::<Option<Vec<_>>>()?,
        })
    }

    /// Whether this pattern matches a concrete call on the given event:
    /// address, function and every argument position must agree.
    pub fn matches(&self, event: &Event, call: &CallRequest) -> bool {
        self.recover(event).is_some_and(|recovered| &recovered == call)
    }

    fn has_constants(&self) -> bool {
        self.contract_address.is_constant()
            || self.entry_point_selector.is_constant()
            || self.calldata.iter().any(PatternValue::is_constant)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatternEntry {
    pattern: ProfilePattern,
    count: u64,
    last_seen: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EventProfile {
    patterns: Vec<PatternEntry>,
    samples: u64,
    clock: u64,
}

/// Per-event-name pattern store with frequency tracking.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProfileStore {
    profiles: HashMap<String, EventProfile>,
}

/// A recovered call with the observed frequency of its pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedCall {
    pub call: CallRequest,
    pub weight: f64,
}

impl ProfileStore {
    pub fn new() -> Self {
        ProfileStore::default()
    }

    /// Record one sampled observation.
    pub fn record(&mut self, event_name: &str, event: &Event, call: &CallRequest) {
        let pattern = ProfilePattern::derive(event, call);
        let profile = self.profiles.entry(event_name.to_string()).or_default();
        profile.samples += 1;
        profile.clock += 1;
        let clock = profile.clock;

        if let Some(entry) = profile.patterns.iter_mut().find(|e| e.pattern == pattern) {
            entry.count += 1;
            entry.last_seen = clock;
            return;
        }

        profile.patterns.push(PatternEntry { pattern, count: 1, last_seen: clock });

        // Cap constant-bearing patterns, evicting the least recently seen.
        let constant_count =
            profile.patterns.iter().filter(|e| e.pattern.has_constants()).count();
        if constant_count > MAX_CONSTANT_PATTERNS {
            if let Some(evict) = profile
                .patterns
                .iter()
                .enumerate()
                .filter(|(_, e)| e.pattern.has_constants())
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(i, _)| i)
            {
                profile.patterns.remove(evict);
            }
        }
    }

    /// Recover every known pattern against an upcoming event, weighted by
    /// observed frequency.
    pub fn predict(&self, event: &Event) -> Vec<PredictedCall> {
        let Some(profile) = self.profiles.get(event.name()) else {
            return Vec::new();
        };
        if profile.samples == 0 {
            return Vec::new();
        }

        profile
            .patterns
            .iter()
            .filter_map(|entry| {
                entry.pattern.recover(event).map(|call| PredictedCall {
                    call,
                    weight: entry.count as f64 / profile.samples as f64,
                })
            })
            .collect()
    }

    pub fn pattern_count(&self, event_name: &str) -> usize {
        self.profiles.get(event_name).map(|p| p.patterns.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::types::checkpoint::CheckpointParts;
    use crate::types::{
        Block, BlockStatus, Checkpoint, EventKind, L1DaMode, Log, ResourcePrice,
    };

    fn log_event(name: &str, key1: u64) -> Event {
        let block = Block {
            hash: Felt::from(0xb10c_u64),
            number: 500,
            parent_hash: Felt::from(0xb10b_u64),
            timestamp: 1_000,
            new_root: Felt::ZERO,
            sequencer_address: Felt::ONE,
            starknet_version: "0.13.3".to_string(),
            status: BlockStatus::AcceptedOnL2,
            l1_da_mode: L1DaMode::Blob,
            l1_gas_price: ResourcePrice::default(),
            l1_data_gas_price: ResourcePrice::default(),
            transactions: vec![],
        };
        Event::Log {
            chain_id: 1,
            checkpoint: Checkpoint::encode(CheckpointParts {
                block_timestamp: 1_000,
                chain_id: 1,
                block_number: 500,
                transaction_index: 0,
                event_kind: EventKind::Logs,
                event_index: 0,
            }),
            name: name.to_string(),
            block: Arc::new(block),
            log: Log {
                address: Felt::from(0xadd_u64),
                block_hash: Felt::from(0xb10c_u64),
                block_number: 500,
                transaction_hash: Felt::from(0x7a_u64),
                transaction_index: 0,
                log_index: 0,
                keys: vec![Felt::from(0x5e1_u64), Felt::from(key1)],
                data: vec![],
                removed: false,
            },
            transaction: None,
            receipt: None,
            args: None,
        }
    }

    fn balance_call(token: u64, owner: u64) -> CallRequest {
        CallRequest {
            contract_address: Felt::from(token),
            entry_point_selector: crate::helpers::selector_from_name("balance_of"),
            calldata: vec![Felt::from(owner)],
        }
    }

    #[test]
    fn test_derive_classifies_constants_and_derived_members() {
        let event = log_event("Transfer", 0xaaaa);
        // balance_of(ERC20, args = [event.log.keys[1]])
        let call = balance_call(0xe4c20, 0xaaaa);
        let pattern = ProfilePattern::derive(&event, &call);

        assert_eq!(pattern.contract_address, PatternValue::Constant(Felt::from(0xe4c20_u64)));
        assert_eq!(pattern.calldata, vec![PatternValue::Derived(EventFieldPath::LogKey(1))]);
    }

    #[test]
    fn test_recover_is_pure_against_new_events() {
        let sampled = log_event("Transfer", 0xaaaa);
        let call = balance_call(0xe4c20, 0xaaaa);
        let pattern = ProfilePattern::derive(&sampled, &call);

        // A later event with a different key recovers the matching call.
        let upcoming = log_event("Transfer", 0xbbbb);
        let recovered = pattern.recover(&upcoming).unwrap();
        assert_eq!(recovered, balance_call(0xe4c20, 0xbbbb));

        assert!(pattern.matches(&upcoming, &balance_call(0xe4c20, 0xbbbb)));
        assert!(!pattern.matches(&upcoming, &balance_call(0xe4c20, 0xcccc)));
    }

    #[test]
    fn test_predict_weights_by_frequency() {
        let mut store = ProfileStore::new();
        for _ in 0..9 {
            let event = log_event("Transfer", 0xaaaa);
            store.record("Transfer", &event, &balance_call(0xe4c20, 0xaaaa));
        }
        let event = log_event("Transfer", 0xaaaa);
        store.record("Transfer", &event, &balance_call(0x07e4, 0xaaaa));

        let upcoming = log_event("Transfer", 0xdddd);
        let mut predicted = store.predict(&upcoming);
        predicted.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        assert_eq!(predicted.len(), 2);
        assert!((predicted[0].weight - 0.9).abs() < 1e-9);
        assert_eq!(predicted[0].call, balance_call(0xe4c20, 0xdddd));
        assert!((predicted[1].weight - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_constant_patterns_are_capped_with_lru_eviction() {
        let mut store = ProfileStore::new();
        for token in 0..12u64 {
            let event = log_event("Transfer", 0xaaaa);
            store.record("Transfer", &event, &balance_call(0x1000 + token, 0xaaaa));
        }

        assert_eq!(store.pattern_count("Transfer"), MAX_CONSTANT_PATTERNS);

        // The oldest constant-bearing patterns are the ones that went.
        let upcoming = log_event("Transfer", 0xaaaa);
        let predicted = store.predict(&upcoming);
        assert!(!predicted.iter().any(|p| p.call.contract_address == Felt::from(0x1000_u64)));
        assert!(predicted.iter().any(|p| p.call.contract_address == Felt::from(0x100b_u64)));
    }
}
