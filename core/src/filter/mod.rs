mod factory;
mod fragment;

pub use factory::{ChildAddressLocation, ChildAddresses, Factory};
pub use fragment::{Fragment, IntervalSet, LogAddressPart};

use starknet_types_core::felt::Felt;

use crate::types::{CallKind, Log, Trace, Transaction};

/// Address predicate shared by log and trace filters: a constant, a list, a
/// factory's discovered children, or match-any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AddressCriteria {
    #[default]
    Any,
    List(Vec<Felt>),
    Factory(String),
}

impl AddressCriteria {
    pub fn single(address: Felt) -> Self {
        AddressCriteria::List(vec![address])
    }

    pub fn matches(&self, address: &Felt, block_number: u64, children: &ChildAddresses) -> bool {
        match self {
            AddressCriteria::Any => true,
            AddressCriteria::List(list) => list.contains(address),
            AddressCriteria::Factory(factory_id) => {
                children.contains_at(factory_id, address, block_number)
            }
        }
    }

    pub fn factory_id(&self) -> Option<&str> {
        match self {
            AddressCriteria::Factory(id) => Some(id),
            _ => None,
        }
    }

    pub fn plain_addresses(&self) -> Option<&[Felt]> {
        match self {
            AddressCriteria::List(list) => Some(list),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub chain_id: u64,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub address: AddressCriteria,
    /// Positional key predicates with list semantics: `topics[i]` matches
    /// when `keys[i]` is any member of the set.
    pub topics: [Option<Vec<Felt>>; 4],
    pub has_transaction_receipt: bool,
    pub include: Vec<String>,
}

impl LogFilter {
    pub fn new(chain_id: u64) -> Self {
        LogFilter {
            chain_id,
            from_block: None,
            to_block: None,
            address: AddressCriteria::Any,
            topics: [None, None, None, None],
            has_transaction_receipt: false,
            include: Vec::new(),
        }
    }

    pub fn matches(&self, log: &Log, children: &ChildAddresses) -> bool {
        if !in_range(self.from_block, self.to_block, log.block_number) {
            return false;
        }

        for (i, topic) in self.topics.iter().enumerate() {
            if let Some(candidates) = topic {
                match log.keys.get(i) {
                    Some(key) if candidates.contains(key) => {}
                    _ => return false,
                }
            }
        }

        self.address.matches(&log.address, log.block_number, children)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionFilter {
    pub chain_id: u64,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    /// Matched against `sender_address`, so only INVOKE and DECLARE can hit.
    pub from_address: Option<Vec<Felt>>,
    /// The chain has no `to` field on transactions; a plain list here is
    /// rejected at configuration time. A factory is matched against the
    /// target of L1 handler transactions, the only variant that carries one.
    pub to_address: Option<Vec<Felt>>,
    pub to_address_factory: Option<String>,
    pub include_reverted: bool,
    pub include: Vec<String>,
}

impl TransactionFilter {
    pub fn new(chain_id: u64) -> Self {
        TransactionFilter {
            chain_id,
            from_block: None,
            to_block: None,
            from_address: None,
            to_address: None,
            to_address_factory: None,
            include_reverted: false,
            include: Vec::new(),
        }
    }

    pub fn to_address_is_plain(&self) -> bool {
        self.to_address.as_ref().is_some_and(|list| !list.is_empty())
    }

    pub fn matches(
        &self,
        transaction: &Transaction,
        block_number: u64,
        children: &ChildAddresses,
    ) -> bool {
        if !in_range(self.from_block, self.to_block, block_number) {
            return false;
        }

        if let Some(from) = &self.from_address {
            match transaction.sender_address() {
                Some(sender) if from.contains(sender) => {}
                _ => return false,
            }
        }

        // A plain to-address can never match (no `to` field on this chain);
        // configuration validation rejects it, this is the backstop.
        if self.to_address_is_plain() {
            return false;
        }

        if let Some(factory_id) = &self.to_address_factory {
            let target = match transaction {
                Transaction::L1Handler(tx) => Some(&tx.contract_address),
                _ => None,
            };
            match target {
                Some(address) if children.contains_at(factory_id, address, block_number) => {}
                _ => return false,
            }
        }

        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFilter {
    pub chain_id: u64,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub from_address: Option<Vec<Felt>>,
    pub to_address: AddressCriteria,
    pub call_kind: Option<CallKind>,
    /// Compared against the first element of the call input, which carries
    /// the entry point selector.
    pub function_selector: Option<Felt>,
    /// Intentionally ignored at match time; revert filtering happens on the
    /// receipt execution status downstream.
    pub include_reverted: bool,
    pub include: Vec<String>,
}

impl TraceFilter {
    pub fn new(chain_id: u64) -> Self {
        TraceFilter {
            chain_id,
            from_block: None,
            to_block: None,
            from_address: None,
            to_address: AddressCriteria::Any,
            call_kind: None,
            function_selector: None,
            include_reverted: false,
            include: Vec::new(),
        }
    }

    pub fn matches(&self, trace: &Trace, block_number: u64, children: &ChildAddresses) -> bool {
        if !in_range(self.from_block, self.to_block, block_number) {
            return false;
        }

        if let Some(from) = &self.from_address {
            if !from.contains(&trace.from) {
                return false;
            }
        }

        match (&self.to_address, &trace.to) {
            (AddressCriteria::Any, _) => {}
            (_, None) => return false,
            (criteria, Some(to)) => {
                if !criteria.matches(to, block_number, children) {
                    return false;
                }
            }
        }

        if let Some(kind) = self.call_kind {
            if trace.kind != kind {
                return false;
            }
        }

        if let Some(selector) = &self.function_selector {
            if trace.input.first() != Some(selector) {
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFilter {
    pub chain_id: u64,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub from_address: Option<Vec<Felt>>,
    pub to_address: Option<Vec<Felt>>,
    pub include: Vec<String>,
}

impl TransferFilter {
    pub fn new(chain_id: u64) -> Self {
        TransferFilter {
            chain_id,
            from_block: None,
            to_block: None,
            from_address: None,
            to_address: None,
            include: Vec::new(),
        }
    }

    pub fn matches(&self, trace: &Trace, block_number: u64) -> bool {
        if !in_range(self.from_block, self.to_block, block_number) {
            return false;
        }

        // Transfers are value-bearing calls only.
        match &trace.value {
            Some(value) if *value != Felt::ZERO => {}
            _ => return false,
        }

        if let Some(from) = &self.from_address {
            if !from.contains(&trace.from) {
                return false;
            }
        }

        if let Some(to) = &self.to_address {
            match trace.transfer_recipient() {
                Some(target) if to.contains(target) => {}
                _ => return false,
            }
        }

        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFilter {
    pub chain_id: u64,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub interval: u64,
    pub offset: u64,
}

impl BlockFilter {
    pub fn every(chain_id: u64, interval: u64) -> Self {
        BlockFilter { chain_id, from_block: None, to_block: None, interval, offset: 0 }
    }

    pub fn matches(&self, block_number: u64) -> bool {
        in_range(self.from_block, self.to_block, block_number)
            && block_number >= self.offset
            && (block_number - self.offset) % self.interval == 0
    }

    /// Materialize the matching block numbers inside `[lo, hi]`.
    pub fn block_numbers(&self, (lo, hi): (u64, u64)) -> Vec<u64> {
        let start = lo.max(self.offset);
        let first = if (start - self.offset) % self.interval == 0 {
            start
        } else {
            start + (self.interval - (start - self.offset) % self.interval)
        };
        (first..=hi).step_by(self.interval as usize).filter(|n| self.matches(*n)).collect()
    }
}

/// User-declared match predicate over one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Log(LogFilter),
    Block(BlockFilter),
    Transaction(TransactionFilter),
    Trace(TraceFilter),
    Transfer(TransferFilter),
}

impl Filter {
    pub fn chain_id(&self) -> u64 {
        match self {
            Filter::Log(f) => f.chain_id,
            Filter::Block(f) => f.chain_id,
            Filter::Transaction(f) => f.chain_id,
            Filter::Trace(f) => f.chain_id,
            Filter::Transfer(f) => f.chain_id,
        }
    }

    pub fn from_block(&self) -> Option<u64> {
        match self {
            Filter::Log(f) => f.from_block,
            Filter::Block(f) => f.from_block,
            Filter::Transaction(f) => f.from_block,
            Filter::Trace(f) => f.from_block,
            Filter::Transfer(f) => f.from_block,
        }
    }

    pub fn to_block(&self) -> Option<u64> {
        match self {
            Filter::Log(f) => f.to_block,
            Filter::Block(f) => f.to_block,
            Filter::Transaction(f) => f.to_block,
            Filter::Trace(f) => f.to_block,
            Filter::Transfer(f) => f.to_block,
        }
    }

    /// Factory ids this filter's address criteria reference.
    pub fn referenced_factories(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            Filter::Log(f) => {
                if let Some(id) = f.address.factory_id() {
                    out.push(id);
                }
            }
            Filter::Trace(f) => {
                if let Some(id) = f.to_address.factory_id() {
                    out.push(id);
                }
            }
            Filter::Transaction(f) => {
                if let Some(id) = &f.to_address_factory {
                    out.push(id.as_str());
                }
            }
            _ => {}
        }
        out
    }

    /// Expand into the fragments under which completed intervals are kept.
    pub fn fragments(&self) -> Vec<Fragment> {
        match self {
            Filter::Log(f) => {
                let address_parts: Vec<LogAddressPart> = match &f.address {
                    AddressCriteria::Any => vec![LogAddressPart::Any],
                    AddressCriteria::List(list) => {
                        list.iter().map(|a| LogAddressPart::Address(*a)).collect()
                    }
                    AddressCriteria::Factory(id) => vec![LogAddressPart::Factory(id.clone())],
                };
                let topic0s: Vec<Option<Felt>> = match &f.topics[0] {
                    None => vec![None],
                    Some(list) => list.iter().map(|t| Some(*t)).collect(),
                };

                let mut fragments = Vec::with_capacity(address_parts.len() * topic0s.len());
                for part in &address_parts {
                    for topic0 in &topic0s {
                        fragments.push(Fragment::log(f.chain_id, part.clone(), *topic0));
                    }
                }
                fragments
            }
            Filter::Block(f) => vec![Fragment::block(f.chain_id, f.interval, f.offset)],
            Filter::Transaction(f) => match &f.from_address {
                None => vec![Fragment::transaction(f.chain_id, None)],
                Some(list) => {
                    list.iter().map(|a| Fragment::transaction(f.chain_id, Some(*a))).collect()
                }
            },
            Filter::Trace(f) => {
                let froms: Vec<Option<Felt>> = match &f.from_address {
                    None => vec![None],
                    Some(list) => list.iter().map(|a| Some(*a)).collect(),
                };
                let tos: Vec<LogAddressPart> = match &f.to_address {
                    AddressCriteria::Any => vec![LogAddressPart::Any],
                    AddressCriteria::List(list) => {
                        list.iter().map(|a| LogAddressPart::Address(*a)).collect()
                    }
                    AddressCriteria::Factory(id) => vec![LogAddressPart::Factory(id.clone())],
                };
                let mut fragments = Vec::with_capacity(froms.len() * tos.len());
                for from in &froms {
                    for to in &tos {
                        fragments.push(Fragment::trace(f.chain_id, *from, to.clone()));
                    }
                }
                fragments
            }
            Filter::Transfer(f) => {
                let froms: Vec<Option<Felt>> = match &f.from_address {
                    None => vec![None],
                    Some(list) => list.iter().map(|a| Some(*a)).collect(),
                };
                let tos: Vec<Option<Felt>> = match &f.to_address {
                    None => vec![None],
                    Some(list) => list.iter().map(|a| Some(*a)).collect(),
                };
                let mut fragments = Vec::with_capacity(froms.len() * tos.len());
                for from in &froms {
                    for to in &tos {
                        fragments.push(Fragment::transfer(f.chain_id, *from, *to));
                    }
                }
                fragments
            }
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            Filter::Log(_) => "log",
            Filter::Block(_) => "block",
            Filter::Transaction(_) => "transaction",
            Filter::Trace(_) => "trace",
            Filter::Transfer(_) => "transfer",
        }
    }
}

fn in_range(from: Option<u64>, to: Option<u64>, block_number: u64) -> bool {
    from.is_none_or(|lo| block_number >= lo) && to.is_none_or(|hi| block_number <= hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_at(address: u64, selector: u64, block: u64) -> Log {
        Log {
            address: Felt::from(address),
            block_hash: Felt::ONE,
            block_number: block,
            transaction_hash: Felt::TWO,
            transaction_index: 0,
            log_index: 0,
            keys: vec![Felt::from(selector), Felt::from(0xaaaa_u64)],
            data: vec![],
            removed: false,
        }
    }

    #[test]
    fn test_log_filter_topic_list_semantics() {
        let mut filter = LogFilter::new(1);
        filter.topics[0] = Some(vec![Felt::from(1u64), Felt::from(2u64)]);

        let children = ChildAddresses::new();
        assert!(filter.matches(&log_at(9, 1, 50), &children));
        assert!(filter.matches(&log_at(9, 2, 50), &children));
        assert!(!filter.matches(&log_at(9, 3, 50), &children));
    }

    #[test]
    fn test_log_filter_factory_address_respects_discovery_block() {
        let mut filter = LogFilter::new(1);
        filter.address = AddressCriteria::Factory("pairs".to_string());

        let mut children = ChildAddresses::new();
        children.insert_min("pairs", Felt::from(9u64), 500);

        assert!(filter.matches(&log_at(9, 1, 600), &children));
        assert!(!filter.matches(&log_at(9, 1, 499), &children));
        assert!(!filter.matches(&log_at(8, 1, 600), &children));
    }

    #[test]
    fn test_block_filter_offset_and_interval() {
        let filter = BlockFilter {
            chain_id: 1,
            from_block: None,
            to_block: None,
            interval: 10,
            offset: 3,
        };

        assert!(filter.matches(3));
        assert!(filter.matches(13));
        assert!(filter.matches(103));
        assert!(!filter.matches(10));
        assert!(!filter.matches(2));

        assert_eq!(filter.block_numbers((0, 35)), vec![3, 13, 23, 33]);
    }

    #[test]
    fn test_transfer_filter_requires_positive_value() {
        let filter = TransferFilter::new(1);
        let mut trace = Trace {
            transaction_hash: Felt::ONE,
            trace_index: 0,
            kind: CallKind::Call,
            from: Felt::from(1u64),
            to: Some(Felt::from(2u64)),
            input: vec![],
            output: None,
            value: Some(Felt::ZERO),
            error: None,
            subcalls: 0,
        };

        assert!(!filter.matches(&trace, 5));
        trace.value = Some(Felt::ONE);
        assert!(filter.matches(&trace, 5));
        trace.value = None;
        assert!(!filter.matches(&trace, 5));
    }

    #[test]
    fn test_trace_filter_function_selector() {
        let mut filter = TraceFilter::new(1);
        filter.function_selector = Some(Felt::from(0x51_u64));

        let trace = Trace {
            transaction_hash: Felt::ONE,
            trace_index: 0,
            kind: CallKind::Call,
            from: Felt::from(1u64),
            to: Some(Felt::from(2u64)),
            input: vec![Felt::from(0x51_u64), Felt::from(9u64)],
            output: None,
            value: None,
            error: None,
            subcalls: 0,
        };
        let children = ChildAddresses::new();

        assert!(filter.matches(&trace, 5, &children));

        filter.function_selector = Some(Felt::from(0x52_u64));
        assert!(!filter.matches(&trace, 5, &children));
    }

    #[test]
    fn test_log_filter_fragment_expansion() {
        let mut filter = LogFilter::new(1);
        filter.address =
            AddressCriteria::List(vec![Felt::from(1u64), Felt::from(2u64), Felt::from(3u64)]);
        filter.topics[0] = Some(vec![Felt::from(10u64), Felt::from(20u64)]);

        let fragments = Filter::Log(filter).fragments();
        assert_eq!(fragments.len(), 6);
    }
}
