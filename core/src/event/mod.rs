pub mod decode;

use std::sync::Arc;

use starknet_types_core::felt::Felt;

use crate::filter::{ChildAddresses, Filter};
use crate::manifest::Source;
use crate::types::checkpoint::CheckpointParts;
use crate::types::{
    Block, Checkpoint, EventKind, ExecutionStatus, Log, Trace, Transaction, TransactionReceipt,
};

use decode::{decode_event, DecodeFailureLog, DecodedEvent};

/// Everything fetched and filtered for one block, ready for assembly.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub block: Arc<Block>,
    pub logs: Vec<Log>,
    pub receipts: Vec<TransactionReceipt>,
    pub traces: Vec<Trace>,
}

impl BlockData {
    pub fn new(block: Block) -> Self {
        BlockData { block: Arc::new(block), logs: vec![], receipts: vec![], traces: vec![] }
    }

    fn receipt_for(&self, transaction_hash: &Felt) -> Option<&TransactionReceipt> {
        self.receipts.iter().find(|r| &r.transaction_hash == transaction_hash)
    }

    fn transaction_for(&self, transaction_hash: &Felt) -> Option<&Transaction> {
        self.block.transactions.iter().find(|t| t.hash() == transaction_hash)
    }
}

/// A typed event bound to its position in the global stream, as delivered to
/// user handlers.
#[derive(Debug, Clone)]
pub enum Event {
    /// Emitted once per source before any chain event, for one-time setup.
    Setup { chain_id: u64, name: String },
    Block {
        chain_id: u64,
        checkpoint: Checkpoint,
        name: String,
        block: Arc<Block>,
    },
    Transaction {
        chain_id: u64,
        checkpoint: Checkpoint,
        name: String,
        block: Arc<Block>,
        transaction: Transaction,
        receipt: TransactionReceipt,
    },
    Trace {
        chain_id: u64,
        checkpoint: Checkpoint,
        name: String,
        block: Arc<Block>,
        trace: Trace,
        transaction: Option<Transaction>,
        receipt: Option<TransactionReceipt>,
    },
    Log {
        chain_id: u64,
        checkpoint: Checkpoint,
        name: String,
        block: Arc<Block>,
        log: Log,
        transaction: Option<Transaction>,
        receipt: Option<TransactionReceipt>,
        args: Option<DecodedEvent>,
    },
    Transfer {
        chain_id: u64,
        checkpoint: Checkpoint,
        name: String,
        block: Arc<Block>,
        trace: Trace,
        from: Felt,
        to: Felt,
        value: Felt,
    },
}

impl Event {
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            Event::Setup { .. } => None,
            Event::Block { checkpoint, .. }
            | Event::Transaction { checkpoint, .. }
            | Event::Trace { checkpoint, .. }
            | Event::Log { checkpoint, .. }
            | Event::Transfer { checkpoint, .. } => Some(checkpoint),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Event::Setup { name, .. }
            | Event::Block { name, .. }
            | Event::Transaction { name, .. }
            | Event::Trace { name, .. }
            | Event::Log { name, .. }
            | Event::Transfer { name, .. } => name,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Event::Setup { chain_id, .. }
            | Event::Block { chain_id, .. }
            | Event::Transaction { chain_id, .. }
            | Event::Trace { chain_id, .. }
            | Event::Log { chain_id, .. }
            | Event::Transfer { chain_id, .. } => *chain_id,
        }
    }

    pub fn block_number(&self) -> Option<u64> {
        match self {
            Event::Setup { .. } => None,
            Event::Block { block, .. }
            | Event::Transaction { block, .. }
            | Event::Trace { block, .. }
            | Event::Log { block, .. }
            | Event::Transfer { block, .. } => Some(block.number),
        }
    }
}

/// Joins one block's records with the declared sources into a
/// checkpoint-ordered event sequence.
#[derive(Debug, Default)]
pub struct EventAssembler {
    decode_failures: DecodeFailureLog,
}

impl EventAssembler {
    pub fn new() -> Self {
        EventAssembler::default()
    }

    pub fn assemble(
        &self,
        chain_id: u64,
        data: &BlockData,
        sources: &[Source],
        children: &ChildAddresses,
    ) -> Vec<Event> {
        let block = &data.block;
        let mut events = Vec::new();

        let checkpoint = |transaction_index: u64, kind: EventKind, event_index: u64| {
            Checkpoint::encode(CheckpointParts {
                block_timestamp: block.timestamp,
                chain_id,
                block_number: block.number,
                transaction_index,
                event_kind: kind,
                event_index,
            })
        };

        for source in sources {
            match &source.filter {
                Filter::Block(filter) => {
                    if filter.matches(block.number) {
                        events.push(Event::Block {
                            chain_id,
                            checkpoint: checkpoint(0, EventKind::Blocks, 0),
                            name: source.name.clone(),
                            block: Arc::clone(block),
                        });
                    }
                }
                Filter::Transaction(filter) => {
                    for transaction in &data.block.transactions {
                        if !filter.matches(transaction, block.number, children) {
                            continue;
                        }
                        // Transaction events always carry their receipt; a
                        // reverted transaction is dropped unless asked for.
                        let Some(receipt) = data.receipt_for(transaction.hash()) else {
                            continue;
                        };
                        if receipt.execution_status == ExecutionStatus::Reverted
                            && !filter.include_reverted
                        {
                            continue;
                        }
                        events.push(Event::Transaction {
                            chain_id,
                            checkpoint: checkpoint(
                                u64::from(transaction.transaction_index()),
                                EventKind::Transactions,
                                0,
                            ),
                            name: source.name.clone(),
                            block: Arc::clone(block),
                            transaction: transaction.clone(),
                            receipt: receipt.clone(),
                        });
                    }
                }
                Filter::Trace(filter) => {
                    for trace in &data.traces {
                        if !filter.matches(trace, block.number, children) {
                            continue;
                        }
                        let receipt = data.receipt_for(&trace.transaction_hash);
                        if let Some(receipt) = receipt {
                            if receipt.execution_status == ExecutionStatus::Reverted
                                && !filter.include_reverted
                            {
                                continue;
                            }
                        }
                        let transaction = data.transaction_for(&trace.transaction_hash);
                        events.push(Event::Trace {
                            chain_id,
                            checkpoint: checkpoint(
                                transaction.map(|t| u64::from(t.transaction_index())).unwrap_or(0),
                                EventKind::Traces,
                                u64::from(trace.trace_index),
                            ),
                            name: source.name.clone(),
                            block: Arc::clone(block),
                            trace: trace.clone(),
                            transaction: transaction.cloned(),
                            receipt: receipt.cloned(),
                        });
                    }
                }
                Filter::Transfer(filter) => {
                    for trace in &data.traces {
                        if !filter.matches(trace, block.number) {
                            continue;
                        }
                        let (Some(value), Some(to)) =
                            (trace.value, trace.transfer_recipient().copied())
                        else {
                            continue;
                        };
                        let transaction = data.transaction_for(&trace.transaction_hash);
                        events.push(Event::Transfer {
                            chain_id,
                            checkpoint: checkpoint(
                                transaction.map(|t| u64::from(t.transaction_index())).unwrap_or(0),
                                EventKind::Traces,
                                u64::from(trace.trace_index),
                            ),
                            name: source.name.clone(),
                            block: Arc::clone(block),
                            trace: trace.clone(),
                            from: trace.from,
                            to,
                            value,
                        });
                    }
                }
                Filter::Log(filter) => {
                    for log in &data.logs {
                        if !filter.matches(log, children) {
                            continue;
                        }
                        let args = self.decode_log(source, log);
                        if args.is_none()
                            && source
                                .abi_events
                                .iter()
                                .any(|abi| Some(&abi.selector) == log.selector())
                        {
                            // A recognized selector that fails to decode is
                            // dropped, not delivered half-typed.
                            continue;
                        }
                        events.push(Event::Log {
                            chain_id,
                            checkpoint: checkpoint(
                                u64::from(log.transaction_index),
                                EventKind::Logs,
                                u64::from(log.log_index),
                            ),
                            name: source.name.clone(),
                            block: Arc::clone(block),
                            log: log.clone(),
                            transaction: data.transaction_for(&log.transaction_hash).cloned(),
                            receipt: data.receipt_for(&log.transaction_hash).cloned(),
                            args,
                        });
                    }
                }
            }
        }

        events.sort_by(|a, b| a.checkpoint().cmp(&b.checkpoint()));
        events
    }

    fn decode_log(&self, source: &Source, log: &Log) -> Option<DecodedEvent> {
        let selector = log.selector()?;
        let abi = source.abi_events.iter().find(|abi| &abi.selector == selector)?;
        match decode_event(abi, log) {
            Ok(decoded) => Some(decoded),
            Err(error) => {
                self.decode_failures.report(&source.name, selector, &error);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AddressCriteria, BlockFilter, LogFilter, TraceFilter};
    use crate::types::{
        BlockStatus, CallKind, FeePayment, InvokeTransaction, L1DaMode, ResourcePrice,
    };

    fn block(number: u64, timestamp: u64, tx_hashes: &[u64]) -> Block {
        Block {
            hash: Felt::from(number + 0xb000),
            number,
            parent_hash: Felt::from(number + 0xb000 - 1),
            timestamp,
            new_root: Felt::ZERO,
            sequencer_address: Felt::ONE,
            starknet_version: "0.13.3".to_string(),
            status: BlockStatus::AcceptedOnL2,
            l1_da_mode: L1DaMode::Blob,
            l1_gas_price: ResourcePrice::default(),
            l1_data_gas_price: ResourcePrice::default(),
            transactions: tx_hashes
                .iter()
                .enumerate()
                .map(|(i, hash)| {
                    Transaction::Invoke(InvokeTransaction {
                        hash: Felt::from(*hash),
                        transaction_index: i as u32,
                        version: Felt::THREE,
                        sender_address: Felt::from(0x5e11de7_u64),
                        calldata: vec![],
                        signature: vec![],
                        nonce: None,
                        resource_bounds: None,
                        tip: None,
                        paymaster_data: None,
                        account_deployment_data: None,
                        nonce_data_availability_mode: None,
                        fee_data_availability_mode: None,
                        max_fee: None,
                    })
                })
                .collect(),
        }
    }

    fn receipt(block: &Block, tx_index: u32, status: ExecutionStatus) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: *block.transactions[tx_index as usize].hash(),
            block_hash: block.hash,
            block_number: block.number,
            transaction_index: tx_index,
            actual_fee: FeePayment::default(),
            execution_status: status,
            finality_status: "ACCEPTED_ON_L2".to_string(),
            messages_sent: vec![],
            events: vec![],
            execution_resources: Default::default(),
            revert_reason: None,
            receipt_type: "INVOKE".to_string(),
            contract_address: None,
            message_hash: None,
        }
    }

    fn log(block: &Block, tx_index: u32, log_index: u32, address: u64, selector: u64) -> Log {
        Log {
            address: Felt::from(address),
            block_hash: block.hash,
            block_number: block.number,
            transaction_hash: *block.transactions[tx_index as usize].hash(),
            transaction_index: tx_index,
            log_index,
            keys: vec![Felt::from(selector)],
            data: vec![],
            removed: false,
        }
    }

    #[test]
    fn test_events_come_out_in_checkpoint_order() {
        let b = block(5, 100, &[0xa, 0xb]);
        let mut data = BlockData::new(b);
        let inner = Arc::clone(&data.block);
        data.logs = vec![
            log(&inner, 1, 1, 0x9, 0x51),
            log(&inner, 0, 0, 0x9, 0x51),
        ];
        data.receipts = vec![
            receipt(&inner, 0, ExecutionStatus::Succeeded),
            receipt(&inner, 1, ExecutionStatus::Succeeded),
        ];

        let mut log_filter = LogFilter::new(1);
        log_filter.address = AddressCriteria::single(Felt::from(0x9_u64));
        let sources = vec![
            Source::new("pairs", Filter::Log(log_filter)),
            Source::new("every-block", Filter::Block(BlockFilter::every(1, 1))),
        ];

        let assembler = EventAssembler::new();
        let events = assembler.assemble(1, &data, &sources, &ChildAddresses::new());

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Event::Block { .. }));
        assert!(matches!(&events[1], Event::Log { log, .. } if log.log_index == 0));
        assert!(matches!(&events[2], Event::Log { log, .. } if log.log_index == 1));

        for pair in events.windows(2) {
            assert!(pair[0].checkpoint() < pair[1].checkpoint());
        }
    }

    #[test]
    fn test_reverted_traces_dropped_unless_requested() {
        let b = block(5, 100, &[0xa]);
        let mut data = BlockData::new(b);
        let inner = Arc::clone(&data.block);
        data.receipts = vec![receipt(&inner, 0, ExecutionStatus::Reverted)];
        data.traces = vec![Trace {
            transaction_hash: *inner.transactions[0].hash(),
            trace_index: 0,
            kind: CallKind::Call,
            from: Felt::ONE,
            to: Some(Felt::TWO),
            input: vec![],
            output: None,
            value: None,
            error: None,
            subcalls: 0,
        }];

        let assembler = EventAssembler::new();
        let children = ChildAddresses::new();

        let sources = vec![Source::new("calls", Filter::Trace(TraceFilter::new(1)))];
        assert!(assembler.assemble(1, &data, &sources, &children).is_empty());

        let mut include = TraceFilter::new(1);
        include.include_reverted = true;
        let sources = vec![Source::new("calls", Filter::Trace(include))];
        assert_eq!(assembler.assemble(1, &data, &sources, &children).len(), 1);
    }
}
