//! Converts raw RPC payloads into the canonical records, assigning the
//! positions the upstream does not return and validating cross-record
//! consistency. Violations here mean the provider is lying; they are fatal to
//! the batch and retried at a higher level.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use starknet_types_core::felt::Felt;
use thiserror::Error;
use tracing::warn;

use crate::helpers::{padded_hex, selector_from_name};
use crate::provider::jsonrpc::{
    RpcBlockTrace, RpcBlockWithTxs, RpcEmittedEvent, RpcExecuteInvocation, RpcFunctionInvocation,
    RpcTransaction, RpcTransactionReceipt, RpcTransactionTrace,
};
use crate::types::{
    Block, BlockStatus, CallKind, DeclareTransaction, DeployAccountTransaction, DeployTransaction,
    InvokeTransaction, L1DaMode, L1HandlerTransaction, Log, ResourcePrice, Trace, Transaction,
    TransactionReceipt,
};

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("block {block_number}: missing required field {field}")]
    MissingField { block_number: u64, field: &'static str },

    #[error("block {block_number}: duplicate transaction hash {transaction_hash}")]
    DuplicateTransactionHash { block_number: u64, transaction_hash: String },

    #[error("receipt {transaction_hash} references block {got}, expected {expected}")]
    ReceiptBlockMismatch { transaction_hash: String, got: String, expected: String },

    #[error("receipt {transaction_hash} does not match any transaction in block {block_number}")]
    ReceiptWithoutTransaction { transaction_hash: String, block_number: u64 },

    #[error("log in block {block_number} references unknown transaction {transaction_hash}")]
    LogWithoutTransaction { block_number: u64, transaction_hash: String },

    #[error("block {block_number}: {column} value {value} exceeds the {width}-bit column bound")]
    OutOfBounds { block_number: u64, column: &'static str, value: u64, width: u8 },

    #[error("block {block_number} has {transaction_count} transactions but tracing returned nothing")]
    EmptyTraceSet { block_number: u64, transaction_count: usize },
}

/// Columns persisted as 32-bit integers.
const I32_MAX: u64 = i32::MAX as u64;
/// Columns persisted as 64-bit integers.
const I64_MAX: u64 = i64::MAX as u64;

fn check_i32(block_number: u64, column: &'static str, value: u64) -> Result<(), NormalizeError> {
    if value > I32_MAX {
        return Err(NormalizeError::OutOfBounds { block_number, column, value, width: 32 });
    }
    Ok(())
}

fn check_i64(block_number: u64, column: &'static str, value: u64) -> Result<(), NormalizeError> {
    if value > I64_MAX {
        return Err(NormalizeError::OutOfBounds { block_number, column, value, width: 64 });
    }
    Ok(())
}

pub fn normalize_block(raw: RpcBlockWithTxs) -> Result<Block, NormalizeError> {
    let block_number = raw.block_number;
    check_i64(block_number, "block_number", block_number)?;
    check_i64(block_number, "timestamp", raw.timestamp)?;
    check_i32(block_number, "transaction_count", raw.transactions.len() as u64)?;

    let mut seen_hashes = HashSet::with_capacity(raw.transactions.len());
    let mut transactions = Vec::with_capacity(raw.transactions.len());
    for (index, transaction) in raw.transactions.into_iter().enumerate() {
        let hash = *transaction.transaction_hash();
        if !seen_hashes.insert(hash) {
            return Err(NormalizeError::DuplicateTransactionHash {
                block_number,
                transaction_hash: padded_hex(&hash),
            });
        }
        transactions.push(normalize_transaction(transaction, index as u32, block_number)?);
    }

    Ok(Block {
        hash: raw.block_hash,
        number: block_number,
        parent_hash: raw.parent_hash,
        timestamp: raw.timestamp,
        new_root: raw.new_root.unwrap_or(Felt::ZERO),
        sequencer_address: raw
            .sequencer_address
            .ok_or(NormalizeError::MissingField { block_number, field: "sequencer_address" })?,
        starknet_version: raw.starknet_version.unwrap_or_default(),
        status: raw.status.unwrap_or(BlockStatus::AcceptedOnL2),
        l1_da_mode: raw.l1_da_mode.unwrap_or(L1DaMode::Calldata),
        l1_gas_price: raw.l1_gas_price.unwrap_or_else(ResourcePrice::default),
        l1_data_gas_price: raw.l1_data_gas_price.unwrap_or_else(ResourcePrice::default),
        transactions,
    })
}

fn normalize_transaction(
    raw: RpcTransaction,
    index: u32,
    block_number: u64,
) -> Result<Transaction, NormalizeError> {
    Ok(match raw {
        RpcTransaction::Invoke(tx) => {
            // v0 invokes address a contract directly instead of a sender
            // account; either field satisfies the sender column.
            let sender_address = tx
                .sender_address
                .or(tx.contract_address)
                .ok_or(NormalizeError::MissingField { block_number, field: "sender_address" })?;
            Transaction::Invoke(InvokeTransaction {
                hash: tx.transaction_hash,
                transaction_index: index,
                version: tx.version,
                sender_address,
                calldata: tx.calldata,
                signature: tx.signature,
                nonce: tx.nonce,
                resource_bounds: tx.resource_bounds,
                tip: tx.tip,
                paymaster_data: tx.paymaster_data,
                account_deployment_data: tx.account_deployment_data,
                nonce_data_availability_mode: tx.nonce_data_availability_mode,
                fee_data_availability_mode: tx.fee_data_availability_mode,
                max_fee: tx.max_fee,
            })
        }
        RpcTransaction::L1Handler(tx) => Transaction::L1Handler(L1HandlerTransaction {
            hash: tx.transaction_hash,
            transaction_index: index,
            version: tx.version,
            contract_address: tx.contract_address,
            entry_point_selector: tx.entry_point_selector,
            calldata: tx.calldata,
            nonce: tx.nonce,
        }),
        RpcTransaction::Declare(tx) => Transaction::Declare(DeclareTransaction {
            hash: tx.transaction_hash,
            transaction_index: index,
            version: tx.version,
            sender_address: tx.sender_address,
            class_hash: tx.class_hash,
            compiled_class_hash: tx.compiled_class_hash,
            signature: tx.signature,
            nonce: tx.nonce,
            resource_bounds: tx.resource_bounds,
            tip: tx.tip,
            max_fee: tx.max_fee,
        }),
        RpcTransaction::Deploy(tx) => Transaction::Deploy(DeployTransaction {
            hash: tx.transaction_hash,
            transaction_index: index,
            version: tx.version,
            class_hash: tx.class_hash,
            contract_address_salt: tx.contract_address_salt,
            constructor_calldata: tx.constructor_calldata,
        }),
        RpcTransaction::DeployAccount(tx) => Transaction::DeployAccount(DeployAccountTransaction {
            hash: tx.transaction_hash,
            transaction_index: index,
            version: tx.version,
            class_hash: tx.class_hash,
            contract_address_salt: tx.contract_address_salt,
            constructor_calldata: tx.constructor_calldata,
            signature: tx.signature,
            nonce: tx.nonce,
            resource_bounds: tx.resource_bounds,
            tip: tx.tip,
            max_fee: tx.max_fee,
        }),
    })
}

fn transaction_index_map(block: &Block) -> HashMap<Felt, u32> {
    block
        .transactions
        .iter()
        .map(|tx| (*tx.hash(), tx.transaction_index()))
        .collect()
}

/// Assemble logs for one block from emitted events, assigning the dense
/// per-block `log_index` and repairing `transaction_index` by hash lookup.
pub fn normalize_logs(
    block: &Block,
    events: &[RpcEmittedEvent],
) -> Result<Vec<Log>, NormalizeError> {
    let index_by_hash = transaction_index_map(block);
    let mut logs = Vec::with_capacity(events.len());

    check_i32(block.number, "log_count", events.len() as u64)?;

    for (log_index, event) in events.iter().enumerate() {
        if let Some(event_block_number) = event.block_number {
            if event_block_number != block.number {
                return Err(NormalizeError::ReceiptBlockMismatch {
                    transaction_hash: padded_hex(&event.transaction_hash),
                    got: event_block_number.to_string(),
                    expected: block.number.to_string(),
                });
            }
        }

        let transaction_index = if event.transaction_hash == Felt::ZERO {
            // Some providers emit system events with a zeroed hash; accept
            // them but skip the repair.
            warn!(
                block_number = block.number,
                log_index, "log has zero transaction hash, skipping transaction_index repair"
            );
            0
        } else {
            *index_by_hash.get(&event.transaction_hash).ok_or_else(|| {
                NormalizeError::LogWithoutTransaction {
                    block_number: block.number,
                    transaction_hash: padded_hex(&event.transaction_hash),
                }
            })?
        };

        logs.push(Log {
            address: event.from_address,
            block_hash: block.hash,
            block_number: block.number,
            transaction_hash: event.transaction_hash,
            transaction_index,
            log_index: log_index as u32,
            keys: event.keys.clone(),
            data: event.data.clone(),
            removed: false,
        });
    }

    Ok(logs)
}

/// Normalize receipts against their parent block, validating every
/// cross-record invariant along the way.
pub fn normalize_receipts(
    block: &Block,
    raw_receipts: &[RpcTransactionReceipt],
) -> Result<Vec<TransactionReceipt>, NormalizeError> {
    let index_by_hash = transaction_index_map(block);
    let mut seen = HashSet::with_capacity(raw_receipts.len());
    let mut receipts = Vec::with_capacity(raw_receipts.len());

    for raw in raw_receipts {
        if !seen.insert(raw.transaction_hash) {
            return Err(NormalizeError::DuplicateTransactionHash {
                block_number: block.number,
                transaction_hash: padded_hex(&raw.transaction_hash),
            });
        }

        if let Some(receipt_block_hash) = raw.block_hash {
            if receipt_block_hash != block.hash {
                return Err(NormalizeError::ReceiptBlockMismatch {
                    transaction_hash: padded_hex(&raw.transaction_hash),
                    got: padded_hex(&receipt_block_hash),
                    expected: padded_hex(&block.hash),
                });
            }
        }
        if let Some(receipt_block_number) = raw.block_number {
            if receipt_block_number != block.number {
                return Err(NormalizeError::ReceiptBlockMismatch {
                    transaction_hash: padded_hex(&raw.transaction_hash),
                    got: receipt_block_number.to_string(),
                    expected: block.number.to_string(),
                });
            }
        }

        let transaction_index = *index_by_hash.get(&raw.transaction_hash).ok_or_else(|| {
            NormalizeError::ReceiptWithoutTransaction {
                transaction_hash: padded_hex(&raw.transaction_hash),
                block_number: block.number,
            }
        })?;

        receipts.push(TransactionReceipt {
            transaction_hash: raw.transaction_hash,
            block_hash: block.hash,
            block_number: block.number,
            transaction_index,
            actual_fee: raw.actual_fee.clone().unwrap_or_default(),
            execution_status: raw.execution_status,
            finality_status: raw.finality_status.clone().unwrap_or_default(),
            messages_sent: raw.messages_sent.clone(),
            events: raw.events.clone(),
            execution_resources: raw.execution_resources.unwrap_or_default(),
            revert_reason: raw.revert_reason.clone(),
            receipt_type: raw.receipt_type.clone(),
            contract_address: raw.contract_address,
            message_hash: raw.message_hash,
        });
    }

    Ok(receipts)
}

static TRANSFER_SELECTOR: Lazy<Felt> = Lazy::new(|| selector_from_name("transfer"));
static TWO_POW_128: Lazy<Felt> =
    Lazy::new(|| Felt::from_hex("0x100000000000000000000000000000000").expect("static constant"));

/// Flatten block traces into dense per-block call records.
///
/// Value is derived for token-transfer-shaped calls only, from the
/// `(recipient, amount_low, amount_high)` calldata layout; everything else
/// carries no value and can never satisfy a transfer filter.
pub fn normalize_traces(
    block: &Block,
    raw_traces: &[RpcBlockTrace],
) -> Result<Vec<Trace>, NormalizeError> {
    let index_by_hash = transaction_index_map(block);

    // Deterministic order: block position first, provider order second.
    let mut ordered: Vec<&RpcBlockTrace> = raw_traces.iter().collect();
    ordered.sort_by_key(|t| index_by_hash.get(&t.transaction_hash).copied().unwrap_or(u32::MAX));

    let mut traces = Vec::new();
    let mut trace_index = 0u32;

    for raw in ordered {
        flatten_transaction_trace(raw, &mut traces, &mut trace_index);
    }

    check_i32(block.number, "trace_count", traces.len() as u64)?;
    Ok(traces)
}

fn flatten_transaction_trace(raw: &RpcBlockTrace, out: &mut Vec<Trace>, trace_index: &mut u32) {
    let transaction_hash = raw.transaction_hash;
    let RpcTransactionTrace { execute_invocation, constructor_invocation, function_invocation, .. } =
        &raw.trace_root;

    match execute_invocation {
        Some(RpcExecuteInvocation::Success(invocation)) => {
            flatten_invocation(transaction_hash, invocation, CallKind::Call, out, trace_index);
        }
        Some(RpcExecuteInvocation::Reverted(reverted)) => {
            out.push(Trace {
                transaction_hash,
                trace_index: *trace_index,
                kind: CallKind::Call,
                from: Felt::ZERO,
                to: None,
                input: vec![],
                output: None,
                value: None,
                error: Some(reverted.revert_reason.clone()),
                subcalls: 0,
            });
            *trace_index += 1;
        }
        None => {}
    }

    if let Some(invocation) = constructor_invocation {
        flatten_invocation(transaction_hash, invocation, CallKind::Constructor, out, trace_index);
    }
    if let Some(invocation) = function_invocation {
        flatten_invocation(transaction_hash, invocation, CallKind::Call, out, trace_index);
    }
}

fn flatten_invocation(
    transaction_hash: Felt,
    invocation: &RpcFunctionInvocation,
    default_kind: CallKind,
    out: &mut Vec<Trace>,
    trace_index: &mut u32,
) {
    let kind = match invocation.call_type.as_deref() {
        Some("LIBRARY_CALL") => CallKind::LibraryCall,
        Some("DELEGATE") => CallKind::Delegate,
        Some("CALL") => CallKind::Call,
        _ => default_kind,
    };

    let mut input = Vec::with_capacity(invocation.calldata.len() + 1);
    if let Some(selector) = invocation.entry_point_selector {
        input.push(selector);
    }
    input.extend_from_slice(&invocation.calldata);

    let value = derive_transfer_value(&input);

    out.push(Trace {
        transaction_hash,
        trace_index: *trace_index,
        kind,
        from: invocation.caller_address.unwrap_or(Felt::ZERO),
        to: Some(invocation.contract_address),
        input,
        output: Some(invocation.result.clone()),
        value,
        error: None,
        subcalls: invocation.calls.len() as u32,
    });
    *trace_index += 1;

    for call in &invocation.calls {
        flatten_invocation(transaction_hash, call, CallKind::Call, out, trace_index);
    }
}

fn derive_transfer_value(input: &[Felt]) -> Option<Felt> {
    if input.len() >= 4 && input[0] == *TRANSFER_SELECTOR {
        // [selector, recipient, amount_low, amount_high]
        let low = input[2];
        let high = input[3];
        Some(low + high * *TWO_POW_128)
    } else {
        None
    }
}

/// A block that has transactions must trace into a nonempty set when the
/// provider supports tracing at all.
pub fn ensure_trace_set(
    block: &Block,
    traces: &[Trace],
    traces_supported: bool,
) -> Result<(), NormalizeError> {
    if traces_supported && traces.is_empty() && !block.transactions.is_empty() {
        return Err(NormalizeError::EmptyTraceSet {
            block_number: block.number,
            transaction_count: block.transactions.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_block(transactions: serde_json::Value) -> RpcBlockWithTxs {
        serde_json::from_value(json!({
            "block_hash": "0xb10c",
            "parent_hash": "0xdad",
            "block_number": 100,
            "timestamp": 1_700_000_000u64,
            "new_root": "0x1",
            "sequencer_address": "0x2",
            "starknet_version": "0.13.3",
            "status": "ACCEPTED_ON_L2",
            "l1_da_mode": "BLOB",
            "l1_gas_price": { "price_in_fri": "0x5", "price_in_wei": "0x3" },
            "l1_data_gas_price": { "price_in_fri": "0x1", "price_in_wei": "0x1" },
            "transactions": transactions,
        }))
        .unwrap()
    }

    fn invoke_json(hash: &str) -> serde_json::Value {
        json!({
            "type": "INVOKE",
            "transaction_hash": hash,
            "version": "0x3",
            "sender_address": "0x77",
            "calldata": [],
            "signature": [],
        })
    }

    #[test]
    fn test_normalize_block_assigns_dense_transaction_indexes() {
        let block =
            normalize_block(raw_block(json!([invoke_json("0xa"), invoke_json("0xb")]))).unwrap();

        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[0].transaction_index(), 0);
        assert_eq!(block.transactions[1].transaction_index(), 1);
        assert_eq!(block.transactions[1].hash(), &Felt::from_hex("0xb").unwrap());
    }

    #[test]
    fn test_duplicate_transaction_hash_is_fatal() {
        let result = normalize_block(raw_block(json!([invoke_json("0xa"), invoke_json("0xa")])));
        assert!(matches!(result, Err(NormalizeError::DuplicateTransactionHash { .. })));
    }

    fn emitted(tx_hash: &str) -> RpcEmittedEvent {
        serde_json::from_value(json!({
            "from_address": "0x9",
            "keys": ["0x1"],
            "data": ["0x2"],
            "transaction_hash": tx_hash,
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_logs_repairs_transaction_index() {
        let block =
            normalize_block(raw_block(json!([invoke_json("0xa"), invoke_json("0xb")]))).unwrap();
        let logs = normalize_logs(&block, &[emitted("0xb"), emitted("0xa"), emitted("0xb")])
            .unwrap();

        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].log_index, 0);
        assert_eq!(logs[1].log_index, 1);
        assert_eq!(logs[2].log_index, 2);
        assert_eq!(logs[0].transaction_index, 1);
        assert_eq!(logs[1].transaction_index, 0);
        assert_eq!(logs[2].transaction_index, 1);
    }

    #[test]
    fn test_zero_transaction_hash_log_is_accepted_without_repair() {
        let block = normalize_block(raw_block(json!([invoke_json("0xa")]))).unwrap();
        let logs = normalize_logs(&block, &[emitted("0x0")]).unwrap();
        assert_eq!(logs[0].transaction_index, 0);
    }

    #[test]
    fn test_log_with_unknown_transaction_is_fatal() {
        let block = normalize_block(raw_block(json!([invoke_json("0xa")]))).unwrap();
        let result = normalize_logs(&block, &[emitted("0xdead")]);
        assert!(matches!(result, Err(NormalizeError::LogWithoutTransaction { .. })));
    }

    fn receipt_json(hash: &str) -> serde_json::Value {
        json!({
            "type": "INVOKE",
            "transaction_hash": hash,
            "actual_fee": { "amount": "0x10", "unit": "FRI" },
            "execution_status": "SUCCEEDED",
            "finality_status": "ACCEPTED_ON_L2",
            "messages_sent": [],
            "events": [],
            "execution_resources": { "l1_gas": 1, "l1_data_gas": 2, "l2_gas": 3 },
        })
    }

    #[test]
    fn test_normalize_receipts_fills_block_context() {
        let block =
            normalize_block(raw_block(json!([invoke_json("0xa"), invoke_json("0xb")]))).unwrap();
        let raw: Vec<RpcTransactionReceipt> = vec![
            serde_json::from_value(receipt_json("0xb")).unwrap(),
            serde_json::from_value(receipt_json("0xa")).unwrap(),
        ];

        let receipts = normalize_receipts(&block, &raw).unwrap();
        assert_eq!(receipts[0].transaction_index, 1);
        assert_eq!(receipts[0].block_number, 100);
        assert_eq!(receipts[0].block_hash, block.hash);
        assert_eq!(receipts[1].transaction_index, 0);
    }

    #[test]
    fn test_receipt_for_unknown_transaction_is_fatal() {
        let block = normalize_block(raw_block(json!([invoke_json("0xa")]))).unwrap();
        let raw: Vec<RpcTransactionReceipt> =
            vec![serde_json::from_value(receipt_json("0xdead")).unwrap()];
        assert!(matches!(
            normalize_receipts(&block, &raw),
            Err(NormalizeError::ReceiptWithoutTransaction { .. })
        ));
    }

    #[test]
    fn test_duplicate_receipt_hash_is_fatal() {
        let block = normalize_block(raw_block(json!([invoke_json("0xa")]))).unwrap();
        let raw: Vec<RpcTransactionReceipt> = vec![
            serde_json::from_value(receipt_json("0xa")).unwrap(),
            serde_json::from_value(receipt_json("0xa")).unwrap(),
        ];
        assert!(matches!(
            normalize_receipts(&block, &raw),
            Err(NormalizeError::DuplicateTransactionHash { .. })
        ));
    }

    #[test]
    fn test_trace_flattening_orders_by_transaction_and_depth() {
        let block =
            normalize_block(raw_block(json!([invoke_json("0xa"), invoke_json("0xb")]))).unwrap();

        let raw: Vec<RpcBlockTrace> = serde_json::from_value(json!([
            {
                "transaction_hash": "0xb",
                "trace_root": {
                    "type": "INVOKE",
                    "execute_invocation": {
                        "contract_address": "0x100",
                        "entry_point_selector": "0x1",
                        "calldata": [],
                        "caller_address": "0x0",
                        "call_type": "CALL",
                        "result": [],
                        "calls": [],
                    }
                }
            },
            {
                "transaction_hash": "0xa",
                "trace_root": {
                    "type": "INVOKE",
                    "execute_invocation": {
                        "contract_address": "0x200",
                        "entry_point_selector": "0x2",
                        "calldata": [],
                        "caller_address": "0x0",
                        "call_type": "CALL",
                        "result": [],
                        "calls": [{
                            "contract_address": "0x201",
                            "entry_point_selector": "0x3",
                            "calldata": [],
                            "caller_address": "0x200",
                            "call_type": "CALL",
                            "result": [],
                            "calls": [],
                        }],
                    }
                }
            }
        ]))
        .unwrap();

        let traces = normalize_traces(&block, &raw).unwrap();
        assert_eq!(traces.len(), 3);
        // Transaction 0xa comes first despite provider order.
        assert_eq!(traces[0].transaction_hash, Felt::from_hex("0xa").unwrap());
        assert_eq!(traces[0].subcalls, 1);
        assert_eq!(traces[1].to, Some(Felt::from_hex("0x201").unwrap()));
        assert_eq!(traces[2].transaction_hash, Felt::from_hex("0xb").unwrap());
        assert_eq!(traces.iter().map(|t| t.trace_index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_transfer_value_derivation() {
        let selector = selector_from_name("transfer");
        let input =
            vec![selector, Felt::from(0xbeef_u64), Felt::from(100u64), Felt::from(0u64)];
        assert_eq!(derive_transfer_value(&input), Some(Felt::from(100u64)));

        let high_part =
            vec![selector, Felt::from(0xbeef_u64), Felt::ZERO, Felt::ONE];
        assert_eq!(
            derive_transfer_value(&high_part),
            Some(Felt::from_hex("0x100000000000000000000000000000000").unwrap())
        );

        let not_transfer = vec![Felt::ONE, Felt::TWO];
        assert_eq!(derive_transfer_value(&not_transfer), None);
    }

    #[test]
    fn test_empty_trace_set_detection() {
        let block = normalize_block(raw_block(json!([invoke_json("0xa")]))).unwrap();
        assert!(ensure_trace_set(&block, &[], true).is_err());
        assert!(ensure_trace_set(&block, &[], false).is_ok());
    }
}
