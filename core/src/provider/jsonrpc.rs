//! Wire payloads for the chain's JSON-RPC surface, exactly as the upstream
//! returns them. The normalizer turns these into the canonical records.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use starknet_types_core::felt::Felt;

use crate::types::{
    BlockStatus, ExecutionResources, ExecutionStatus, FeePayment, L1DaMode, MessageToL1,
    ReceiptEvent, ResourceBoundsMapping, ResourcePrice,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

/// Block addressing for block-scoped calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Latest,
    Pending,
    Number(u64),
    Hash(Felt),
}

impl BlockId {
    pub fn to_value(&self) -> Value {
        match self {
            BlockId::Latest => json!("latest"),
            BlockId::Pending => json!("pending"),
            BlockId::Number(number) => json!({ "block_number": number }),
            BlockId::Hash(hash) => json!({ "block_hash": hash }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockWithTxs {
    pub block_hash: Felt,
    pub parent_hash: Felt,
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub new_root: Option<Felt>,
    #[serde(default)]
    pub sequencer_address: Option<Felt>,
    #[serde(default)]
    pub starknet_version: Option<String>,
    #[serde(default)]
    pub status: Option<BlockStatus>,
    #[serde(default)]
    pub l1_da_mode: Option<L1DaMode>,
    #[serde(default)]
    pub l1_gas_price: Option<ResourcePrice>,
    #[serde(default)]
    pub l1_data_gas_price: Option<ResourcePrice>,
    pub transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockWithTxHashes {
    pub block_hash: Felt,
    pub parent_hash: Felt,
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub transactions: Vec<Felt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockWithReceipts {
    pub block_hash: Felt,
    pub parent_hash: Felt,
    pub block_number: u64,
    pub timestamp: u64,
    #[serde(default)]
    pub new_root: Option<Felt>,
    #[serde(default)]
    pub sequencer_address: Option<Felt>,
    #[serde(default)]
    pub starknet_version: Option<String>,
    #[serde(default)]
    pub status: Option<BlockStatus>,
    #[serde(default)]
    pub l1_da_mode: Option<L1DaMode>,
    #[serde(default)]
    pub l1_gas_price: Option<ResourcePrice>,
    #[serde(default)]
    pub l1_data_gas_price: Option<ResourcePrice>,
    pub transactions: Vec<RpcTransactionAndReceipt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransactionAndReceipt {
    pub transaction: RpcTransaction,
    pub receipt: RpcTransactionReceipt,
}

/// A transaction as the upstream encodes it, tagged on `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RpcTransaction {
    #[serde(rename = "INVOKE")]
    Invoke(RpcInvokeTransaction),
    #[serde(rename = "L1_HANDLER")]
    L1Handler(RpcL1HandlerTransaction),
    #[serde(rename = "DECLARE")]
    Declare(RpcDeclareTransaction),
    #[serde(rename = "DEPLOY")]
    Deploy(RpcDeployTransaction),
    #[serde(rename = "DEPLOY_ACCOUNT")]
    DeployAccount(RpcDeployAccountTransaction),
}

impl RpcTransaction {
    pub fn transaction_hash(&self) -> &Felt {
        match self {
            RpcTransaction::Invoke(tx) => &tx.transaction_hash,
            RpcTransaction::L1Handler(tx) => &tx.transaction_hash,
            RpcTransaction::Declare(tx) => &tx.transaction_hash,
            RpcTransaction::Deploy(tx) => &tx.transaction_hash,
            RpcTransaction::DeployAccount(tx) => &tx.transaction_hash,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcInvokeTransaction {
    pub transaction_hash: Felt,
    pub version: Felt,
    /// Absent on v0 invokes, which address a contract directly.
    #[serde(default)]
    pub sender_address: Option<Felt>,
    #[serde(default)]
    pub contract_address: Option<Felt>,
    #[serde(default)]
    pub calldata: Vec<Felt>,
    #[serde(default)]
    pub signature: Vec<Felt>,
    #[serde(default)]
    pub nonce: Option<Felt>,
    #[serde(default)]
    pub max_fee: Option<Felt>,
    #[serde(default)]
    pub resource_bounds: Option<ResourceBoundsMapping>,
    #[serde(default)]
    pub tip: Option<Felt>,
    #[serde(default)]
    pub paymaster_data: Option<Vec<Felt>>,
    #[serde(default)]
    pub account_deployment_data: Option<Vec<Felt>>,
    #[serde(default)]
    pub nonce_data_availability_mode: Option<String>,
    #[serde(default)]
    pub fee_data_availability_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcL1HandlerTransaction {
    pub transaction_hash: Felt,
    pub version: Felt,
    pub contract_address: Felt,
    pub entry_point_selector: Felt,
    #[serde(default)]
    pub calldata: Vec<Felt>,
    #[serde(default)]
    pub nonce: Option<Felt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcDeclareTransaction {
    pub transaction_hash: Felt,
    pub version: Felt,
    pub sender_address: Felt,
    pub class_hash: Felt,
    #[serde(default)]
    pub compiled_class_hash: Option<Felt>,
    #[serde(default)]
    pub signature: Vec<Felt>,
    #[serde(default)]
    pub nonce: Option<Felt>,
    #[serde(default)]
    pub max_fee: Option<Felt>,
    #[serde(default)]
    pub resource_bounds: Option<ResourceBoundsMapping>,
    #[serde(default)]
    pub tip: Option<Felt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcDeployTransaction {
    pub transaction_hash: Felt,
    pub version: Felt,
    pub class_hash: Felt,
    pub contract_address_salt: Felt,
    #[serde(default)]
    pub constructor_calldata: Vec<Felt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcDeployAccountTransaction {
    pub transaction_hash: Felt,
    pub version: Felt,
    pub class_hash: Felt,
    pub contract_address_salt: Felt,
    #[serde(default)]
    pub constructor_calldata: Vec<Felt>,
    #[serde(default)]
    pub signature: Vec<Felt>,
    #[serde(default)]
    pub nonce: Option<Felt>,
    #[serde(default)]
    pub max_fee: Option<Felt>,
    #[serde(default)]
    pub resource_bounds: Option<ResourceBoundsMapping>,
    #[serde(default)]
    pub tip: Option<Felt>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransactionReceipt {
    #[serde(rename = "type")]
    pub receipt_type: String,
    pub transaction_hash: Felt,
    #[serde(default)]
    pub actual_fee: Option<FeePayment>,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub finality_status: Option<String>,
    #[serde(default)]
    pub messages_sent: Vec<MessageToL1>,
    #[serde(default)]
    pub events: Vec<ReceiptEvent>,
    #[serde(default)]
    pub execution_resources: Option<ExecutionResources>,
    #[serde(default)]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub contract_address: Option<Felt>,
    #[serde(default)]
    pub message_hash: Option<Felt>,
    /// Present on standalone receipt fetches, absent inside
    /// `getBlockWithReceipts`.
    #[serde(default)]
    pub block_hash: Option<Felt>,
    #[serde(default)]
    pub block_number: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcEmittedEvent {
    pub from_address: Felt,
    #[serde(default)]
    pub keys: Vec<Felt>,
    #[serde(default)]
    pub data: Vec<Felt>,
    #[serde(default)]
    pub block_hash: Option<Felt>,
    #[serde(default)]
    pub block_number: Option<u64>,
    pub transaction_hash: Felt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcEventsPage {
    #[serde(default)]
    pub events: Vec<RpcEmittedEvent>,
    #[serde(default)]
    pub continuation_token: Option<String>,
}

/// Parameters for `starknet_getEvents`. Serialized under the `filter` key.
#[derive(Debug, Clone, Default)]
pub struct EventFilterParams {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub address: Option<Felt>,
    /// Positional key lists; an empty inner list matches any key.
    pub keys: Vec<Vec<Felt>>,
    pub chunk_size: u64,
    pub continuation_token: Option<String>,
}

impl EventFilterParams {
    pub fn to_value(&self) -> Value {
        let mut filter = serde_json::Map::new();
        if let Some(from) = self.from_block {
            filter.insert("from_block".to_string(), json!({ "block_number": from }));
        }
        if let Some(to) = self.to_block {
            filter.insert("to_block".to_string(), json!({ "block_number": to }));
        }
        if let Some(address) = &self.address {
            filter.insert("address".to_string(), json!(address));
        }
        if !self.keys.is_empty() {
            filter.insert("keys".to_string(), json!(self.keys));
        }
        filter.insert("chunk_size".to_string(), json!(self.chunk_size));
        if let Some(token) = &self.continuation_token {
            filter.insert("continuation_token".to_string(), json!(token));
        }
        json!({ "filter": Value::Object(filter) })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockTrace {
    pub transaction_hash: Felt,
    pub trace_root: RpcTransactionTrace,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcTransactionTrace {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub execute_invocation: Option<RpcExecuteInvocation>,
    #[serde(default)]
    pub constructor_invocation: Option<RpcFunctionInvocation>,
    #[serde(default)]
    pub function_invocation: Option<RpcFunctionInvocation>,
}

/// The execute invocation is either a call tree or a revert marker.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RpcExecuteInvocation {
    Success(RpcFunctionInvocation),
    Reverted(RpcRevertedInvocation),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRevertedInvocation {
    pub revert_reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcFunctionInvocation {
    pub contract_address: Felt,
    #[serde(default)]
    pub entry_point_selector: Option<Felt>,
    #[serde(default)]
    pub calldata: Vec<Felt>,
    #[serde(default)]
    pub caller_address: Option<Felt>,
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub result: Vec<Felt>,
    #[serde(default)]
    pub calls: Vec<RpcFunctionInvocation>,
}

/// New-head payload delivered by `starknet_subscribeNewHeads` or assembled
/// from polling.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlockHeader {
    pub block_hash: Felt,
    pub parent_hash: Felt,
    pub block_number: u64,
    pub timestamp: u64,
}

/// A read-only contract call for `starknet_call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub contract_address: Felt,
    pub entry_point_selector: Felt,
    #[serde(default)]
    pub calldata: Vec<Felt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_encodings() {
        assert_eq!(BlockId::Latest.to_value(), json!("latest"));
        assert_eq!(BlockId::Number(7).to_value(), json!({ "block_number": 7 }));
    }

    #[test]
    fn test_transaction_tag_parsing() {
        let raw = json!({
            "type": "INVOKE",
            "transaction_hash": "0x5",
            "version": "0x3",
            "sender_address": "0x7",
            "calldata": ["0x1"],
            "signature": [],
            "nonce": "0x0",
            "tip": "0x0"
        });
        let tx: RpcTransaction = serde_json::from_value(raw).unwrap();
        match tx {
            RpcTransaction::Invoke(invoke) => {
                assert_eq!(invoke.sender_address, Some(Felt::from(7u64)));
                assert_eq!(invoke.calldata, vec![Felt::ONE]);
            }
            other => panic!("expected invoke, got {other:?}"),
        }
    }

    #[test]
    fn test_event_filter_params_shape() {
        let params = EventFilterParams {
            from_block: Some(100),
            to_block: Some(200),
            address: Some(Felt::from(9u64)),
            keys: vec![vec![Felt::ONE], vec![]],
            chunk_size: 1000,
            continuation_token: None,
        };
        let value = params.to_value();
        assert_eq!(value["filter"]["from_block"]["block_number"], json!(100));
        assert_eq!(value["filter"]["chunk_size"], json!(1000));
        assert!(value["filter"].get("continuation_token").is_none());
    }

    #[test]
    fn test_reverted_execute_invocation_parses() {
        let raw = json!({ "revert_reason": "out of gas" });
        let invocation: RpcExecuteInvocation = serde_json::from_value(raw).unwrap();
        assert!(matches!(invocation, RpcExecuteInvocation::Reverted(_)));
    }
}
