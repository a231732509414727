use serde::{Deserialize, Serialize};
use starknet_types_core::felt::Felt;

/// Canonical block record after normalization.
///
/// For any two blocks with equal `number`, the later-observed one replaces the
/// earlier in the unfinalized chain; at or below the finalized head the hash
/// is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: Felt,
    pub number: u64,
    pub parent_hash: Felt,
    pub timestamp: u64,
    pub new_root: Felt,
    pub sequencer_address: Felt,
    pub starknet_version: String,
    pub status: BlockStatus,
    pub l1_da_mode: L1DaMode,
    pub l1_gas_price: ResourcePrice,
    pub l1_data_gas_price: ResourcePrice,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    #[serde(rename = "ACCEPTED_ON_L1")]
    AcceptedOnL1,
    #[serde(rename = "ACCEPTED_ON_L2")]
    AcceptedOnL2,
    #[serde(rename = "PENDING")]
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum L1DaMode {
    #[serde(rename = "BLOB")]
    Blob,
    #[serde(rename = "CALLDATA")]
    Calldata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePrice {
    pub price_in_fri: Felt,
    pub price_in_wei: Felt,
}

/// Reduced block form kept in the realtime unfinalized chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    pub hash: Felt,
    pub parent_hash: Felt,
    pub number: u64,
    pub timestamp: u64,
}

impl From<&Block> for LightBlock {
    fn from(block: &Block) -> Self {
        LightBlock {
            hash: block.hash,
            parent_hash: block.parent_hash,
            number: block.number,
            timestamp: block.timestamp,
        }
    }
}

/// A transaction as stored, tagged on its wire `type`.
///
/// `transaction_index` always equals the transaction's position inside its
/// block, and `hash` is unique within a block; both are enforced by the
/// normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Transaction {
    #[serde(rename = "INVOKE")]
    Invoke(InvokeTransaction),
    #[serde(rename = "L1_HANDLER")]
    L1Handler(L1HandlerTransaction),
    #[serde(rename = "DECLARE")]
    Declare(DeclareTransaction),
    #[serde(rename = "DEPLOY")]
    Deploy(DeployTransaction),
    #[serde(rename = "DEPLOY_ACCOUNT")]
    DeployAccount(DeployAccountTransaction),
}

impl Transaction {
    pub fn hash(&self) -> &Felt {
        match self {
            Transaction::Invoke(tx) => &tx.hash,
            Transaction::L1Handler(tx) => &tx.hash,
            Transaction::Declare(tx) => &tx.hash,
            Transaction::Deploy(tx) => &tx.hash,
            Transaction::DeployAccount(tx) => &tx.hash,
        }
    }

    pub fn transaction_index(&self) -> u32 {
        match self {
            Transaction::Invoke(tx) => tx.transaction_index,
            Transaction::L1Handler(tx) => tx.transaction_index,
            Transaction::Declare(tx) => tx.transaction_index,
            Transaction::Deploy(tx) => tx.transaction_index,
            Transaction::DeployAccount(tx) => tx.transaction_index,
        }
    }

    pub fn set_transaction_index(&mut self, index: u32) {
        match self {
            Transaction::Invoke(tx) => tx.transaction_index = index,
            Transaction::L1Handler(tx) => tx.transaction_index = index,
            Transaction::Declare(tx) => tx.transaction_index = index,
            Transaction::Deploy(tx) => tx.transaction_index = index,
            Transaction::DeployAccount(tx) => tx.transaction_index = index,
        }
    }

    pub fn version(&self) -> &Felt {
        match self {
            Transaction::Invoke(tx) => &tx.version,
            Transaction::L1Handler(tx) => &tx.version,
            Transaction::Declare(tx) => &tx.version,
            Transaction::Deploy(tx) => &tx.version,
            Transaction::DeployAccount(tx) => &tx.version,
        }
    }

    /// The account that signed the transaction. Only INVOKE and DECLARE
    /// carry one; the chain has no `to` field at all.
    pub fn sender_address(&self) -> Option<&Felt> {
        match self {
            Transaction::Invoke(tx) => Some(&tx.sender_address),
            Transaction::Declare(tx) => Some(&tx.sender_address),
            _ => None,
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Transaction::Invoke(_) => "INVOKE",
            Transaction::L1Handler(_) => "L1_HANDLER",
            Transaction::Declare(_) => "DECLARE",
            Transaction::Deploy(_) => "DEPLOY",
            Transaction::DeployAccount(_) => "DEPLOY_ACCOUNT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeTransaction {
    pub hash: Felt,
    #[serde(default)]
    pub transaction_index: u32,
    pub version: Felt,
    pub sender_address: Felt,
    pub calldata: Vec<Felt>,
    pub signature: Vec<Felt>,
    pub nonce: Option<Felt>,
    pub resource_bounds: Option<ResourceBoundsMapping>,
    pub tip: Option<Felt>,
    pub paymaster_data: Option<Vec<Felt>>,
    pub account_deployment_data: Option<Vec<Felt>>,
    pub nonce_data_availability_mode: Option<String>,
    pub fee_data_availability_mode: Option<String>,
    pub max_fee: Option<Felt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1HandlerTransaction {
    pub hash: Felt,
    #[serde(default)]
    pub transaction_index: u32,
    pub version: Felt,
    pub contract_address: Felt,
    pub entry_point_selector: Felt,
    pub calldata: Vec<Felt>,
    pub nonce: Option<Felt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareTransaction {
    pub hash: Felt,
    #[serde(default)]
    pub transaction_index: u32,
    pub version: Felt,
    pub sender_address: Felt,
    pub class_hash: Felt,
    pub compiled_class_hash: Option<Felt>,
    pub signature: Vec<Felt>,
    pub nonce: Option<Felt>,
    pub resource_bounds: Option<ResourceBoundsMapping>,
    pub tip: Option<Felt>,
    pub max_fee: Option<Felt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTransaction {
    pub hash: Felt,
    #[serde(default)]
    pub transaction_index: u32,
    pub version: Felt,
    pub class_hash: Felt,
    pub contract_address_salt: Felt,
    pub constructor_calldata: Vec<Felt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAccountTransaction {
    pub hash: Felt,
    #[serde(default)]
    pub transaction_index: u32,
    pub version: Felt,
    pub class_hash: Felt,
    pub contract_address_salt: Felt,
    pub constructor_calldata: Vec<Felt>,
    pub signature: Vec<Felt>,
    pub nonce: Option<Felt>,
    pub resource_bounds: Option<ResourceBoundsMapping>,
    pub tip: Option<Felt>,
    pub max_fee: Option<Felt>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBoundsMapping {
    pub l1_gas: ResourceBounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l1_data_gas: Option<ResourceBounds>,
    pub l2_gas: ResourceBounds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBounds {
    pub max_amount: Felt,
    pub max_price_per_unit: Felt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: Felt,
    pub block_hash: Felt,
    pub block_number: u64,
    pub transaction_index: u32,
    pub actual_fee: FeePayment,
    pub execution_status: ExecutionStatus,
    pub finality_status: String,
    pub messages_sent: Vec<MessageToL1>,
    pub events: Vec<ReceiptEvent>,
    pub execution_resources: ExecutionResources,
    pub revert_reason: Option<String>,
    /// Mirrors the transaction type tag.
    pub receipt_type: String,
    /// Present on DEPLOY / DEPLOY_ACCOUNT receipts.
    pub contract_address: Option<Felt>,
    /// Present on L1_HANDLER receipts.
    pub message_hash: Option<Felt>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePayment {
    pub amount: Felt,
    pub unit: FeeUnit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeUnit {
    #[serde(rename = "WEI")]
    Wei,
    #[default]
    #[serde(rename = "FRI")]
    Fri,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "REVERTED")]
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageToL1 {
    pub from_address: Felt,
    pub to_address: Felt,
    pub payload: Vec<Felt>,
}

/// An event exactly as it appears inside a receipt, before log assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    pub from_address: Felt,
    pub keys: Vec<Felt>,
    pub data: Vec<Felt>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResources {
    pub l1_gas: u64,
    pub l1_data_gas: u64,
    pub l2_gas: u64,
}

/// A contract event bound to its position in the chain.
///
/// The upstream RPC returns neither `log_index` nor a reliable
/// `transaction_index`; the normalizer assigns the former densely per block
/// and repairs the latter by transaction-hash lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Felt,
    pub block_hash: Felt,
    pub block_number: u64,
    pub transaction_hash: Felt,
    pub transaction_index: u32,
    pub log_index: u32,
    /// `keys[0]` is the event selector; the rest are indexed parameters.
    pub keys: Vec<Felt>,
    pub data: Vec<Felt>,
    pub removed: bool,
}

impl Log {
    pub fn selector(&self) -> Option<&Felt> {
        self.keys.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "LIBRARY_CALL")]
    LibraryCall,
    #[serde(rename = "DELEGATE")]
    Delegate,
    #[serde(rename = "CONSTRUCTOR")]
    Constructor,
}

/// A flattened call frame from block tracing. Best-effort: providers without
/// trace support yield none at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub transaction_hash: Felt,
    pub trace_index: u32,
    pub kind: CallKind,
    pub from: Felt,
    pub to: Option<Felt>,
    pub input: Vec<Felt>,
    pub output: Option<Vec<Felt>>,
    pub value: Option<Felt>,
    pub error: Option<String>,
    pub subcalls: u32,
}

impl Trace {
    /// Recipient of a value-bearing call. Token-transfer-shaped calls carry
    /// the recipient as the first calldata element after the selector;
    /// anything else falls back to the called contract.
    pub fn transfer_recipient(&self) -> Option<&Felt> {
        if self.value.is_some() && self.input.len() >= 2 {
            self.input.get(1)
        } else {
            self.to.as_ref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoke(hash: u64) -> Transaction {
        Transaction::Invoke(InvokeTransaction {
            hash: Felt::from(hash),
            transaction_index: 0,
            version: Felt::THREE,
            sender_address: Felt::from(7u64),
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
    }

    #[test]
    fn test_transaction_tag_round_trip() {
        let tx = invoke(5);
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("\"type\":\"INVOKE\""));
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }

    #[test]
    fn test_sender_address_only_on_invoke_and_declare() {
        let tx = invoke(1);
        assert_eq!(tx.sender_address(), Some(&Felt::from(7u64)));

        let l1 = Transaction::L1Handler(L1HandlerTransaction {
            hash: Felt::ONE,
            transaction_index: 0,
            version: Felt::ZERO,
            contract_address: Felt::TWO,
            entry_point_selector: Felt::THREE,
            calldata: vec![],
            nonce: None,
        });
        assert!(l1.sender_address().is_none());
    }
}
