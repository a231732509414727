mod memory;

pub use memory::InMemorySyncStore;

use std::collections::HashMap;

use async_trait::async_trait;
use starknet_types_core::felt::Felt;
use thiserror::Error;

use crate::filter::IntervalSet;
use crate::types::{Block, Log, Trace, Transaction, TransactionReceipt};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A child address discovery ready for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildAddressRow {
    pub factory_id: String,
    pub address: Felt,
    pub first_seen_block_number: u64,
}

/// Persistence port the sync engines write through.
///
/// Implementations are externally transactional: all multi-record insertions
/// for one block are expected to land atomically. The engines never assume
/// more than that.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn insert_blocks(&self, chain_id: u64, blocks: &[Block]) -> Result<(), StoreError>;

    async fn insert_transactions(
        &self,
        chain_id: u64,
        block_number: u64,
        transactions: &[Transaction],
    ) -> Result<(), StoreError>;

    async fn insert_logs(&self, chain_id: u64, logs: &[Log]) -> Result<(), StoreError>;

    async fn insert_traces(
        &self,
        chain_id: u64,
        block_number: u64,
        traces: &[Trace],
    ) -> Result<(), StoreError>;

    async fn insert_transaction_receipts(
        &self,
        chain_id: u64,
        receipts: &[TransactionReceipt],
    ) -> Result<(), StoreError>;

    /// Upsert-min on `first_seen_block_number`.
    async fn insert_child_addresses(
        &self,
        chain_id: u64,
        rows: &[ChildAddressRow],
    ) -> Result<(), StoreError>;

    async fn get_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
    ) -> Result<HashMap<Felt, u64>, StoreError>;

    /// Record `[lo, hi]` as completed for each fragment.
    async fn insert_intervals(
        &self,
        fragment_ids: &[String],
        interval: (u64, u64),
    ) -> Result<(), StoreError>;

    async fn get_intervals(&self, fragment_id: &str) -> Result<IntervalSet, StoreError>;

    /// Handler RPC cache. Values are the stringified JSON responses.
    async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        cache_key: &str,
        block_number: Option<u64>,
        result: &str,
    ) -> Result<(), StoreError>;

    async fn get_rpc_request_results(
        &self,
        chain_id: u64,
        cache_keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError>;

    /// Delete every record above `block_number` for the chain. Invoked when a
    /// reorg invalidates the unfinalized suffix.
    async fn revert_above(&self, chain_id: u64, block_number: u64) -> Result<(), StoreError>;
}
