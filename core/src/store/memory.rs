use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use starknet_types_core::felt::Felt;

use crate::filter::IntervalSet;
use crate::types::{Block, Log, Trace, Transaction, TransactionReceipt};

use super::{ChildAddressRow, StoreError, SyncStore};

#[derive(Debug, Default)]
struct Inner {
    blocks: HashMap<(u64, u64), Block>,
    transactions: HashMap<(u64, u64), Vec<Transaction>>,
    logs: Vec<(u64, Log)>,
    traces: HashMap<(u64, u64), Vec<Trace>>,
    receipts: HashMap<(u64, String), TransactionReceipt>,
    child_addresses: HashMap<(u64, String), HashMap<Felt, u64>>,
    intervals: HashMap<String, IntervalSet>,
    rpc_results: HashMap<(u64, String), (Option<u64>, String)>,
}

/// Reference implementation of the persistence port, used by the tests and
/// usable as a cache-less backend for short-lived runs.
#[derive(Debug, Default)]
pub struct InMemorySyncStore {
    inner: Mutex<Inner>,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        InMemorySyncStore::default()
    }

    pub fn block_count(&self, chain_id: u64) -> usize {
        self.inner.lock().unwrap().blocks.keys().filter(|(c, _)| *c == chain_id).count()
    }

    pub fn logs(&self, chain_id: u64) -> Vec<Log> {
        self.inner
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|(c, _)| *c == chain_id)
            .map(|(_, log)| log.clone())
            .collect()
    }

    pub fn receipts(&self, chain_id: u64) -> Vec<TransactionReceipt> {
        self.inner
            .lock()
            .unwrap()
            .receipts
            .iter()
            .filter(|((c, _), _)| *c == chain_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn traces(&self, chain_id: u64) -> Vec<Trace> {
        self.inner
            .lock()
            .unwrap()
            .traces
            .iter()
            .filter(|((c, _), _)| *c == chain_id)
            .flat_map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    async fn insert_blocks(&self, chain_id: u64, blocks: &[Block]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for block in blocks {
            inner.blocks.insert((chain_id, block.number), block.clone());
        }
        Ok(())
    }

    async fn insert_transactions(
        &self,
        chain_id: u64,
        block_number: u64,
        transactions: &[Transaction],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.transactions.entry((chain_id, block_number)).or_default();
        for tx in transactions {
            if !entry.iter().any(|existing| existing.hash() == tx.hash()) {
                entry.push(tx.clone());
            }
        }
        Ok(())
    }

    async fn insert_logs(&self, chain_id: u64, logs: &[Log]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for log in logs {
            let duplicate = inner.logs.iter().any(|(c, existing)| {
                *c == chain_id
                    && existing.block_number == log.block_number
                    && existing.transaction_hash == log.transaction_hash
                    && existing.log_index == log.log_index
            });
            if !duplicate {
                inner.logs.push((chain_id, log.clone()));
            }
        }
        Ok(())
    }

    async fn insert_traces(
        &self,
        chain_id: u64,
        block_number: u64,
        traces: &[Trace],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.traces.insert((chain_id, block_number), traces.to_vec());
        Ok(())
    }

    async fn insert_transaction_receipts(
        &self,
        chain_id: u64,
        receipts: &[TransactionReceipt],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for receipt in receipts {
            inner.receipts.insert(
                (chain_id, crate::helpers::padded_hex(&receipt.transaction_hash)),
                receipt.clone(),
            );
        }
        Ok(())
    }

    async fn insert_child_addresses(
        &self,
        chain_id: u64,
        rows: &[ChildAddressRow],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for row in rows {
            let entry =
                inner.child_addresses.entry((chain_id, row.factory_id.clone())).or_default();
            match entry.get(&row.address) {
                Some(&existing) if existing <= row.first_seen_block_number => {}
                _ => {
                    entry.insert(row.address, row.first_seen_block_number);
                }
            }
        }
        Ok(())
    }

    async fn get_child_addresses(
        &self,
        chain_id: u64,
        factory_id: &str,
    ) -> Result<HashMap<Felt, u64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .child_addresses
            .get(&(chain_id, factory_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_intervals(
        &self,
        fragment_ids: &[String],
        interval: (u64, u64),
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for fragment_id in fragment_ids {
            inner.intervals.entry(fragment_id.clone()).or_default().insert(interval);
        }
        Ok(())
    }

    async fn get_intervals(&self, fragment_id: &str) -> Result<IntervalSet, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.intervals.get(fragment_id).cloned().unwrap_or_default())
    }

    async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        cache_key: &str,
        block_number: Option<u64>,
        result: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .rpc_results
            .insert((chain_id, cache_key.to_string()), (block_number, result.to_string()));
        Ok(())
    }

    async fn get_rpc_request_results(
        &self,
        chain_id: u64,
        cache_keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(cache_keys
            .iter()
            .filter_map(|key| {
                inner
                    .rpc_results
                    .get(&(chain_id, key.clone()))
                    .map(|(_, result)| (key.clone(), result.clone()))
            })
            .collect())
    }

    async fn revert_above(&self, chain_id: u64, block_number: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.retain(|(c, n), _| *c != chain_id || *n <= block_number);
        inner.transactions.retain(|(c, n), _| *c != chain_id || *n <= block_number);
        inner.traces.retain(|(c, n), _| *c != chain_id || *n <= block_number);
        inner.logs.retain(|(c, log)| *c != chain_id || log.block_number <= block_number);
        inner
            .receipts
            .retain(|(c, _), receipt| *c != chain_id || receipt.block_number <= block_number);
        for children in inner.child_addresses.iter_mut().filter_map(|((c, _), children)| {
            (*c == chain_id).then_some(children)
        }) {
            children.retain(|_, first_seen| *first_seen <= block_number);
        }
        inner
            .rpc_results
            .retain(|(c, _), (n, _)| *c != chain_id || n.is_none_or(|n| n <= block_number));
        Ok(())
    }
}
