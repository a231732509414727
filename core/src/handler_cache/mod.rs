//! Per-handler RPC cache with profile-driven predictive prefetch.
//!
//! Handlers overwhelmingly issue read-only calls pinned to the event's block,
//! and mostly the same calls shaped by the event's fields. Two mechanisms
//! exploit that: a deterministic response cache (memory, then the persisted
//! cache, then the network) and recorded profile patterns that let upcoming
//! events pull their expected responses in before the handler even runs.

mod profile;

pub use profile::{EventFieldPath, PatternValue, PredictedCall, ProfilePattern, ProfileStore};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use mini_moka::sync::Cache;
use serde_json::{json, Value};
use starknet_types_core::felt::Felt;
use tracing::debug;

use crate::event::Event;
use crate::metrics::{CacheHit, Metrics, NoopMetrics};
use crate::provider::{BlockId, CallRequest, ProviderError, RpcDispatcher};
use crate::store::SyncStore;

/// In-memory response cache capacity.
const MEMORY_CACHE_CAPACITY: u64 = 10_000;
/// Expected-value threshold above which persisted results are bulk-loaded.
const PREFETCH_DATABASE_THRESHOLD: f64 = 0.2;
/// Expected-value threshold above which the request is issued eagerly.
const PREFETCH_NETWORK_THRESHOLD: f64 = 0.8;
/// Retry budget for retryable read operations.
const READ_RETRIES: u32 = 9;
const READ_BACKOFF_BASE_MS: u64 = 125;

type PendingResult = Result<String, String>;
type PendingFuture = Shared<BoxFuture<'static, PendingResult>>;

pub struct HandlerRpcCache<S> {
    chain_id: u64,
    dispatcher: Arc<RpcDispatcher>,
    store: Arc<S>,
    disable_cache: bool,
    memory: Cache<String, String>,
    /// Keys whose memory entries came from the prefetch bulk-load, so the
    /// first lookup can be attributed to it.
    prefetched: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingFuture>>,
    profiles: Mutex<ProfileStore>,
    metrics: Arc<dyn Metrics>,
}

fn cache_key(method: &str, params: &Value) -> String {
    // Params are built by this module with a fixed field order, so the
    // serialized form is canonical.
    format!("{method}:{params}")
}

fn call_params(request: &CallRequest, block_id: &BlockId) -> Value {
    json!({ "request": request, "block_id": block_id.to_value() })
}

/// Empty arrays and nulls may be spurious provider answers; they are never
/// cached.
fn cacheable_value(value: &Value) -> bool {
    !value.is_null() && !value.as_array().is_some_and(|a| a.is_empty())
}

impl<S: SyncStore + 'static> HandlerRpcCache<S> {
    pub fn new(
        chain_id: u64,
        dispatcher: Arc<RpcDispatcher>,
        store: Arc<S>,
        disable_cache: bool,
    ) -> Self {
        Self::with_metrics(chain_id, dispatcher, store, disable_cache, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        chain_id: u64,
        dispatcher: Arc<RpcDispatcher>,
        store: Arc<S>,
        disable_cache: bool,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        HandlerRpcCache {
            chain_id,
            dispatcher,
            store,
            disable_cache,
            memory: Cache::builder().max_capacity(MEMORY_CACHE_CAPACITY).build(),
            prefetched: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            profiles: Mutex::new(ProfileStore::new()),
            metrics,
        }
    }

    /// Serve a read-only request: memory, then pending prefetch, then the
    /// persisted cache, then the network.
    pub async fn read(
        &self,
        method: &str,
        params: Value,
        block_number: Option<u64>,
    ) -> Result<Value, ProviderError> {
        if self.disable_cache {
            self.metrics.record_cache_access(self.chain_id, CacheHit::Network);
            return self.dispatcher.request(method, params).await;
        }

        let key = cache_key(method, &params);

        if let Some(cached) = self.memory.get(&key) {
            let hit = if self.prefetched.lock().unwrap().remove(&key) {
                CacheHit::PrefetchDatabase
            } else {
                CacheHit::Memory
            };
            self.metrics.record_cache_access(self.chain_id, hit);
            return Ok(serde_json::from_str(&cached)?);
        }

        let pending = self.pending.lock().unwrap().get(&key).cloned();
        if let Some(pending) = pending {
            if let Ok(cached) = pending.await {
                self.metrics.record_cache_access(self.chain_id, CacheHit::Memory);
                return Ok(serde_json::from_str(&cached)?);
            }
        }

        let persisted = self
            .store
            .get_rpc_request_results(self.chain_id, std::slice::from_ref(&key))
            .await
            .unwrap_or_default();
        if let Some(cached) = persisted.get(&key) {
            self.memory.insert(key, cached.clone());
            self.metrics.record_cache_access(self.chain_id, CacheHit::Database);
            return Ok(serde_json::from_str(cached)?);
        }

        let value: Value = self.dispatcher.request(method, params).await?;
        self.metrics.record_cache_access(self.chain_id, CacheHit::Network);

        if cacheable_value(&value) {
            let serialized = value.to_string();
            self.memory.insert(key.clone(), serialized.clone());

            // Fire-and-forget persistence; a write failure costs a refetch.
            let store = Arc::clone(&self.store);
            let chain_id = self.chain_id;
            tokio::spawn(async move {
                if let Err(e) =
                    store.insert_rpc_request_result(chain_id, &key, block_number, &serialized).await
                {
                    debug!(error = %e, "failed to persist rpc request result");
                }
            });
        }

        Ok(value)
    }

    /// Sample this call's shape into the profile store, 1 in 10.
    pub fn observe(&self, event: &Event, call: &CallRequest) {
        if !rand::random_ratio(1, 10) {
            return;
        }
        self.profiles.lock().unwrap().record(event.name(), event, call);
    }

    #[cfg(test)]
    fn observe_always(&self, event: &Event, call: &CallRequest) {
        self.profiles.lock().unwrap().record(event.name(), event, call);
    }

    /// Warm the cache for an upcoming batch: recover every known pattern
    /// against each event, bulk-load likely results from the persisted cache,
    /// and issue near-certain requests in the background.
    pub async fn prefetch(&self, events: &[Event]) {
        if self.disable_cache {
            return;
        }

        let mut database_keys: Vec<String> = Vec::new();
        let mut network_calls: Vec<(String, CallRequest, u64)> = Vec::new();
        {
            let profiles = self.profiles.lock().unwrap();
            for event in events {
                let Some(block_number) = event.block_number() else { continue };
                for predicted in profiles.predict(event) {
                    let block_id = BlockId::Number(block_number);
                    let key =
                        cache_key("starknet_call", &call_params(&predicted.call, &block_id));
                    if self.memory.get(&key).is_some() {
                        continue;
                    }
                    if predicted.weight > PREFETCH_DATABASE_THRESHOLD {
                        database_keys.push(key.clone());
                    }
                    if predicted.weight > PREFETCH_NETWORK_THRESHOLD {
                        network_calls.push((key, predicted.call, block_number));
                    }
                }
            }
        }

        if !database_keys.is_empty() {
            if let Ok(results) =
                self.store.get_rpc_request_results(self.chain_id, &database_keys).await
            {
                let mut prefetched = self.prefetched.lock().unwrap();
                for (key, value) in results {
                    self.memory.insert(key.clone(), value);
                    prefetched.insert(key);
                }
            }
        }

        for (key, call, block_number) in network_calls {
            if self.memory.get(&key).is_some()
                || self.pending.lock().unwrap().contains_key(&key)
            {
                continue;
            }

            let dispatcher = Arc::clone(&self.dispatcher);
            let memory = self.memory.clone();
            let result_key = key.clone();
            let future: BoxFuture<'static, PendingResult> = async move {
                let result = dispatcher
                    .call(&call, BlockId::Number(block_number))
                    .await
                    .map(|felts| json!(felts).to_string())
                    .map_err(|e| e.to_string());
                if let Ok(serialized) = &result {
                    // Same rule as the read path: empty results stay uncached.
                    if serialized != "[]" {
                        memory.insert(result_key, serialized.clone());
                    }
                }
                result
            }
            .boxed();
            let shared = future.shared();
            self.pending.lock().unwrap().insert(key, shared.clone());
            // Drive it eagerly; the handler's own read only awaits the result.
            tokio::spawn(shared);
        }
    }

    /// Drop bookkeeping between batches. Memory entries survive; pending
    /// futures that were never consumed are discarded.
    pub fn end_batch(&self) {
        self.pending.lock().unwrap().clear();
        self.prefetched.lock().unwrap().clear();
    }
}

/// Block pinning for scoped reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Pin block-scoped calls to the event's block.
    #[default]
    Default,
    /// The value never changes; read at `latest` so every event shares it.
    Immutable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Explicit block override.
    pub block: Option<BlockId>,
    pub cache: CacheMode,
    /// Retry transient empty responses and typed not-found errors.
    pub retry: bool,
}

/// The read-only client handed to a handler, scoped to one event.
///
/// Any operation whose semantics depend on a block silently substitutes the
/// event's block number unless the caller opts into `CacheMode::Immutable`
/// or passes an explicit block.
pub struct HandlerClient<S> {
    cache: Arc<HandlerRpcCache<S>>,
    event: Arc<Event>,
}

impl<S: SyncStore + 'static> HandlerClient<S> {
    pub fn new(cache: Arc<HandlerRpcCache<S>>, event: Arc<Event>) -> Self {
        HandlerClient { cache, event }
    }

    fn scope_block(&self, options: &ReadOptions) -> BlockId {
        if let Some(block) = options.block {
            return block;
        }
        match options.cache {
            CacheMode::Immutable => BlockId::Latest,
            CacheMode::Default => {
                self.event.block_number().map(BlockId::Number).unwrap_or(BlockId::Latest)
            }
        }
    }

    fn persist_block(&self, block_id: &BlockId) -> Option<u64> {
        match block_id {
            BlockId::Number(n) => Some(*n),
            _ => None,
        }
    }

    async fn read_with_retry(
        &self,
        method: &str,
        params: Value,
        block_number: Option<u64>,
        options: &ReadOptions,
    ) -> Result<Value, ProviderError> {
        let mut attempts = 0u32;
        loop {
            match self.cache.read(method, params.clone(), block_number).await {
                Ok(value) => {
                    let transient_empty =
                        value.is_null() || value.as_array().is_some_and(|a| a.is_empty());
                    if !options.retry || !transient_empty || attempts >= READ_RETRIES {
                        return Ok(value);
                    }
                }
                Err(e) => {
                    if !options.retry || !is_transient_not_found(&e) || attempts >= READ_RETRIES {
                        return Err(e);
                    }
                }
            }

            attempts += 1;
            tokio::time::sleep(Duration::from_millis(
                READ_BACKOFF_BASE_MS << (attempts - 1).min(16),
            ))
            .await;
        }
    }

    /// `starknet_call` against the event's block, observed for profiling.
    pub async fn read_contract(
        &self,
        request: &CallRequest,
        options: ReadOptions,
    ) -> Result<Vec<Felt>, ProviderError> {
        let block_id = self.scope_block(&options);
        self.cache.observe(&self.event, request);

        let value = self
            .read_with_retry(
                "starknet_call",
                call_params(request, &block_id),
                self.persist_block(&block_id),
                &options,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Alias for the standard method name.
    pub async fn call(
        &self,
        request: &CallRequest,
        options: ReadOptions,
    ) -> Result<Vec<Felt>, ProviderError> {
        self.read_contract(request, options).await
    }

    /// Batched variant of [`HandlerClient::read_contract`].
    pub async fn read_contracts(
        &self,
        requests: &[CallRequest],
        options: ReadOptions,
    ) -> Result<Vec<Vec<Felt>>, ProviderError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.read_contract(request, options).await?);
        }
        Ok(results)
    }

    pub async fn get_storage_at(
        &self,
        contract_address: &Felt,
        key: &Felt,
        options: ReadOptions,
    ) -> Result<Felt, ProviderError> {
        let block_id = self.scope_block(&options);
        let params = json!({
            "contract_address": contract_address,
            "key": key,
            "block_id": block_id.to_value(),
        });
        let value = self
            .read_with_retry("starknet_getStorageAt", params, self.persist_block(&block_id), &options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_nonce(
        &self,
        contract_address: &Felt,
        options: ReadOptions,
    ) -> Result<Felt, ProviderError> {
        let block_id = self.scope_block(&options);
        let params =
            json!({ "contract_address": contract_address, "block_id": block_id.to_value() });
        let value = self
            .read_with_retry("starknet_getNonce", params, self.persist_block(&block_id), &options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_class_hash_at(
        &self,
        contract_address: &Felt,
        options: ReadOptions,
    ) -> Result<Felt, ProviderError> {
        let block_id = self.scope_block(&options);
        let params =
            json!({ "contract_address": contract_address, "block_id": block_id.to_value() });
        let value = self
            .read_with_retry(
                "starknet_getClassHashAt",
                params,
                self.persist_block(&block_id),
                &options,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_class_at(
        &self,
        contract_address: &Felt,
        options: ReadOptions,
    ) -> Result<Value, ProviderError> {
        let block_id = self.scope_block(&options);
        let params =
            json!({ "contract_address": contract_address, "block_id": block_id.to_value() });
        self.read_with_retry("starknet_getClassAt", params, self.persist_block(&block_id), &options)
            .await
    }

    pub async fn get_block_with_txs(
        &self,
        options: ReadOptions,
    ) -> Result<crate::provider::RpcBlockWithTxs, ProviderError> {
        let block_id = self.scope_block(&options);
        let params = json!({ "block_id": block_id.to_value() });
        let value = self
            .read_with_retry(
                "starknet_getBlockWithTxs",
                params,
                self.persist_block(&block_id),
                &options,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_block_with_tx_hashes(
        &self,
        options: ReadOptions,
    ) -> Result<crate::provider::RpcBlockWithTxHashes, ProviderError> {
        let block_id = self.scope_block(&options);
        let params = json!({ "block_id": block_id.to_value() });
        let value = self
            .read_with_retry(
                "starknet_getBlockWithTxHashes",
                params,
                self.persist_block(&block_id),
                &options,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_transaction_by_hash(
        &self,
        transaction_hash: &Felt,
        options: ReadOptions,
    ) -> Result<crate::provider::RpcTransaction, ProviderError> {
        let params = json!({ "transaction_hash": transaction_hash });
        let value = self
            .read_with_retry("starknet_getTransactionByHash", params, None, &options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_transaction_receipt(
        &self,
        transaction_hash: &Felt,
        options: ReadOptions,
    ) -> Result<crate::provider::RpcTransactionReceipt, ProviderError> {
        let params = json!({ "transaction_hash": transaction_hash });
        let value = self
            .read_with_retry("starknet_getTransactionReceipt", params, None, &options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_events(
        &self,
        mut filter: crate::provider::EventFilterParams,
        options: ReadOptions,
    ) -> Result<crate::provider::RpcEventsPage, ProviderError> {
        // Block substitution: an unbounded filter is pinned to the event's
        // block rather than drifting with the chain head.
        if filter.from_block.is_none() && filter.to_block.is_none() {
            if let BlockId::Number(number) = self.scope_block(&options) {
                filter.from_block = Some(number);
                filter.to_block = Some(number);
            }
        }
        let value = self
            .read_with_retry("starknet_getEvents", filter.to_value(), filter.to_block, &options)
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn is_transient_not_found(error: &ProviderError) -> bool {
    match error {
        ProviderError::BlockNotFound => true,
        ProviderError::JsonRpc { code, message } => {
            // Chain-standard not-found codes, plus a safety net on wording.
            matches!(code, 20 | 24 | 25 | 29) || message.to_lowercase().contains("not found")
        }
        ProviderError::RetriesExhausted { last, .. } => is_transient_not_found(last),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_support::CountingMetrics;
    use crate::store::InMemorySyncStore;
    use crate::system_state::ShutdownSignal;
    use crate::types::checkpoint::CheckpointParts;
    use crate::types::{Block, BlockStatus, Checkpoint, EventKind, L1DaMode, Log, ResourcePrice};
    use std::sync::atomic::Ordering;

    fn log_event(key1: u64) -> Event {
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
            name: "Transfer".to_string(),
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

    fn balance_call(owner: u64) -> CallRequest {
        CallRequest {
            contract_address: Felt::from(0xe4c20_u64),
            entry_point_selector: crate::helpers::selector_from_name("balance_of"),
            calldata: vec![Felt::from(owner)],
        }
    }

    fn harness(
        server_url: String,
        metrics: Arc<CountingMetrics>,
    ) -> (Arc<HandlerRpcCache<InMemorySyncStore>>, Arc<InMemorySyncStore>) {
        let store = Arc::new(InMemorySyncStore::new());
        let dispatcher =
            Arc::new(RpcDispatcher::new(1, &[server_url], ShutdownSignal::never()).unwrap());
        let cache = Arc::new(HandlerRpcCache::with_metrics(
            1,
            dispatcher,
            Arc::clone(&store),
            false,
            metrics,
        ));
        (cache, store)
    }

    #[tokio::test]
    async fn test_null_and_empty_responses_are_not_cached() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": [] }).to_string())
            .expect(2)
            .create_async()
            .await;

        let metrics = Arc::new(CountingMetrics::default());
        let (cache, _store) = harness(server.url(), Arc::clone(&metrics));

        let params = json!({ "contract_address": "0x1" });
        let first = cache.read("starknet_call", params.clone(), Some(500)).await.unwrap();
        assert_eq!(first, json!([]));
        // Second read goes to the network again.
        cache.read("starknet_call", params, Some(500)).await.unwrap();
        assert_eq!(metrics.network_reads.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_memory_cache_serves_repeat_reads() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": ["0x5"] }).to_string())
            .expect(1)
            .create_async()
            .await;

        let metrics = Arc::new(CountingMetrics::default());
        let (cache, _store) = harness(server.url(), Arc::clone(&metrics));

        let params = json!({ "contract_address": "0x1" });
        cache.read("starknet_call", params.clone(), Some(500)).await.unwrap();
        let second = cache.read("starknet_call", params, Some(500)).await.unwrap();

        assert_eq!(second, json!(["0x5"]));
        assert_eq!(metrics.network_reads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_prefetch_bulk_loads_persisted_results() {
        // No network mock: the test fails loudly if the cache goes out.
        let server = mockito::Server::new_async().await;
        let metrics = Arc::new(CountingMetrics::default());
        let (cache, store) = harness(server.url(), Arc::clone(&metrics));

        // Teach the profile store the pattern balance_of(token, keys[1]).
        let sampled = log_event(0xaaaa);
        cache.observe_always(&sampled, &balance_call(0xaaaa));

        // Persist the result the upcoming event will ask for.
        let upcoming = log_event(0xbbbb);
        let block_id = BlockId::Number(500);
        let key = cache_key("starknet_call", &call_params(&balance_call(0xbbbb), &block_id));
        store.insert_rpc_request_result(1, &key, Some(500), "[\"0x64\"]").await.unwrap();

        cache.prefetch(std::slice::from_ref(&upcoming)).await;

        let client = HandlerClient::new(Arc::clone(&cache), Arc::new(upcoming));
        let result =
            client.read_contract(&balance_call(0xbbbb), ReadOptions::default()).await.unwrap();

        assert_eq!(result, vec![Felt::from(0x64_u64)]);
        assert_eq!(metrics.prefetch_database_hits.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.network_reads.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_transient_not_found_classification() {
        assert!(is_transient_not_found(&ProviderError::BlockNotFound));
        assert!(is_transient_not_found(&ProviderError::JsonRpc {
            code: 29,
            message: "Transaction hash not found".into()
        }));
        assert!(!is_transient_not_found(&ProviderError::Timeout));
    }
}
