//! Range-chunked backfill.
//!
//! For a requested interval and the declared sources, fetch the minimal set
//! of raw records, persist them, and record which fragments became complete.
//! Completed intervals are diffed on every call, so replaying an interval
//! that is already synced performs zero RPC work.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use starknet_types_core::felt::Felt;
use tracing::{debug, warn};

use crate::event::BlockData;
use crate::filter::{ChildAddresses, Factory, Filter, Fragment, IntervalSet, LogAddressPart};
use crate::helpers::halved_block_number;
use crate::manifest::Source;
use crate::normalize::{normalize_block, normalize_logs, normalize_receipts, normalize_traces};
use crate::provider::jsonrpc::{EventFilterParams, RpcEmittedEvent};
use crate::provider::{BlockId, ProviderError, RpcDispatcher};
use crate::store::{ChildAddressRow, SyncStore};
use crate::system_state::ShutdownSignal;
use crate::types::{Block, Log, Trace, TransactionReceipt};

use super::{SyncError, TraceSupport};

/// Initial block window for event fetches.
const INITIAL_ESTIMATED_RANGE: u64 = 2_000;
/// Growth applied to the estimate after each successful unconfirmed window.
const RANGE_GROWTH_NUMERATOR: u64 = 105;
/// `starknet_getEvents` page size.
const EVENTS_CHUNK_SIZE: u64 = 1_000;
/// Above this many concrete addresses, fetch match-any and filter
/// client-side instead of issuing one request per address.
const ADDRESS_LIST_THRESHOLD: usize = 25;
/// Concurrent block fetches for block-materializing filters.
const BLOCK_FETCH_CONCURRENCY: usize = 10;

/// What one `sync` call produced: the cursor position and the per-block data
/// ready for event assembly.
#[derive(Debug, Default)]
pub struct HistoricalSyncOutcome {
    /// Newest block observed, for the caller to advance its cursor.
    pub newest: Option<u64>,
    /// Matched records grouped per block, ascending by block number.
    pub data: Vec<BlockData>,
}

pub struct HistoricalSync<S> {
    chain_id: u64,
    dispatcher: Arc<RpcDispatcher>,
    store: Arc<S>,
    sources: Vec<Source>,
    factories: Vec<Factory>,
    children: Arc<RwLock<ChildAddresses>>,
    trace_support: Arc<TraceSupport>,
    shutdown: ShutdownSignal,

    /// Current block window estimate for event fetches.
    estimated_range: u64,
    /// Range width the provider confirmed; growth stops while this holds.
    confirmed_range: Option<u64>,
    /// Sticky switch to per-transaction receipt fetches after the combined
    /// call failed once.
    receipts_fallback: bool,

    // Per-call state, cleared at the end of each `sync`.
    block_cache: HashMap<u64, Arc<Block>>,
    receipt_cache: HashMap<Felt, TransactionReceipt>,
    collected: HashMap<u64, BlockData>,
}

impl<S: SyncStore> HistoricalSync<S> {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        chain_id: u64,
        dispatcher: Arc<RpcDispatcher>,
        store: Arc<S>,
        sources: Vec<Source>,
        factories: Vec<Factory>,
        children: Arc<RwLock<ChildAddresses>>,
        trace_support: Arc<TraceSupport>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, SyncError> {
        for factory in &factories {
            let persisted = store.get_child_addresses(chain_id, &factory.id).await?;
            children.write().unwrap().extend(&factory.id, persisted);
        }

        Ok(HistoricalSync {
            chain_id,
            dispatcher,
            store,
            sources,
            factories,
            children,
            trace_support,
            shutdown,
            estimated_range: INITIAL_ESTIMATED_RANGE,
            confirmed_range: None,
            receipts_fallback: false,
            block_cache: HashMap::new(),
            receipt_cache: HashMap::new(),
            collected: HashMap::new(),
        })
    }

    pub fn children(&self) -> Arc<RwLock<ChildAddresses>> {
        Arc::clone(&self.children)
    }

    /// Sync `[lo, hi]` for every source.
    pub async fn sync(&mut self, interval: (u64, u64)) -> Result<HistoricalSyncOutcome, SyncError> {
        let mut newest: Option<u64> = None;

        // Factories first: downstream filters can only match child addresses
        // that are already discovered for this interval.
        let factories = self.factories.clone();
        for factory in &factories {
            if factory.chain_id != self.chain_id {
                continue;
            }
            if let Some(block) = self.sync_factory(factory, interval).await? {
                newest = newest.max(Some(block));
            }
        }

        let sources = self.sources.clone();
        for source in &sources {
            if source.filter.chain_id() != self.chain_id {
                continue;
            }
            if let Some(block) = self.sync_source(source, interval).await? {
                newest = newest.max(Some(block));
            }
        }

        let mut data: Vec<BlockData> = self.collected.drain().map(|(_, d)| d).collect();
        data.sort_unstable_by_key(|d| d.block.number);

        self.block_cache.clear();
        self.receipt_cache.clear();
        Ok(HistoricalSyncOutcome { newest, data })
    }

    fn check_shutdown(&self) -> Result<(), SyncError> {
        if self.shutdown.is_shutdown() {
            return Err(SyncError::Shutdown);
        }
        Ok(())
    }

    // Collection of per-block data for event assembly. Fragments overlap, so
    // every append deduplicates on the record's natural key.

    fn collected_entry(&mut self, block: &Arc<Block>) -> &mut BlockData {
        self.collected.entry(block.number).or_insert_with(|| BlockData {
            block: Arc::clone(block),
            logs: vec![],
            receipts: vec![],
            traces: vec![],
        })
    }

    fn collect_logs(&mut self, block: &Arc<Block>, logs: &[Log]) {
        let entry = self.collected_entry(block);
        for log in logs {
            let duplicate = entry.logs.iter().any(|existing| {
                existing.transaction_hash == log.transaction_hash
                    && existing.log_index == log.log_index
            });
            if !duplicate {
                entry.logs.push(log.clone());
            }
        }
    }

    fn collect_receipts(&mut self, block: &Arc<Block>, receipts: &[TransactionReceipt]) {
        let entry = self.collected_entry(block);
        for receipt in receipts {
            if !entry.receipts.iter().any(|r| r.transaction_hash == receipt.transaction_hash) {
                entry.receipts.push(receipt.clone());
            }
        }
    }

    fn collect_traces(&mut self, block: &Arc<Block>, traces: &[Trace]) {
        let entry = self.collected_entry(block);
        for trace in traces {
            if !entry.traces.iter().any(|t| t.trace_index == trace.trace_index) {
                entry.traces.push(trace.clone());
            }
        }
    }

    /// Intersection of the requested interval with a filter's own range and
    /// the ranges of any factories it references.
    fn working_interval(&self, filter: &Filter, requested: (u64, u64)) -> IntervalSet {
        let mut working = IntervalSet::from_interval(requested);

        let filter_range =
            (filter.from_block().unwrap_or(0), filter.to_block().unwrap_or(u64::MAX));
        working = working.intersect(&IntervalSet::from_interval(filter_range));

        for factory_id in filter.referenced_factories() {
            if let Some(factory) = self.factories.iter().find(|f| f.id == factory_id) {
                let factory_range =
                    (factory.from_block.unwrap_or(0), factory.to_block.unwrap_or(u64::MAX));
                working = working.intersect(&IntervalSet::from_interval(factory_range));
            }
        }
        working
    }

    async fn missing_for_fragment(
        &self,
        fragment: &Fragment,
        working: &IntervalSet,
    ) -> Result<IntervalSet, SyncError> {
        let completed = self.store.get_intervals(&fragment.id).await?;
        Ok(working.difference(&completed))
    }

    async fn sync_factory(
        &mut self,
        factory: &Factory,
        requested: (u64, u64),
    ) -> Result<Option<u64>, SyncError> {
        let working = IntervalSet::from_interval(requested).intersect(
            &IntervalSet::from_interval((
                factory.from_block.unwrap_or(0),
                factory.to_block.unwrap_or(u64::MAX),
            )),
        );

        let fragment = Fragment::log(
            self.chain_id,
            LogAddressPart::Address(factory.address),
            Some(factory.event_selector),
        );
        let missing = self.missing_for_fragment(&fragment, &working).await?;
        if missing.is_empty() {
            return Ok(None);
        }

        let mut newest = None;
        for (lo, hi) in missing.iter().collect::<Vec<_>>() {
            let events = self
                .fetch_events_adaptive(
                    Some(factory.address),
                    vec![vec![factory.event_selector]],
                    (lo, hi),
                )
                .await?;

            let mut rows = Vec::new();
            for (block_number, block_events) in group_by_block(events, lo, hi) {
                let block = self.get_block(block_number).await?;
                let logs = normalize_logs(&block, &block_events)?;

                let mut children = self.children.write().unwrap();
                for log in &logs {
                    if !factory.matches_log(log) {
                        continue;
                    }
                    let Some(address) = factory.extract_child_address(log) else {
                        warn!(
                            factory = factory.id,
                            block_number,
                            "factory log is missing its child address location"
                        );
                        continue;
                    };
                    if children.insert_min(&factory.id, address, block_number) {
                        rows.push(ChildAddressRow {
                            factory_id: factory.id.clone(),
                            address,
                            first_seen_block_number: block_number,
                        });
                    }
                }
                drop(children);
                newest = newest.max(Some(block_number));
            }

            if !rows.is_empty() {
                debug!(
                    factory = factory.id,
                    discovered = rows.len(),
                    from = lo,
                    to = hi,
                    "discovered factory child addresses"
                );
                self.store.insert_child_addresses(self.chain_id, &rows).await?;
            }
            self.store.insert_intervals(&[fragment.id.clone()], (lo, hi)).await?;
            newest = newest.max(Some(hi));
        }
        Ok(newest)
    }

    async fn sync_source(
        &mut self,
        source: &Source,
        requested: (u64, u64),
    ) -> Result<Option<u64>, SyncError> {
        let working = self.working_interval(&source.filter, requested);
        if working.is_empty() {
            return Ok(None);
        }

        let mut newest = None;
        for fragment in source.filter.fragments() {
            let missing = self.missing_for_fragment(&fragment, &working).await?;
            if missing.is_empty() {
                continue;
            }

            for (lo, hi) in missing.iter().collect::<Vec<_>>() {
                self.check_shutdown()?;
                let synced = match &source.filter {
                    Filter::Log(filter) => {
                        self.sync_log_fragment(filter, &fragment, (lo, hi)).await?
                    }
                    Filter::Block(filter) => self.sync_block_fragment(filter, (lo, hi)).await?,
                    Filter::Transaction(_) | Filter::Trace(_) | Filter::Transfer(_) => {
                        self.sync_block_scan_fragment(source, (lo, hi)).await?
                    }
                };
                // Only successful completion records the interval; errors
                // above bail out and the work repeats next call.
                self.store.insert_intervals(&[fragment.id.clone()], (lo, hi)).await?;
                newest = newest.max(synced).max(Some(hi));
            }
        }
        Ok(newest)
    }

    async fn sync_log_fragment(
        &mut self,
        filter: &crate::filter::LogFilter,
        fragment: &Fragment,
        (lo, hi): (u64, u64),
    ) -> Result<Option<u64>, SyncError> {
        // Concrete addresses this fetch covers. Factory fragments expand to
        // their discovered children, falling back to match-any above the
        // threshold (the events are filtered client-side either way).
        let addresses: Vec<Option<Felt>> = if let Some(factory_id) = &fragment.factory_id {
            let children = self.children.read().unwrap().addresses(factory_id);
            if children.is_empty() {
                // Nothing discovered yet, nothing can match.
                return Ok(None);
            } else if children.len() > ADDRESS_LIST_THRESHOLD {
                vec![None]
            } else {
                children.into_iter().map(Some).collect()
            }
        } else {
            vec![fragment.address]
        };

        let mut keys: Vec<Vec<Felt>> = Vec::new();
        keys.push(fragment.topic0.map(|t| vec![t]).unwrap_or_default());
        for topic in &filter.topics[1..] {
            keys.push(topic.clone().unwrap_or_default());
        }
        while keys.last().is_some_and(|k| k.is_empty()) {
            keys.pop();
        }

        let mut newest = None;
        for address in addresses {
            let events = self.fetch_events_adaptive(address, keys.clone(), (lo, hi)).await?;
            for (block_number, block_events) in group_by_block(events, lo, hi) {
                let block = self.get_block(block_number).await?;
                let logs = normalize_logs(&block, &block_events)?;
                let matched: Vec<Log> = {
                    let children = self.children.read().unwrap();
                    logs.into_iter().filter(|log| filter.matches(log, &children)).collect()
                };
                if matched.is_empty() {
                    continue;
                }
                self.persist_matched_logs(filter, &block, matched).await?;
                newest = newest.max(Some(block_number));
            }
        }
        Ok(newest)
    }

    async fn persist_matched_logs(
        &mut self,
        filter: &crate::filter::LogFilter,
        block: &Arc<Block>,
        logs: Vec<Log>,
    ) -> Result<(), SyncError> {
        let tx_hashes: HashSet<Felt> = logs
            .iter()
            .filter(|log| log.transaction_hash != Felt::ZERO)
            .map(|log| log.transaction_hash)
            .collect();

        self.store.insert_blocks(self.chain_id, &[(**block).clone()]).await?;

        let referenced: Vec<_> = block
            .transactions
            .iter()
            .filter(|tx| tx_hashes.contains(tx.hash()))
            .cloned()
            .collect();
        if !referenced.is_empty() {
            self.store.insert_transactions(self.chain_id, block.number, &referenced).await?;
        }

        if filter.has_transaction_receipt && !tx_hashes.is_empty() {
            let receipts = self.fetch_receipts(block, &tx_hashes).await?;
            self.store.insert_transaction_receipts(self.chain_id, &receipts).await?;
            self.collect_receipts(block, &receipts);
        }

        self.store.insert_logs(self.chain_id, &logs).await?;
        self.collect_logs(block, &logs);
        Ok(())
    }

    async fn sync_block_fragment(
        &mut self,
        filter: &crate::filter::BlockFilter,
        (lo, hi): (u64, u64),
    ) -> Result<Option<u64>, SyncError> {
        let numbers = filter.block_numbers((lo, hi));
        let mut newest = None;

        for chunk in numbers.chunks(BLOCK_FETCH_CONCURRENCY) {
            self.check_shutdown()?;
            let blocks = self.get_blocks(chunk).await?;
            self.store
                .insert_blocks(
                    self.chain_id,
                    &blocks.iter().map(|b| (**b).clone()).collect::<Vec<_>>(),
                )
                .await?;
            for block in &blocks {
                self.collected_entry(block);
            }
            newest = newest.max(chunk.last().copied());
        }
        Ok(newest)
    }

    /// Transaction, trace and transfer filters need every block in range:
    /// the predicate can only be evaluated against the block's own contents.
    async fn sync_block_scan_fragment(
        &mut self,
        source: &Source,
        (lo, hi): (u64, u64),
    ) -> Result<Option<u64>, SyncError> {
        let needs_traces = matches!(source.filter, Filter::Trace(_) | Filter::Transfer(_));
        let traces_supported = needs_traces && self.trace_support.supported(&self.dispatcher).await;

        let mut newest = None;
        let numbers: Vec<u64> = (lo..=hi).collect();
        for chunk in numbers.chunks(BLOCK_FETCH_CONCURRENCY) {
            self.check_shutdown()?;
            let blocks = self.get_blocks(chunk).await?;

            for block in blocks {
                let traces =
                    if traces_supported { self.fetch_traces(&block).await? } else { Vec::new() };

                let mut matched_tx_hashes: HashSet<Felt> = HashSet::new();
                let mut matched_traces = Vec::new();
                {
                    let children = self.children.read().unwrap();
                    match &source.filter {
                        Filter::Transaction(filter) => {
                            for tx in &block.transactions {
                                if filter.matches(tx, block.number, &children) {
                                    matched_tx_hashes.insert(*tx.hash());
                                }
                            }
                        }
                        Filter::Trace(filter) => {
                            for trace in &traces {
                                if filter.matches(trace, block.number, &children) {
                                    matched_tx_hashes.insert(trace.transaction_hash);
                                    matched_traces.push(trace.clone());
                                }
                            }
                        }
                        Filter::Transfer(filter) => {
                            for trace in &traces {
                                if filter.matches(trace, block.number) {
                                    matched_tx_hashes.insert(trace.transaction_hash);
                                    matched_traces.push(trace.clone());
                                }
                            }
                        }
                        _ => {}
                    }
                }

                if matched_tx_hashes.is_empty() {
                    continue;
                }

                self.store.insert_blocks(self.chain_id, &[(*block).clone()]).await?;
                let referenced: Vec<_> = block
                    .transactions
                    .iter()
                    .filter(|tx| matched_tx_hashes.contains(tx.hash()))
                    .cloned()
                    .collect();
                self.store.insert_transactions(self.chain_id, block.number, &referenced).await?;

                if !matched_traces.is_empty() {
                    self.store.insert_traces(self.chain_id, block.number, &matched_traces).await?;
                    self.collect_traces(&block, &matched_traces);
                }

                let receipts = self.fetch_receipts(&block, &matched_tx_hashes).await?;
                self.store.insert_transaction_receipts(self.chain_id, &receipts).await?;
                self.collect_receipts(&block, &receipts);
                self.collected_entry(&block);

                newest = newest.max(Some(block.number));
            }
        }
        Ok(newest)
    }

    /// Fetch events over `[lo, hi]`, adapting the window size to what the
    /// provider will actually serve.
    async fn fetch_events_adaptive(
        &mut self,
        address: Option<Felt>,
        keys: Vec<Vec<Felt>>,
        (lo, hi): (u64, u64),
    ) -> Result<Vec<RpcEmittedEvent>, SyncError> {
        let mut events = Vec::new();
        let mut cursor = lo;

        while cursor <= hi {
            self.check_shutdown()?;
            let width = self.confirmed_range.unwrap_or(self.estimated_range).max(1);
            let to = cursor.saturating_add(width - 1).min(hi);

            match self.fetch_events_window(address, &keys, cursor, to).await {
                Ok(mut window_events) => {
                    events.append(&mut window_events);
                    if self.confirmed_range.is_none() {
                        // Grow gently while the provider keeps up.
                        self.estimated_range = (self.estimated_range * RANGE_GROWTH_NUMERATOR
                            / 100)
                            .max(self.estimated_range + 1);
                    }
                    cursor = to.saturating_add(1);
                }
                Err(ProviderError::RangeExceeded { suggested_to, suggested_width, message }) => {
                    let window = to - cursor + 1;
                    if window == 1 {
                        // A single block is already the smallest window; the
                        // provider is refusing something else entirely.
                        return Err(SyncError::Provider(ProviderError::RangeExceeded {
                            message,
                            suggested_to,
                            suggested_width,
                        }));
                    }

                    let suggested = suggested_width
                        .or_else(|| suggested_to.and_then(|s| s.checked_sub(cursor).map(|w| w + 1)))
                        .filter(|w| *w > 0);

                    match suggested {
                        // Adopt the provider's number only when it actually
                        // shrinks the window; anything else halves so a lying
                        // provider cannot pin us in place.
                        Some(w) if w < window => {
                            debug!(
                                chain_id = self.chain_id,
                                from = cursor,
                                to,
                                confirmed = w,
                                "provider confirmed a block range"
                            );
                            self.confirmed_range = Some(w);
                            self.estimated_range = w;
                        }
                        _ => {
                            let halved = halved_block_number(to, cursor);
                            let halved_width = (halved - cursor + 1).max(1);
                            debug!(
                                chain_id = self.chain_id,
                                from = cursor,
                                to,
                                halved_width,
                                error = %message,
                                "halving event fetch window"
                            );
                            self.confirmed_range = None;
                            self.estimated_range = halved_width;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(events)
    }

    async fn fetch_events_window(
        &self,
        address: Option<Felt>,
        keys: &[Vec<Felt>],
        from: u64,
        to: u64,
    ) -> Result<Vec<RpcEmittedEvent>, ProviderError> {
        let mut events = Vec::new();
        let mut continuation_token = None;

        loop {
            let page = self
                .dispatcher
                .get_events(&EventFilterParams {
                    from_block: Some(from),
                    to_block: Some(to),
                    address,
                    keys: keys.to_vec(),
                    chunk_size: EVENTS_CHUNK_SIZE,
                    continuation_token,
                })
                .await?;

            events.extend(page.events);
            match page.continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        Ok(events)
    }

    async fn get_block(&mut self, number: u64) -> Result<Arc<Block>, SyncError> {
        if let Some(block) = self.block_cache.get(&number) {
            return Ok(Arc::clone(block));
        }
        let raw = self.dispatcher.get_block_with_txs(BlockId::Number(number)).await?;
        let block = Arc::new(normalize_block(raw)?);
        self.block_cache.insert(number, Arc::clone(&block));
        Ok(block)
    }

    async fn get_blocks(&mut self, numbers: &[u64]) -> Result<Vec<Arc<Block>>, SyncError> {
        let misses: Vec<u64> =
            numbers.iter().copied().filter(|n| !self.block_cache.contains_key(n)).collect();

        let fetched = join_all(
            misses.iter().map(|n| self.dispatcher.get_block_with_txs(BlockId::Number(*n))),
        )
        .await;
        for raw in fetched {
            let block = Arc::new(normalize_block(raw?)?);
            self.block_cache.insert(block.number, Arc::clone(&block));
        }

        numbers
            .iter()
            .map(|n| {
                self.block_cache.get(n).map(Arc::clone).ok_or_else(|| {
                    SyncError::Provider(ProviderError::Inconsistent(format!(
                        "block {n} missing after fetch"
                    )))
                })
            })
            .collect()
    }

    async fn fetch_traces(&self, block: &Arc<Block>) -> Result<Vec<Trace>, SyncError> {
        match self.dispatcher.trace_block_transactions(BlockId::Number(block.number)).await {
            Ok(raw) => Ok(normalize_traces(block, &raw)?),
            Err(e) if e.is_method_unsupported() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Receipts for a subset of a block's transactions, preferring the
    /// combined block call until it fails once.
    async fn fetch_receipts(
        &mut self,
        block: &Arc<Block>,
        tx_hashes: &HashSet<Felt>,
    ) -> Result<Vec<TransactionReceipt>, SyncError> {
        let missing: Vec<Felt> =
            tx_hashes.iter().filter(|h| !self.receipt_cache.contains_key(h)).copied().collect();

        if !missing.is_empty() {
            if !self.receipts_fallback {
                match self.dispatcher.get_block_with_receipts(BlockId::Number(block.number)).await {
                    Ok(raw) => {
                        let raw_receipts: Vec<_> =
                            raw.transactions.into_iter().map(|t| t.receipt).collect();
                        for receipt in normalize_receipts(block, &raw_receipts)? {
                            self.receipt_cache.insert(receipt.transaction_hash, receipt);
                        }
                    }
                    Err(e) => {
                        warn!(
                            chain_id = self.chain_id,
                            block_number = block.number,
                            error = %e,
                            "combined receipts call failed, falling back to per-transaction fetches"
                        );
                        self.receipts_fallback = true;
                    }
                }
            }

            if self.receipts_fallback {
                let fetched = join_all(
                    missing
                        .iter()
                        .filter(|h| !self.receipt_cache.contains_key(h))
                        .map(|h| self.dispatcher.get_transaction_receipt(h)),
                )
                .await;
                let mut raw_receipts = Vec::new();
                for receipt in fetched {
                    raw_receipts.push(receipt?);
                }
                for receipt in normalize_receipts(block, &raw_receipts)? {
                    self.receipt_cache.insert(receipt.transaction_hash, receipt);
                }
            }
        }

        Ok(tx_hashes.iter().filter_map(|h| self.receipt_cache.get(h).cloned()).collect())
    }
}

/// Group emitted events by block number, preserving provider order inside a
/// block. Events outside `[lo, hi]` (providers do return them) are dropped.
fn group_by_block(
    events: Vec<RpcEmittedEvent>,
    lo: u64,
    hi: u64,
) -> Vec<(u64, Vec<RpcEmittedEvent>)> {
    let mut by_block: HashMap<u64, Vec<RpcEmittedEvent>> = HashMap::new();
    for event in events {
        let Some(block_number) = event.block_number else {
            // Pending events carry no block number and cannot be indexed.
            continue;
        };
        if block_number < lo || block_number > hi {
            continue;
        }
        by_block.entry(block_number).or_default().push(event);
    }
    let mut grouped: Vec<_> = by_block.into_iter().collect();
    grouped.sort_unstable_by_key(|(n, _)| *n);
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AddressCriteria, ChildAddressLocation, LogFilter};
    use crate::store::InMemorySyncStore;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn emitted(block_number: u64) -> RpcEmittedEvent {
        serde_json::from_value(json!({
            "from_address": "0x1",
            "keys": [],
            "data": [],
            "block_number": block_number,
            "transaction_hash": "0x2",
        }))
        .unwrap()
    }

    #[test]
    fn test_group_by_block_sorts_and_bounds() {
        let events = vec![emitted(12), emitted(10), emitted(12), emitted(99)];
        let grouped = group_by_block(events, 10, 20);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, 10);
        assert_eq!(grouped[1].0, 12);
        assert_eq!(grouped[1].1.len(), 2);
    }

    fn block_body(number: u64, transactions: serde_json::Value) -> serde_json::Value {
        json!({
            "block_hash": format!("0x{:x}", number + 0xb000),
            "parent_hash": format!("0x{:x}", number + 0xb000 - 1),
            "block_number": number,
            "timestamp": 1_000 + number,
            "new_root": "0x0",
            "sequencer_address": "0x1",
            "starknet_version": "0.13.3",
            "status": "ACCEPTED_ON_L2",
            "l1_da_mode": "BLOB",
            "l1_gas_price": { "price_in_fri": "0x1", "price_in_wei": "0x1" },
            "l1_data_gas_price": { "price_in_fri": "0x1", "price_in_wei": "0x1" },
            "transactions": transactions,
        })
    }

    async fn mock_result(server: &mut ServerGuard, match_on: serde_json::Value, result: serde_json::Value) -> mockito::Mock {
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(match_on))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string())
            .create_async()
            .await
    }

    async fn engine(
        server: &ServerGuard,
        sources: Vec<Source>,
        factories: Vec<Factory>,
        store: Arc<InMemorySyncStore>,
    ) -> HistoricalSync<InMemorySyncStore> {
        let dispatcher =
            Arc::new(RpcDispatcher::new(1, &[server.url()], ShutdownSignal::never()).unwrap());
        HistoricalSync::new(
            1,
            dispatcher,
            store,
            sources,
            factories,
            Arc::new(RwLock::new(ChildAddresses::new())),
            TraceSupport::fixed(false),
            ShutdownSignal::never(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_log_sync_persists_matches_and_replays_from_cache() {
        let mut server = Server::new_async().await;
        let address = Felt::from(0x49_u64);
        let selector = Felt::from(0x7_u64);

        // One Transfer-style log in block 150.
        let events_mock = mock_result(
            &mut server,
            json!({ "method": "starknet_getEvents" }),
            json!({
                "events": [{
                    "from_address": address,
                    "keys": [selector],
                    "data": ["0x64"],
                    "block_number": 150,
                    "block_hash": format!("0x{:x}", 150 + 0xb000),
                    "transaction_hash": "0xaa",
                }],
            }),
        )
        .await;
        let block_mock = mock_result(
            &mut server,
            json!({
                "method": "starknet_getBlockWithTxs",
                "params": { "block_id": { "block_number": 150 } },
            }),
            block_body(
                150,
                json!([{
                    "type": "INVOKE",
                    "transaction_hash": "0xaa",
                    "version": "0x3",
                    "sender_address": "0x77",
                }]),
            ),
        )
        .await;

        let mut filter = LogFilter::new(1);
        filter.address = AddressCriteria::single(address);
        filter.topics[0] = Some(vec![selector]);
        filter.from_block = Some(100);
        filter.to_block = Some(200);
        let sources = vec![Source::new("transfers", Filter::Log(filter))];

        let store = Arc::new(InMemorySyncStore::new());
        let mut sync = engine(&server, sources.clone(), vec![], Arc::clone(&store)).await;

        let outcome = sync.sync((100, 200)).await.unwrap();
        assert_eq!(outcome.newest, Some(200));
        assert_eq!(outcome.data.len(), 1);
        assert_eq!(outcome.data[0].logs.len(), 1);

        let logs = store.logs(1);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 150);
        assert_eq!(logs[0].address, address);

        events_mock.assert_async().await;
        block_mock.assert_async().await;

        // Replaying the same interval is served entirely from the completed
        // intervals: zero additional RPC calls.
        let mut replay = engine(&server, sources, vec![], Arc::clone(&store)).await;
        let outcome = replay.sync((100, 200)).await.unwrap();
        assert!(outcome.data.is_empty());
        events_mock.assert_async().await;
        block_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_factory_children_gate_downstream_matches() {
        let mut server = Server::new_async().await;
        let factory_address = Felt::from(0xfa_u64);
        let pair_created = Felt::from(0x9c_u64);
        let swap = Felt::from(0x51_u64);
        let pair = Felt::from(0x9a17_u64);

        let factory = Factory {
            id: "pairs".to_string(),
            chain_id: 1,
            address: factory_address,
            event_selector: pair_created,
            child_address_location: ChildAddressLocation::Topic(1),
            from_block: None,
            to_block: None,
        };

        // Factory discovery fetch: PairCreated at block 500 yields the pair.
        mock_result(
            &mut server,
            json!({
                "method": "starknet_getEvents",
                "params": { "filter": { "address": factory_address } },
            }),
            json!({
                "events": [{
                    "from_address": factory_address,
                    "keys": [pair_created, pair],
                    "data": [],
                    "block_number": 500,
                    "transaction_hash": "0xaa",
                }],
            }),
        )
        .await;
        // Downstream fetch for the discovered pair: a Swap in block 600 and
        // one before discovery in block 499 that must not match.
        mock_result(
            &mut server,
            json!({
                "method": "starknet_getEvents",
                "params": { "filter": { "address": pair } },
            }),
            json!({
                "events": [
                    {
                        "from_address": pair,
                        "keys": [swap],
                        "data": [],
                        "block_number": 499,
                        "transaction_hash": "0xbb",
                    },
                    {
                        "from_address": pair,
                        "keys": [swap],
                        "data": [],
                        "block_number": 600,
                        "transaction_hash": "0xcc",
                    },
                ],
            }),
        )
        .await;
        for (number, hash) in [(500u64, "0xaa"), (499, "0xbb"), (600, "0xcc")] {
            mock_result(
                &mut server,
                json!({
                    "method": "starknet_getBlockWithTxs",
                    "params": { "block_id": { "block_number": number } },
                }),
                block_body(
                    number,
                    json!([{
                        "type": "INVOKE",
                        "transaction_hash": hash,
                        "version": "0x3",
                        "sender_address": "0x77",
                    }]),
                ),
            )
            .await;
        }

        let mut filter = LogFilter::new(1);
        filter.address = AddressCriteria::Factory("pairs".to_string());
        filter.topics[0] = Some(vec![swap]);
        let sources = vec![Source::new("swaps", Filter::Log(filter))];

        let store = Arc::new(InMemorySyncStore::new());
        let mut sync = engine(&server, sources, vec![factory], Arc::clone(&store)).await;
        let outcome = sync.sync((400, 700)).await.unwrap();

        // Exactly one Swap: block 600. The block-499 Swap precedes discovery.
        let logs: Vec<_> =
            outcome.data.iter().flat_map(|d| d.logs.iter()).collect();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, 600);
        assert_eq!(logs[0].keys[0], swap);

        let children = store.get_child_addresses(1, "pairs").await.unwrap();
        assert_eq!(children.get(&pair), Some(&500));
    }

    #[tokio::test]
    async fn test_range_too_large_adopts_suggestion_and_rechunks() {
        let mut server = Server::new_async().await;

        // Re-chunked calls succeed with no events. Created first: the most
        // recently created mock wins when several match, and the refusal
        // below must take the full-window call.
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": "starknet_getEvents" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": { "events": [] } }).to_string())
            .expect_at_least(2)
            .create_async()
            .await;
        // The full-window call is refused with a width hint.
        server
            .mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(json!({ "method": "starknet_getEvents" })),
                Matcher::PartialJson(json!({
                    "params": { "filter": {
                        "from_block": { "block_number": 1000 },
                        "to_block": { "block_number": 2999 },
                    } },
                })),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": {
                        "code": -32602,
                        "message": "block range is too large, limited to a 500 block range",
                    },
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut filter = LogFilter::new(1);
        filter.address = AddressCriteria::single(Felt::from(0x49_u64));
        let sources = vec![Source::new("logs", Filter::Log(filter))];

        let store = Arc::new(InMemorySyncStore::new());
        let mut sync = engine(&server, sources, vec![], Arc::clone(&store)).await;
        let outcome = sync.sync((1000, 2999)).await.unwrap();

        assert_eq!(outcome.newest, Some(2999));
        assert_eq!(sync.confirmed_range, Some(500));
        assert_eq!(sync.estimated_range, 500);
    }
}
