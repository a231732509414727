//! Head tracking with reorg reconciliation and finalization.
//!
//! The local chain is the finalized head plus the unfinalized suffix, kept as
//! a parent-linked list of light blocks. Every arriving head moves the state
//! machine exactly one of five ways: duplicate, reorg-by-height, gap, extend,
//! or reorg-by-mismatch. Transitions run on a single consumer task per chain,
//! so they are atomic with respect to each other.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use starknet_types_core::felt::Felt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::event::BlockData;
use crate::filter::{ChildAddresses, Factory, Filter};
use crate::helpers::padded_hex;
use crate::manifest::Source;
use crate::normalize::{
    ensure_trace_set, normalize_block, normalize_logs, normalize_receipts, normalize_traces,
};
use crate::provider::jsonrpc::{EventFilterParams, RpcBlockHeader};
use crate::provider::{BlockId, HeadWatcher, ProviderError, RpcDispatcher};
use crate::store::{ChildAddressRow, SyncStore};
use crate::system_state::ShutdownSignal;
use crate::types::{Block, LightBlock, Log, TransactionReceipt};

use super::{SyncError, TraceSupport};

/// Bound on how many missing blocks a gap fill will fetch at once.
const MAX_GAP_FETCH: u64 = 50;
/// `starknet_getEvents` page size for single-block fetches.
const EVENTS_CHUNK_SIZE: u64 = 1_000;
/// Watchdog: warn when no head arrives for this long.
const HEAD_WATCHDOG: Duration = Duration::from_secs(30);
/// Abort when the head pipeline keeps failing this hard.
const HEAD_FAILURE_LIMIT: u32 = 10;
const HEAD_FAILURE_WINDOW: Duration = Duration::from_secs(600);

/// State transition outputs, emitted in source order.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was accepted onto the unfinalized suffix.
    Accepted { block: LightBlock, data: BlockData },
    /// The chain reorganized: everything after `common_ancestor` is invalid.
    Reorg { common_ancestor: LightBlock, reorged_blocks: Vec<LightBlock> },
    /// The finalized head advanced.
    Finalize { block: LightBlock },
}

pub struct RealtimeSync<S> {
    chain_id: u64,
    dispatcher: Arc<RpcDispatcher>,
    store: Arc<S>,
    sources: Vec<Source>,
    factories: Vec<Factory>,
    /// Shared with the orchestrator, which reads it during event assembly.
    /// Writes only happen here, before the corresponding event is emitted.
    children: Arc<RwLock<ChildAddresses>>,
    /// Child addresses discovered per unfinalized block, for reorg rollback.
    children_per_block: BTreeMap<u64, Vec<(String, Felt)>>,
    /// `chain[0]` is the finalized head; the rest is the unfinalized suffix.
    chain: Vec<LightBlock>,
    finality_block_count: u64,
    trace_support: Arc<TraceSupport>,
    shutdown: ShutdownSignal,
    receipts_fallback: bool,
}

impl<S: SyncStore> RealtimeSync<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u64,
        dispatcher: Arc<RpcDispatcher>,
        store: Arc<S>,
        sources: Vec<Source>,
        factories: Vec<Factory>,
        children: Arc<RwLock<ChildAddresses>>,
        finalized: LightBlock,
        finality_block_count: u64,
        trace_support: Arc<TraceSupport>,
        shutdown: ShutdownSignal,
    ) -> Self {
        RealtimeSync {
            chain_id,
            dispatcher,
            store,
            sources,
            factories,
            children,
            children_per_block: BTreeMap::new(),
            chain: vec![finalized],
            finality_block_count,
            trace_support,
            shutdown,
            receipts_fallback: false,
        }
    }

    pub fn finalized(&self) -> &LightBlock {
        &self.chain[0]
    }

    pub fn tip(&self) -> &LightBlock {
        self.chain.last().expect("chain always holds the finalized head")
    }

    pub fn unfinalized(&self) -> &[LightBlock] {
        &self.chain[1..]
    }

    /// Consume heads until shutdown, forwarding chain events to the
    /// orchestrator.
    pub async fn run(
        mut self,
        mut heads: HeadWatcher,
        events_tx: mpsc::Sender<ChainEvent>,
    ) -> Result<(), SyncError> {
        let mut failures = 0u32;
        let mut first_failure: Option<Instant> = None;

        loop {
            if self.shutdown.is_shutdown() {
                return Ok(());
            }

            let header = tokio::select! {
                received = tokio::time::timeout(HEAD_WATCHDOG, heads.recv()) => {
                    match received {
                        Ok(Some(header)) => header,
                        Ok(None) => {
                            info!(chain_id = self.chain_id, "head stream closed");
                            return Ok(());
                        }
                        Err(_) => {
                            warn!(
                                chain_id = self.chain_id,
                                watchdog_secs = HEAD_WATCHDOG.as_secs(),
                                tip = self.tip().number,
                                "no new head observed within the watchdog window"
                            );
                            continue;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            match self.handle_new_head(header).await {
                Ok(events) => {
                    failures = 0;
                    first_failure = None;
                    for event in events {
                        if events_tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) if e.is_shutdown() => return Ok(()),
                Err(e @ SyncError::UnrecoverableReorg { .. }) => return Err(e),
                Err(e) => {
                    failures += 1;
                    let since = *first_failure.get_or_insert_with(Instant::now);
                    error!(
                        chain_id = self.chain_id,
                        failures,
                        error = %e,
                        "failed to process new head"
                    );
                    if failures >= HEAD_FAILURE_LIMIT
                        && since.elapsed() > HEAD_FAILURE_WINDOW
                    {
                        return Err(SyncError::HeadFetcherDead {
                            chain_id: self.chain_id,
                            failures,
                            minutes: since.elapsed().as_secs() / 60,
                        });
                    }
                }
            }
        }
    }

    /// Run one head through the state machine.
    pub async fn handle_new_head(
        &mut self,
        header: RpcBlockHeader,
    ) -> Result<Vec<ChainEvent>, SyncError> {
        let mut events = Vec::new();
        let mut queue = VecDeque::from([header]);

        while let Some(header) = queue.pop_front() {
            if self.shutdown.is_shutdown() {
                return Err(SyncError::Shutdown);
            }
            let latest = self.tip().clone();

            // Duplicate: the exact block we already have.
            if header.block_hash == latest.hash {
                debug!(
                    chain_id = self.chain_id,
                    block_number = header.block_number,
                    "duplicate head, not accepted"
                );
                continue;
            }

            // Reorg by height: the branch got shorter or replaced in place.
            if header.block_number <= latest.number {
                events.extend(self.reconcile_reorg(&header).await?);
                continue;
            }

            // Gap: fetch the missing blocks, bounded, then revisit.
            if header.block_number > latest.number + 1 {
                let missing = header.block_number - latest.number - 1;
                if missing > MAX_GAP_FETCH {
                    warn!(
                        chain_id = self.chain_id,
                        tip = latest.number,
                        head = header.block_number,
                        missing,
                        "head too far ahead of local chain, rejecting"
                    );
                    continue;
                }

                let fetched = join_all(
                    (latest.number + 1..header.block_number)
                        .map(|n| self.dispatcher.get_block_with_tx_hashes(BlockId::Number(n))),
                )
                .await;

                queue.push_front(header);
                for raw in fetched.into_iter().rev() {
                    let raw = raw?;
                    queue.push_front(RpcBlockHeader {
                        block_hash: raw.block_hash,
                        parent_hash: raw.parent_hash,
                        block_number: raw.block_number,
                        timestamp: raw.timestamp,
                    });
                }
                continue;
            }

            // Extend: the common case.
            if header.parent_hash == latest.hash {
                events.extend(self.accept_block(&header).await?);
                continue;
            }

            // Same height successor with a different parent: reorg.
            events.extend(self.reconcile_reorg(&header).await?);
        }

        Ok(events)
    }

    /// Walk back from the incoming head until the unfinalized suffix links up
    /// with it, then replay the replacement branch.
    ///
    /// The walk runs on a scratch copy of the chain: a transport failure or a
    /// deep reorg leaves the live state exactly as it was.
    async fn reconcile_reorg(
        &mut self,
        header: &RpcBlockHeader,
    ) -> Result<Vec<ChainEvent>, SyncError> {
        let mut chain = self.chain.clone();
        let mut removed: Vec<LightBlock> = Vec::new();
        let mut new_branch: Vec<LightBlock> = vec![light(header)];

        // Drop local blocks at or above the incoming height.
        while chain.len() > 1
            && chain.last().expect("suffix checked non-empty").number >= header.block_number
        {
            removed.push(chain.pop().expect("suffix checked non-empty"));
        }

        let common_ancestor = loop {
            let local = chain.last().expect("chain always holds the finalized head").clone();
            let remote = new_branch.last().expect("branch starts with the new head").clone();

            if remote.parent_hash == local.hash {
                break local;
            }

            if chain.len() == 1 {
                // The walk consumed the whole unfinalized suffix: the reorg
                // reaches behind the finality horizon.
                error!(
                    chain_id = self.chain_id,
                    finalized_block = self.finalized().number,
                    head = header.block_number,
                    head_hash = %padded_hex(&header.block_hash),
                    "reorg deeper than the unfinalized suffix"
                );
                return Err(SyncError::UnrecoverableReorg {
                    chain_id: self.chain_id,
                    finalized_block: self.finalized().number,
                });
            }

            removed.push(chain.pop().expect("suffix checked non-empty"));

            let raw =
                self.dispatcher.get_block_with_tx_hashes(BlockId::Hash(remote.parent_hash)).await?;
            new_branch.push(LightBlock {
                hash: raw.block_hash,
                parent_hash: raw.parent_hash,
                number: raw.block_number,
                timestamp: raw.timestamp,
            });
        };

        self.chain = chain;
        removed.reverse();
        new_branch.reverse();

        info!(
            chain_id = self.chain_id,
            common_ancestor = common_ancestor.number,
            depth = removed.len(),
            "chain reorganization"
        );

        // Forget child addresses discovered on the removed blocks.
        self.rollback_children(common_ancestor.number);

        let mut events = vec![ChainEvent::Reorg {
            common_ancestor: common_ancestor.clone(),
            reorged_blocks: removed,
        }];

        for block in &new_branch {
            let header = RpcBlockHeader {
                block_hash: block.hash,
                parent_hash: block.parent_hash,
                block_number: block.number,
                timestamp: block.timestamp,
            };
            events.extend(self.accept_block(&header).await?);
        }

        Ok(events)
    }

    fn rollback_children(&mut self, common_ancestor: u64) {
        let annotations = self.children_per_block.split_off(&(common_ancestor + 1));
        let mut removed_blocks: HashSet<u64> = HashSet::new();
        let mut children = self.children.write().unwrap();
        for (block_number, entries) in annotations {
            removed_blocks.insert(block_number);
            for (factory_id, address) in entries {
                if children.first_seen(&factory_id, &address) == Some(block_number) {
                    children.remove(&factory_id, &address);
                }
            }
        }
        drop(children);
        if !removed_blocks.is_empty() {
            debug!(
                chain_id = self.chain_id,
                blocks = removed_blocks.len(),
                "rolled back factory discoveries from reorged blocks"
            );
        }
    }

    /// Fetch, filter and persist one new tip block, then apply finalization.
    async fn accept_block(
        &mut self,
        header: &RpcBlockHeader,
    ) -> Result<Vec<ChainEvent>, SyncError> {
        let data = self.fetch_block_data(header).await?;
        let block = light(header);

        self.chain.push(block.clone());

        let mut events = vec![ChainEvent::Accepted { block, data }];
        events.extend(self.apply_finalization());
        Ok(events)
    }

    fn apply_finalization(&mut self) -> Option<ChainEvent> {
        let finalized = self.finalized().clone();
        let tip_number = self.tip().number;

        if tip_number < finalized.number + 2 * self.finality_block_count {
            return None;
        }

        let new_finalized_number = tip_number - self.finality_block_count;
        let new_finalized =
            self.chain.iter().find(|b| b.number == new_finalized_number)?.clone();

        self.chain.retain(|b| b.number >= new_finalized_number);
        self.children_per_block = self.children_per_block.split_off(&(new_finalized_number + 1));

        info!(
            chain_id = self.chain_id,
            finalized = new_finalized_number,
            tip = tip_number,
            "advanced finalized head"
        );
        Some(ChainEvent::Finalize { block: new_finalized })
    }

    /// Fetch everything the active sources need out of one block.
    async fn fetch_block_data(&mut self, header: &RpcBlockHeader) -> Result<BlockData, SyncError> {
        let number = header.block_number;

        let log_filters: Vec<&Filter> = self
            .sources
            .iter()
            .map(|s| &s.filter)
            .filter(|f| matches!(f, Filter::Log(_)) && filter_in_range(f, number))
            .collect();
        let wants_traces = self.sources.iter().any(|s| {
            matches!(s.filter, Filter::Trace(_) | Filter::Transfer(_))
                && filter_in_range(&s.filter, number)
        });
        let factory_in_range =
            self.factories.iter().any(|f| f.chain_id == self.chain_id && f.in_range(number));

        // The full block is always needed: transaction filters evaluate
        // against it and log index repair reads its transaction list.
        let raw_block = self.dispatcher.get_block_with_txs(BlockId::Hash(header.block_hash)).await?;
        let block = Arc::new(normalize_block(raw_block)?);
        if block.hash != header.block_hash {
            return Err(SyncError::Provider(ProviderError::Inconsistent(format!(
                "fetched block {} for hash {}",
                padded_hex(&block.hash),
                padded_hex(&header.block_hash)
            ))));
        }

        let logs = if !log_filters.is_empty() || factory_in_range {
            let events = self.fetch_block_events(number).await?;
            normalize_logs(&block, &events)?
        } else {
            Vec::new()
        };

        let traces = if wants_traces && self.trace_support.supported(&self.dispatcher).await {
            match self.dispatcher.trace_block_transactions(BlockId::Number(number)).await {
                Ok(raw) => {
                    let traces = normalize_traces(&block, &raw)?;
                    ensure_trace_set(&block, &traces, true)?;
                    traces
                }
                Err(e) if e.is_method_unsupported() => Vec::new(),
                Err(e) => return Err(e.into()),
            }
        } else {
            Vec::new()
        };

        // Factory discoveries first, so downstream filters see children born
        // in this very block.
        let mut discovered: Vec<(String, Felt)> = Vec::new();
        let mut rows: Vec<ChildAddressRow> = Vec::new();
        for factory in self.factories.iter().filter(|f| f.chain_id == self.chain_id) {
            for log in logs.iter().filter(|log| factory.matches_log(log)) {
                let Some(address) = factory.extract_child_address(log) else {
                    warn!(
                        factory = factory.id,
                        block_number = number,
                        "factory log is missing its child address location"
                    );
                    continue;
                };
                discovered.push((factory.id.clone(), address));
            }
        }
        {
            let mut children = self.children.write().unwrap();
            for (factory_id, address) in &discovered {
                if children.insert_min(factory_id, *address, number) {
                    rows.push(ChildAddressRow {
                        factory_id: factory_id.clone(),
                        address: *address,
                        first_seen_block_number: number,
                    });
                }
            }
        }
        if !rows.is_empty() {
            self.store.insert_child_addresses(self.chain_id, &rows).await?;
            self.children_per_block
                .entry(number)
                .or_default()
                .extend(rows.iter().map(|r| (r.factory_id.clone(), r.address)));
        }

        // Filter everything now that this block's children are known.
        let (matched_logs, matched_traces, receipt_hashes, matched_tx_hashes) = {
            let children = self.children.read().unwrap();

            let matched_logs: Vec<Log> = logs
                .into_iter()
                .filter(|log| {
                    self.sources.iter().any(|s| match &s.filter {
                        Filter::Log(f) => f.matches(log, &children),
                        _ => false,
                    })
                })
                .collect();

            let matched_traces: Vec<crate::types::Trace> = traces
                .into_iter()
                .filter(|trace| {
                    self.sources.iter().any(|s| match &s.filter {
                        Filter::Trace(f) => f.matches(trace, number, &children),
                        Filter::Transfer(f) => f.matches(trace, number),
                        _ => false,
                    })
                })
                .collect();

            let mut receipt_hashes: HashSet<Felt> = HashSet::new();
            for log in &matched_logs {
                let needs_receipt = self.sources.iter().any(|s| match &s.filter {
                    Filter::Log(f) => f.has_transaction_receipt && f.matches(log, &children),
                    _ => false,
                });
                if needs_receipt && log.transaction_hash != Felt::ZERO {
                    receipt_hashes.insert(log.transaction_hash);
                }
            }
            for trace in &matched_traces {
                receipt_hashes.insert(trace.transaction_hash);
            }

            let mut matched_tx_hashes: HashSet<Felt> = HashSet::new();
            for tx in &block.transactions {
                let matches = self.sources.iter().any(|s| match &s.filter {
                    Filter::Transaction(f) => f.matches(tx, number, &children),
                    _ => false,
                });
                if matches {
                    matched_tx_hashes.insert(*tx.hash());
                    receipt_hashes.insert(*tx.hash());
                }
            }

            (matched_logs, matched_traces, receipt_hashes, matched_tx_hashes)
        };

        let receipts = if receipt_hashes.is_empty() {
            Vec::new()
        } else {
            self.fetch_receipts(&block, &receipt_hashes).await?
        };

        // Persist the slice of the block the sources actually reference.
        let log_tx_hashes: HashSet<Felt> =
            matched_logs.iter().map(|l| l.transaction_hash).collect();
        let trace_tx_hashes: HashSet<Felt> =
            matched_traces.iter().map(|t| t.transaction_hash).collect();
        let any_match = !matched_logs.is_empty()
            || !matched_traces.is_empty()
            || !matched_tx_hashes.is_empty()
            || self.sources.iter().any(|s| match &s.filter {
                Filter::Block(f) => f.matches(number),
                _ => false,
            });

        if any_match {
            self.store.insert_blocks(self.chain_id, &[(*block).clone()]).await?;
            let referenced: Vec<_> = block
                .transactions
                .iter()
                .filter(|tx| {
                    matched_tx_hashes.contains(tx.hash())
                        || log_tx_hashes.contains(tx.hash())
                        || trace_tx_hashes.contains(tx.hash())
                })
                .cloned()
                .collect();
            if !referenced.is_empty() {
                self.store.insert_transactions(self.chain_id, number, &referenced).await?;
            }
            if !matched_logs.is_empty() {
                self.store.insert_logs(self.chain_id, &matched_logs).await?;
            }
            if !matched_traces.is_empty() {
                self.store.insert_traces(self.chain_id, number, &matched_traces).await?;
            }
            if !receipts.is_empty() {
                self.store.insert_transaction_receipts(self.chain_id, &receipts).await?;
            }
        }

        Ok(BlockData { block, logs: matched_logs, receipts, traces: matched_traces })
    }

    async fn fetch_block_events(
        &self,
        block_number: u64,
    ) -> Result<Vec<crate::provider::RpcEmittedEvent>, SyncError> {
        let mut events = Vec::new();
        let mut continuation_token = None;
        loop {
            let page = self
                .dispatcher
                .get_events(&EventFilterParams {
                    from_block: Some(block_number),
                    to_block: Some(block_number),
                    address: None,
                    keys: vec![],
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

    async fn fetch_receipts(
        &mut self,
        block: &Arc<Block>,
        tx_hashes: &HashSet<Felt>,
    ) -> Result<Vec<TransactionReceipt>, SyncError> {
        if !self.receipts_fallback {
            match self.dispatcher.get_block_with_receipts(BlockId::Number(block.number)).await {
                Ok(raw) => {
                    let raw_receipts: Vec<_> =
                        raw.transactions.into_iter().map(|t| t.receipt).collect();
                    let receipts = normalize_receipts(block, &raw_receipts)?;
                    return Ok(receipts
                        .into_iter()
                        .filter(|r| tx_hashes.contains(&r.transaction_hash))
                        .collect());
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

        let fetched =
            join_all(tx_hashes.iter().map(|h| self.dispatcher.get_transaction_receipt(h))).await;
        let mut raw_receipts = Vec::new();
        for receipt in fetched {
            raw_receipts.push(receipt?);
        }
        Ok(normalize_receipts(block, &raw_receipts)?)
    }
}

fn light(header: &RpcBlockHeader) -> LightBlock {
    LightBlock {
        hash: header.block_hash,
        parent_hash: header.parent_hash,
        number: header.block_number,
        timestamp: header.timestamp,
    }
}

fn filter_in_range(filter: &Filter, block_number: u64) -> bool {
    filter.from_block().is_none_or(|from| block_number >= from)
        && filter.to_block().is_none_or(|to| block_number <= to)
}
