//! The orchestrator: per chain, historical sync up to the finality horizon,
//! then realtime; events interleaved across chains under the configured
//! ordering and delivered to user handlers in strict checkpoint order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::event::{Event, EventAssembler};
use crate::filter::ChildAddresses;
use crate::handler_cache::{HandlerClient, HandlerRpcCache};
use crate::manifest::{ChainConfig, ChainOrdering, Manifest, ManifestError, Source};
use crate::metrics::{Metrics, NoopMetrics};
use crate::provider::{BlockId, DispatcherBuildError, HeadWatcher, RpcDispatcher};
use crate::store::{StoreError, SyncStore};
use crate::sync::historical::HistoricalSync;
use crate::sync::realtime::{ChainEvent, RealtimeSync};
use crate::sync::{SyncError, TraceSupport};
use crate::system_state::ShutdownSignal;
use crate::types::checkpoint::CheckpointParts;
use crate::types::{Checkpoint, EventKind};

/// Blocks per historical sync step. Bounds the event data held in memory
/// between checkpoints.
const HISTORICAL_STEP: u64 = 1_000;
/// Handler retry budget before the error propagates.
const HANDLER_MAX_ATTEMPTS: u32 = 5;
const HANDLER_RETRY_DELAY: Duration = Duration::from_millis(100);
const HANDLER_RETRY_DELAY_MAX: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum HandlerError {
    /// Worth retrying: transient backend trouble in the handler.
    #[error("{0}")]
    Retryable(String),

    /// Propagate after logging.
    #[error("{0}")]
    Fatal(String),
}

pub type HandlerResult = Result<(), HandlerError>;

/// A user callback bound to a source name.
pub type Handler<S> =
    Arc<dyn Fn(EventContext<S>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Everything a handler gets to work with: the event, chain metadata, a
/// scoped read-only client, and the store handle.
pub struct EventContext<S> {
    pub chain_id: u64,
    pub event: Arc<Event>,
    pub client: HandlerClient<S>,
    pub store: Arc<S>,
}

#[derive(Default)]
pub struct HandlerRegistry<S> {
    handlers: HashMap<String, Handler<S>>,
}

impl<S> HandlerRegistry<S> {
    pub fn new() -> Self {
        HandlerRegistry { handlers: HashMap::new() }
    }

    pub fn register(&mut self, source_name: impl Into<String>, handler: Handler<S>) {
        self.handlers.insert(source_name.into(), handler);
    }

    pub fn get(&self, source_name: &str) -> Option<&Handler<S>> {
        self.handlers.get(source_name)
    }
}

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherBuildError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("handler '{name}' failed permanently: {message}")]
    Handler { name: String, message: String },

    #[error("chain {chain_id} pipeline failed: {message}")]
    ChainFailed { chain_id: u64, message: String },
}

/// Message from a chain pipeline to the central event processor.
enum ChainMessage {
    Batch {
        chain_id: u64,
        events: Vec<Event>,
        /// Lower bound on every future checkpoint from this chain. `None`
        /// leaves the previous watermark in place.
        watermark: Option<Checkpoint>,
    },
    Reorg {
        chain_id: u64,
        ancestor_block: u64,
    },
    Finished {
        chain_id: u64,
    },
    Fatal {
        chain_id: u64,
        message: String,
    },
}

pub struct Indexer<S> {
    manifest: Manifest,
    store: Arc<S>,
    handlers: Arc<HandlerRegistry<S>>,
    metrics: Arc<dyn Metrics>,
}

impl<S: SyncStore + 'static> Indexer<S> {
    pub fn new(manifest: Manifest, store: Arc<S>, handlers: HandlerRegistry<S>) -> Self {
        Self::with_metrics(manifest, store, handlers, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        manifest: Manifest,
        store: Arc<S>,
        handlers: HandlerRegistry<S>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Indexer { manifest, store, handlers: Arc::new(handlers), metrics }
    }

    /// Run the indexer until shutdown or a fatal error.
    pub async fn start(self, shutdown: ShutdownSignal) -> Result<(), IndexerError> {
        self.manifest.validate()?;

        let (tx, rx) = mpsc::channel::<ChainMessage>(256);
        let mut caches: HashMap<u64, Arc<HandlerRpcCache<S>>> = HashMap::new();

        for chain in &self.manifest.chains {
            let dispatcher = Arc::new(RpcDispatcher::with_metrics(
                chain.chain_id,
                &chain.rpc_urls,
                shutdown.clone(),
                Arc::clone(&self.metrics),
            )?);
            let cache = Arc::new(HandlerRpcCache::with_metrics(
                chain.chain_id,
                Arc::clone(&dispatcher),
                Arc::clone(&self.store),
                chain.disable_cache,
                Arc::clone(&self.metrics),
            ));
            caches.insert(chain.chain_id, Arc::clone(&cache));

            let runtime = ChainPipeline {
                chain: chain.clone(),
                sources: self
                    .manifest
                    .sources_for_chain(chain.chain_id)
                    .into_iter()
                    .cloned()
                    .collect(),
                factories: self
                    .manifest
                    .factories_for_chain(chain.chain_id)
                    .into_iter()
                    .cloned()
                    .collect(),
                dispatcher,
                store: Arc::clone(&self.store),
                metrics: Arc::clone(&self.metrics),
                shutdown: shutdown.clone(),
                tx: tx.clone(),
            };
            tokio::spawn(runtime.run());
        }
        drop(tx);

        let processor = EventProcessor {
            ordering: self.manifest.ordering,
            chains: self
                .manifest
                .chains
                .iter()
                .map(|c| (c.chain_id, ChainStream::default()))
                .collect(),
            caches,
            store: Arc::clone(&self.store),
            handlers: Arc::clone(&self.handlers),
            metrics: Arc::clone(&self.metrics),
        };
        processor.run(rx).await
    }
}

/// Per-chain sync pipeline: historical to the finality horizon, then
/// realtime, feeding assembled event batches to the processor.
struct ChainPipeline<S> {
    chain: ChainConfig,
    sources: Vec<Source>,
    factories: Vec<crate::filter::Factory>,
    dispatcher: Arc<RpcDispatcher>,
    store: Arc<S>,
    metrics: Arc<dyn Metrics>,
    shutdown: ShutdownSignal,
    tx: mpsc::Sender<ChainMessage>,
}

impl<S: SyncStore + 'static> ChainPipeline<S> {
    async fn run(self) {
        let chain_id = self.chain.chain_id;
        // run_inner hands the sender back so the final status can be
        // reported whichever way it ends.
        match self.run_inner().await {
            Ok(tx) => {
                let _ = tx.send(ChainMessage::Finished { chain_id }).await;
            }
            Err((tx, e)) if e.is_shutdown() => {
                let _ = tx.send(ChainMessage::Finished { chain_id }).await;
            }
            Err((tx, e)) => {
                let _ = tx
                    .send(ChainMessage::Fatal { chain_id, message: e.to_string() })
                    .await;
            }
        }
    }

    async fn run_inner(
        self,
    ) -> Result<mpsc::Sender<ChainMessage>, (mpsc::Sender<ChainMessage>, SyncError)> {
        let ChainPipeline { chain, sources, factories, dispatcher, store, metrics, shutdown, tx } =
            self;
        let chain_id = chain.chain_id;

        if sources.is_empty() && factories.is_empty() {
            info!(chain_id, "no sources configured, skipping chain");
            return Ok(tx);
        }

        // One-time setup events, delivered before any chain event.
        let setup: Vec<Event> = sources
            .iter()
            .map(|s| Event::Setup { chain_id, name: s.name.clone() })
            .collect();
        if tx.send(ChainMessage::Batch { chain_id, events: setup, watermark: None }).await.is_err()
        {
            return Ok(tx);
        }

        let assembler = EventAssembler::new();
        let trace_support = TraceSupport::new();
        let children = Arc::new(RwLock::new(ChildAddresses::new()));

        let mut historical = match HistoricalSync::new(
            chain_id,
            Arc::clone(&dispatcher),
            Arc::clone(&store),
            sources.clone(),
            factories.clone(),
            Arc::clone(&children),
            Arc::clone(&trace_support),
            shutdown.clone(),
        )
        .await
        {
            Ok(historical) => historical,
            Err(e) => return Err((tx, e)),
        };

        let start_block = sources
            .iter()
            .filter_map(|s| s.filter.from_block())
            .chain(factories.iter().filter_map(|f| f.from_block))
            .min()
            .unwrap_or(0);
        let mut cursor = start_block;
        let mut finalized_anchor = None;

        info!(chain_id, start_block, "starting historical sync");

        loop {
            if shutdown.is_shutdown() {
                return Ok(tx);
            }

            let latest = match dispatcher.block_number().await {
                Ok(latest) => latest,
                Err(e) => return Err((tx, e.into())),
            };
            let finalized_target = latest.saturating_sub(chain.finality_block_count);
            if cursor > finalized_target {
                break;
            }

            let hi = (cursor + HISTORICAL_STEP - 1).min(finalized_target);
            let outcome = match historical.sync((cursor, hi)).await {
                Ok(outcome) => outcome,
                Err(e) => return Err((tx, e)),
            };

            let mut events = Vec::new();
            {
                let guard = children.read().unwrap();
                for data in &outcome.data {
                    events.extend(assembler.assemble(chain_id, data, &sources, &guard));
                }
            }

            // The step-top block timestamp bounds every future checkpoint
            // from this chain, which is what lets omnichain merging advance.
            let top = match dispatcher.get_block_with_tx_hashes(BlockId::Number(hi)).await {
                Ok(top) => top,
                Err(e) => return Err((tx, e.into())),
            };
            finalized_anchor = Some(crate::types::LightBlock {
                hash: top.block_hash,
                parent_hash: top.parent_hash,
                number: top.block_number,
                timestamp: top.timestamp,
            });
            let watermark = Checkpoint::encode(CheckpointParts {
                block_timestamp: top.timestamp,
                chain_id,
                block_number: hi + 1,
                transaction_index: 0,
                event_kind: EventKind::Blocks,
                event_index: 0,
            });

            if tx
                .send(ChainMessage::Batch { chain_id, events, watermark: Some(watermark) })
                .await
                .is_err()
            {
                return Ok(tx);
            }
            metrics.record_synced_block(chain_id, hi);
            cursor = hi + 1;
        }

        info!(chain_id, caught_up_to = cursor.saturating_sub(1), "historical sync caught up");

        // Anchor realtime at the finalized head historical stopped on.
        let finalized = match finalized_anchor {
            Some(anchor) => anchor,
            None => {
                let number = cursor.saturating_sub(1);
                let raw =
                    match dispatcher.get_block_with_tx_hashes(BlockId::Number(number)).await {
                        Ok(raw) => raw,
                        Err(e) => return Err((tx, e.into())),
                    };
                crate::types::LightBlock {
                    hash: raw.block_hash,
                    parent_hash: raw.parent_hash,
                    number: raw.block_number,
                    timestamp: raw.timestamp,
                }
            }
        };

        let realtime = RealtimeSync::new(
            chain_id,
            Arc::clone(&dispatcher),
            Arc::clone(&store),
            sources.clone(),
            factories,
            Arc::clone(&children),
            finalized,
            chain.finality_block_count,
            trace_support,
            shutdown.clone(),
        );
        let heads = HeadWatcher::spawn(
            Arc::clone(&dispatcher),
            chain.ws_url.clone(),
            chain.polling_interval,
            shutdown.clone(),
        );
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let realtime_task = tokio::spawn(realtime.run(heads, events_tx));

        while let Some(chain_event) = events_rx.recv().await {
            match chain_event {
                ChainEvent::Accepted { block, data } => {
                    let events = {
                        let guard = children.read().unwrap();
                        assembler.assemble(chain_id, &data, &sources, &guard)
                    };
                    let watermark = Checkpoint::encode(CheckpointParts {
                        block_timestamp: block.timestamp,
                        chain_id,
                        block_number: block.number + 1,
                        transaction_index: 0,
                        event_kind: EventKind::Blocks,
                        event_index: 0,
                    });
                    if tx
                        .send(ChainMessage::Batch {
                            chain_id,
                            events,
                            watermark: Some(watermark),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    metrics.record_synced_block(chain_id, block.number);
                }
                ChainEvent::Reorg { common_ancestor, reorged_blocks } => {
                    warn!(
                        chain_id,
                        ancestor = common_ancestor.number,
                        depth = reorged_blocks.len(),
                        "propagating reorg to the event processor"
                    );
                    if tx
                        .send(ChainMessage::Reorg {
                            chain_id,
                            ancestor_block: common_ancestor.number,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ChainEvent::Finalize { block } => {
                    debug!(chain_id, finalized = block.number, "finalized head advanced");
                }
            }
        }

        match realtime_task.await {
            Ok(Ok(())) => Ok(tx),
            Ok(Err(e)) => Err((tx, e)),
            Err(join_error) => Err((
                tx,
                SyncError::Provider(crate::provider::ProviderError::Inconsistent(format!(
                    "realtime task panicked: {join_error}"
                ))),
            )),
        }
    }
}

#[derive(Default)]
struct ChainStream {
    buffer: Vec<Event>,
    watermark: Option<Checkpoint>,
    done: bool,
}

/// Drains chain batches in the configured order and drives user handlers.
struct EventProcessor<S> {
    ordering: ChainOrdering,
    chains: HashMap<u64, ChainStream>,
    caches: HashMap<u64, Arc<HandlerRpcCache<S>>>,
    store: Arc<S>,
    handlers: Arc<HandlerRegistry<S>>,
    metrics: Arc<dyn Metrics>,
}

impl<S: SyncStore + 'static> EventProcessor<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<ChainMessage>) -> Result<(), IndexerError> {
        while let Some(message) = rx.recv().await {
            match message {
                ChainMessage::Batch { chain_id, events, watermark } => {
                    self.on_batch(chain_id, events, watermark).await?;
                }
                ChainMessage::Reorg { chain_id, ancestor_block } => {
                    // Quiesce events past the ancestor, then rewind the store
                    // before admitting anything else.
                    if let Some(stream) = self.chains.get_mut(&chain_id) {
                        stream.buffer.retain(|e| {
                            e.block_number().is_none_or(|n| n <= ancestor_block)
                        });
                    }
                    self.store.revert_above(chain_id, ancestor_block).await?;
                    info!(chain_id, ancestor_block, "store rewound past reorg");
                }
                ChainMessage::Finished { chain_id } => {
                    if let Some(stream) = self.chains.get_mut(&chain_id) {
                        stream.done = true;
                    }
                    self.drain(None).await?;
                }
                ChainMessage::Fatal { chain_id, message } => {
                    return Err(IndexerError::ChainFailed { chain_id, message });
                }
            }
        }

        // All pipelines gone: flush whatever is left, in order.
        for stream in self.chains.values_mut() {
            stream.done = true;
        }
        self.drain(None).await
    }

    async fn on_batch(
        &mut self,
        chain_id: u64,
        events: Vec<Event>,
        watermark: Option<Checkpoint>,
    ) -> Result<(), IndexerError> {
        let (setup, ordered): (Vec<Event>, Vec<Event>) =
            events.into_iter().partition(|e| e.checkpoint().is_none());

        // Setup events bypass the checkpoint merge entirely.
        for event in setup {
            self.invoke(event).await?;
        }

        if !ordered.is_empty() {
            if let Some(cache) = self.caches.get(&chain_id) {
                cache.prefetch(&ordered).await;
            }
        }

        if let Some(stream) = self.chains.get_mut(&chain_id) {
            stream.buffer.extend(ordered);
            if let Some(watermark) = watermark {
                if stream.watermark.as_ref().is_none_or(|w| *w < watermark) {
                    stream.watermark = Some(watermark);
                }
            }
        }

        match self.ordering {
            ChainOrdering::Multichain => self.drain(Some(chain_id)).await,
            ChainOrdering::Omnichain => self.drain(None).await,
        }
    }

    /// Process buffered events. Multichain drains one chain in its own
    /// order; omnichain drains every chain up to the global frontier.
    async fn drain(&mut self, only_chain: Option<u64>) -> Result<(), IndexerError> {
        let mut ready: Vec<Event> = Vec::new();

        match only_chain {
            Some(chain_id) => {
                if let Some(stream) = self.chains.get_mut(&chain_id) {
                    ready.append(&mut stream.buffer);
                }
            }
            None => {
                // A chain with no watermark yet blocks the global frontier.
                if self.chains.values().any(|c| !c.done && c.watermark.is_none()) {
                    return Ok(());
                }
                let frontier =
                    self.chains.values().filter(|c| !c.done).filter_map(|c| c.watermark.clone()).min();

                for stream in self.chains.values_mut() {
                    match &frontier {
                        Some(frontier) => {
                            let buffered = std::mem::take(&mut stream.buffer);
                            let (take, keep): (Vec<Event>, Vec<Event>) =
                                buffered.into_iter().partition(|e| {
                                    e.checkpoint().is_some_and(|c| c < frontier)
                                });
                            ready.extend(take);
                            stream.buffer = keep;
                        }
                        // Every chain is done: flush it all.
                        None => ready.append(&mut stream.buffer),
                    }
                }
            }
        }

        if ready.is_empty() {
            return Ok(());
        }

        ready.sort_by(|a, b| a.checkpoint().cmp(&b.checkpoint()));
        let touched: std::collections::HashSet<u64> = ready.iter().map(|e| e.chain_id()).collect();

        for event in ready {
            self.invoke(event).await?;
        }
        for chain_id in touched {
            if let Some(cache) = self.caches.get(&chain_id) {
                cache.end_batch();
            }
        }
        Ok(())
    }

    /// Invoke the handler for one event, retrying retryable failures with
    /// capped exponential backoff and jitter.
    async fn invoke(&self, event: Event) -> Result<(), IndexerError> {
        let name = event.name().to_string();
        let chain_id = event.chain_id();
        let Some(handler) = self.handlers.get(&name) else {
            debug!(chain_id, event = name, "no handler registered, skipping event");
            return Ok(());
        };
        let Some(cache) = self.caches.get(&chain_id) else {
            return Ok(());
        };

        let handler = Arc::clone(handler);
        let event = Arc::new(event);
        let mut attempts = 0u32;
        let mut delay = HANDLER_RETRY_DELAY;

        loop {
            let context = EventContext {
                chain_id,
                event: Arc::clone(&event),
                client: HandlerClient::new(Arc::clone(cache), Arc::clone(&event)),
                store: Arc::clone(&self.store),
            };

            let started = Instant::now();
            match handler(context).await {
                Ok(()) => {
                    self.metrics.record_handler(&name, started.elapsed(), true);
                    return Ok(());
                }
                Err(HandlerError::Retryable(message)) if attempts + 1 < HANDLER_MAX_ATTEMPTS => {
                    attempts += 1;
                    self.metrics.record_handler(&name, started.elapsed(), false);
                    warn!(
                        chain_id,
                        event = name,
                        attempts,
                        error = message,
                        "handler failed, retrying"
                    );
                    let jitter =
                        Duration::from_millis(rand::rng().random_range(0..100));
                    tokio::time::sleep(delay + jitter).await;
                    delay = (delay * 2).min(HANDLER_RETRY_DELAY_MAX);
                }
                Err(e) => {
                    self.metrics.record_handler(&name, started.elapsed(), false);
                    error!(chain_id, event = name, error = %e, "handler failed permanently");
                    return Err(IndexerError::Handler { name, message: e.to_string() });
                }
            }
        }
    }
}
