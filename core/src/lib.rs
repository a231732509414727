// public
pub mod event;
pub mod filter;
pub mod handler_cache;
pub mod indexer;
pub mod manifest;
pub mod metrics;
pub mod normalize;
pub mod provider;
pub mod store;
pub mod sync;
pub mod types;

mod helpers;
pub use helpers::{padded_hex, selector_from_name, starknet_keccak};

mod system_state;
pub use system_state::{ShutdownHandle, ShutdownSignal};

pub use event::{BlockData, Event, EventAssembler};
pub use filter::{
    AddressCriteria, BlockFilter, ChildAddressLocation, ChildAddresses, Factory, Filter,
    Fragment, IntervalSet, LogFilter, TraceFilter, TransactionFilter, TransferFilter,
};
pub use handler_cache::{CacheMode, HandlerClient, HandlerRpcCache, ReadOptions};
pub use indexer::{
    EventContext, Handler, HandlerError, HandlerRegistry, HandlerResult, Indexer, IndexerError,
};
pub use manifest::{ChainConfig, ChainOrdering, Manifest, Source};
pub use metrics::{Metrics, NoopMetrics};
pub use provider::{BlockId, CallRequest, ProviderError, RpcDispatcher};
pub use store::{ChildAddressRow, InMemorySyncStore, StoreError, SyncStore};
pub use types::{Block, Checkpoint, EventKind, LightBlock, Log, Trace, Transaction};

// export 3rd party dependencies
pub use async_trait::async_trait;
pub use futures::FutureExt;
pub use starknet_types_core::felt::Felt;
pub use tokio::main as sindexer_main;
pub use tracing::{error as sindexer_error, info as sindexer_info};
