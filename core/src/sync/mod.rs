pub mod historical;
pub mod realtime;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::info;

use crate::normalize::NormalizeError;
use crate::provider::{BlockId, ProviderError, RpcDispatcher};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Consistency(#[from] NormalizeError),

    #[error("reorg deeper than the unfinalized suffix on chain {chain_id}, finalized head {finalized_block}")]
    UnrecoverableReorg { chain_id: u64, finalized_block: u64 },

    #[error("head fetcher failing persistently on chain {chain_id}: {failures} failures over {minutes} minutes")]
    HeadFetcherDead { chain_id: u64, failures: u32, minutes: u64 },

    #[error("shutting down")]
    Shutdown,
}

impl SyncError {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, SyncError::Shutdown | SyncError::Provider(ProviderError::Shutdown))
    }
}

/// Whether the upstream supports block tracing, probed once per process.
///
/// Providers without the method degrade trace and transfer sources to empty
/// sets; selective failures after a successful probe are treated as
/// transient.
#[derive(Debug, Default)]
pub struct TraceSupport {
    probed: OnceCell<bool>,
}

impl TraceSupport {
    pub fn new() -> Arc<Self> {
        Arc::new(TraceSupport::default())
    }

    /// Force the answer, for tests and chains known ahead of time.
    pub fn fixed(supported: bool) -> Arc<Self> {
        let support = TraceSupport::default();
        support.probed.set(supported).ok();
        Arc::new(support)
    }

    pub async fn supported(&self, dispatcher: &RpcDispatcher) -> bool {
        *self
            .probed
            .get_or_init(|| async {
                match dispatcher.trace_block_transactions(BlockId::Latest).await {
                    Ok(_) => true,
                    Err(e) if e.is_method_unsupported() => {
                        info!(
                            chain_id = dispatcher.chain_id(),
                            "provider does not support block tracing, trace and transfer sources will be empty"
                        );
                        false
                    }
                    // Transient failure: assume support and let per-block
                    // fetches retry.
                    Err(_) => true,
                }
            })
            .await
    }
}
