use std::time::Duration;

/// Outcome label attached to every RPC request sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcOutcome {
    Success,
    Error,
    RateLimited,
    Timeout,
}

/// Where a handler RPC read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHit {
    Memory,
    PrefetchDatabase,
    Database,
    Network,
}

/// Metrics sink port. The core records through this; wiring it to a real
/// exporter happens outside.
pub trait Metrics: Send + Sync {
    fn record_rpc_request(&self, chain_id: u64, method: &str, outcome: RpcOutcome, latency: Duration);

    fn record_handler(&self, event_name: &str, duration: Duration, ok: bool);

    fn record_cache_access(&self, chain_id: u64, hit: CacheHit);

    fn record_synced_block(&self, chain_id: u64, block_number: u64);
}

/// Default sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_rpc_request(
        &self,
        _chain_id: u64,
        _method: &str,
        _outcome: RpcOutcome,
        _latency: Duration,
    ) {
    }

    fn record_handler(&self, _event_name: &str, _duration: Duration, _ok: bool) {}

    fn record_cache_access(&self, _chain_id: u64, _hit: CacheHit) {}

    fn record_synced_block(&self, _chain_id: u64, _block_number: u64) {}
}
