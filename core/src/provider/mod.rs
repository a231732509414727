mod endpoint;
pub mod jsonrpc;
mod subscription;

pub use jsonrpc::{
    BlockId, CallRequest, EventFilterParams, RpcBlockHeader, RpcBlockTrace, RpcBlockWithReceipts,
    RpcBlockWithTxHashes, RpcBlockWithTxs, RpcEmittedEvent, RpcEventsPage, RpcTransaction,
    RpcTransactionReceipt,
};
pub use subscription::HeadWatcher;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use endpoint::{CooldownReason, Endpoint};
use jsonrpc::{JsonRpcErrorObject, JsonRpcResponse};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use starknet_types_core::felt::Felt;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::metrics::{Metrics, NoopMetrics, RpcOutcome};
use crate::system_state::ShutdownSignal;

/// Maximum retries per logical request.
const MAX_RETRIES: u32 = 9;
/// Base backoff between retries.
const RETRY_BACKOFF_BASE_MS: u64 = 125;
/// Per-call transport timeout.
const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);
/// Probability of picking a uniformly random available endpoint.
const EXPLORATION_RATE: f64 = 0.1;
/// A candidate must beat the incumbent's expected latency by this much.
const LATENCY_HURDLE: f64 = 0.1;
/// Poll cadence while no endpoint is available.
const NO_ENDPOINT_POLL: Duration = Duration::from_millis(20);
const NO_ENDPOINT_WARN_AFTER: Duration = Duration::from_secs(5);
const NO_ENDPOINT_STUCK_AFTER: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("endpoint rate limited")]
    RateLimited,

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("failed to decode rpc response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("rpc error {code}: {message}")]
    JsonRpc { code: i64, message: String },

    #[error("block not found")]
    BlockNotFound,

    #[error("requested block range too large: {message}")]
    RangeExceeded {
        message: String,
        /// End block the provider said it could serve, when it gave one.
        suggested_to: Option<u64>,
        /// Range width the provider said it allows, when it gave one.
        suggested_width: Option<u64>,
    },

    #[error("provider returned inconsistent data: {0}")]
    Inconsistent(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ProviderError> },

    #[error("shutting down")]
    Shutdown,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transport(_)
            | ProviderError::Timeout
            | ProviderError::RateLimited
            | ProviderError::BlockNotFound => true,
            ProviderError::HttpStatus(status) => !matches!(status, 404 | 405 | 501 | 505),
            ProviderError::JsonRpc { code, message } => {
                let message = message.to_lowercase();
                // Method-not-found, unsupported methods or versions, and
                // reverts never succeed on retry.
                *code != -32601
                    && !message.contains("method not found")
                    && !message.contains("method not supported")
                    && !message.contains("unsupported")
                    && !message.contains("revert")
            }
            ProviderError::Decode(_)
            | ProviderError::RangeExceeded { .. }
            | ProviderError::Inconsistent(_)
            | ProviderError::RetriesExhausted { .. }
            | ProviderError::Shutdown => false,
        }
    }

    /// Whether the upstream signalled it lacks the method entirely, used by
    /// the trace-support probe.
    pub fn is_method_unsupported(&self) -> bool {
        match self {
            ProviderError::JsonRpc { code, message } => {
                let message = message.to_lowercase();
                *code == -32601
                    || message.contains("method not found")
                    || message.contains("method not supported")
            }
            ProviderError::HttpStatus(status) => matches!(status, 404 | 405 | 501),
            ProviderError::RetriesExhausted { last, .. } => last.is_method_unsupported(),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatcherBuildError {
    #[error("invalid rpc url '{0}': {1}")]
    InvalidUrl(String, String),

    #[error("no rpc urls configured")]
    NoUrls,

    #[error("could not build http client: {0}")]
    HttpClient(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Raise a typed `BlockNotFound` (and retry) when the result is `null`.
    pub retry_null_block: bool,
}

/// Adaptive multi-endpoint JSON-RPC dispatcher.
///
/// Routes each request to the endpoint most likely to answer fast, keeps
/// per-endpoint rate limits that adapt to observed provider behavior, cools
/// endpoints down on rate-limit errors and timeouts, and retries transient
/// failures with exponential backoff.
pub struct RpcDispatcher {
    chain_id: u64,
    endpoints: Vec<Arc<Endpoint>>,
    http: reqwest::Client,
    shutdown: ShutdownSignal,
    metrics: Arc<dyn Metrics>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("chain_id", &self.chain_id)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

impl RpcDispatcher {
    pub fn new(
        chain_id: u64,
        rpc_urls: &[String],
        shutdown: ShutdownSignal,
    ) -> Result<Self, DispatcherBuildError> {
        Self::with_metrics(chain_id, rpc_urls, shutdown, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        chain_id: u64,
        rpc_urls: &[String],
        shutdown: ShutdownSignal,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, DispatcherBuildError> {
        if rpc_urls.is_empty() {
            return Err(DispatcherBuildError::NoUrls);
        }
        let endpoints = rpc_urls
            .iter()
            .map(|raw| {
                Url::parse(raw)
                    .map(|url| Arc::new(Endpoint::new(url)))
                    .map_err(|e| DispatcherBuildError::InvalidUrl(raw.clone(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| DispatcherBuildError::HttpClient(e.to_string()))?;

        Ok(RpcDispatcher {
            chain_id,
            endpoints,
            http,
            shutdown,
            metrics,
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ProviderError> {
        self.request_with_options(method, params, RequestOptions::default()).await
    }

    pub async fn request_with_options<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<T, ProviderError> {
        let mut attempts = 0u32;
        loop {
            if self.shutdown.is_shutdown() {
                return Err(ProviderError::Shutdown);
            }

            let error = match self.request_once(method, &params, options).await {
                Ok(value) => {
                    return serde_json::from_value(value).map_err(ProviderError::Decode);
                }
                Err(error) => error,
            };

            // Range errors go straight back to the caller so the historical
            // engine can re-chunk; retrying the same window cannot help.
            if matches!(error, ProviderError::RangeExceeded { .. }) || !error.is_retryable() {
                return Err(error);
            }

            attempts += 1;
            if attempts > MAX_RETRIES {
                return Err(ProviderError::RetriesExhausted {
                    attempts,
                    last: Box::new(error),
                });
            }

            let backoff =
                Duration::from_millis(RETRY_BACKOFF_BASE_MS << (attempts - 1).min(16));
            debug!(
                chain_id = self.chain_id,
                method,
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "retrying rpc request"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return Err(ProviderError::Shutdown),
            }
        }
    }

    async fn request_once(
        &self,
        method: &str,
        params: &Value,
        options: RequestOptions,
    ) -> Result<Value, ProviderError> {
        let endpoint = self.pick_endpoint().await?;
        endpoint.begin_request(crate::helpers::now_secs());
        let started = Instant::now();
        let result = self.send(&endpoint, method, params).await;
        let elapsed = started.elapsed();
        endpoint.end_request();

        match result {
            Ok(value) => {
                endpoint.record_success(elapsed);
                if value.is_null() && options.retry_null_block {
                    self.metrics.record_rpc_request(
                        self.chain_id,
                        method,
                        RpcOutcome::Error,
                        elapsed,
                    );
                    return Err(ProviderError::BlockNotFound);
                }
                self.metrics.record_rpc_request(self.chain_id, method, RpcOutcome::Success, elapsed);
                Ok(value)
            }
            Err(error) => {
                let outcome = match &error {
                    ProviderError::RateLimited => {
                        self.schedule_reactivation(&endpoint, CooldownReason::RateLimited);
                        RpcOutcome::RateLimited
                    }
                    ProviderError::Timeout => {
                        self.schedule_reactivation(&endpoint, CooldownReason::Timeout);
                        RpcOutcome::Timeout
                    }
                    _ => {
                        endpoint.record_failure(elapsed);
                        RpcOutcome::Error
                    }
                };
                self.metrics.record_rpc_request(self.chain_id, method, outcome, elapsed);
                Err(error)
            }
        }
    }

    fn schedule_reactivation(&self, endpoint: &Arc<Endpoint>, reason: CooldownReason) {
        let delay = endpoint.cooldown(reason);
        let endpoint = Arc::clone(endpoint);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => endpoint.reactivate(),
                _ = shutdown.cancelled() => {}
            }
        });
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: &Value,
    ) -> Result<Value, ProviderError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(endpoint.url.clone())
            .json(&body)
            .timeout(TRANSPORT_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            return Err(ProviderError::HttpStatus(status.as_u16()));
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Transport(e.to_string())
            }
        })?;
        let parsed: JsonRpcResponse = serde_json::from_str(&text)?;

        if let Some(error) = parsed.error {
            return Err(classify_rpc_error(method, error));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    /// Select an available endpoint, polling until one frees up.
    async fn pick_endpoint(&self) -> Result<Arc<Endpoint>, ProviderError> {
        let started = Instant::now();
        let mut warned_waiting = false;
        let mut warned_stuck = false;

        loop {
            if self.shutdown.is_shutdown() {
                return Err(ProviderError::Shutdown);
            }

            let now_sec = crate::helpers::now_secs();
            let available: Vec<&Arc<Endpoint>> =
                self.endpoints.iter().filter(|e| e.is_available(now_sec)).collect();

            if available.is_empty() {
                if !warned_waiting && started.elapsed() >= NO_ENDPOINT_WARN_AFTER {
                    warn!(
                        chain_id = self.chain_id,
                        "all rpc endpoints saturated or cooling down, waiting for capacity"
                    );
                    warned_waiting = true;
                }
                if !warned_stuck && started.elapsed() >= NO_ENDPOINT_STUCK_AFTER {
                    warn!(
                        chain_id = self.chain_id,
                        waited_secs = started.elapsed().as_secs(),
                        "unable to pick an rpc endpoint, requests are stalled"
                    );
                    warned_stuck = true;
                }
                tokio::select! {
                    _ = tokio::time::sleep(NO_ENDPOINT_POLL) => continue,
                    _ = self.shutdown.cancelled() => return Err(ProviderError::Shutdown),
                }
            }

            if available.len() == 1 {
                return Ok(Arc::clone(available[0]));
            }

            // Exploration keeps latency stats fresh for endpoints that would
            // otherwise never be sampled again.
            if rand::random::<f64>() < EXPLORATION_RATE {
                let index = rand::rng().random_range(0..available.len());
                return Ok(Arc::clone(available[index]));
            }

            let mut best = available[0];
            for candidate in &available[1..] {
                let best_latency = best.expected_latency();
                let candidate_latency = candidate.expected_latency();

                if candidate_latency < best_latency * (1.0 - LATENCY_HURDLE) {
                    best = candidate;
                } else if best_latency < candidate_latency * (1.0 - LATENCY_HURDLE) {
                    // Incumbent clears the hurdle.
                } else if candidate.active_connections() < best.active_connections() {
                    best = candidate;
                }
            }
            return Ok(Arc::clone(best));
        }
    }
}

/// Typed method surface over [`RpcDispatcher::request`].
impl RpcDispatcher {
    pub async fn block_number(&self) -> Result<u64, ProviderError> {
        self.request("starknet_blockNumber", json!([])).await
    }

    pub async fn get_block_with_txs(
        &self,
        block_id: BlockId,
    ) -> Result<RpcBlockWithTxs, ProviderError> {
        self.request_with_options(
            "starknet_getBlockWithTxs",
            json!({ "block_id": block_id.to_value() }),
            RequestOptions { retry_null_block: true },
        )
        .await
    }

    pub async fn get_block_with_tx_hashes(
        &self,
        block_id: BlockId,
    ) -> Result<RpcBlockWithTxHashes, ProviderError> {
        self.request_with_options(
            "starknet_getBlockWithTxHashes",
            json!({ "block_id": block_id.to_value() }),
            RequestOptions { retry_null_block: true },
        )
        .await
    }

    pub async fn get_block_with_receipts(
        &self,
        block_id: BlockId,
    ) -> Result<RpcBlockWithReceipts, ProviderError> {
        self.request_with_options(
            "starknet_getBlockWithReceipts",
            json!({ "block_id": block_id.to_value() }),
            RequestOptions { retry_null_block: true },
        )
        .await
    }

    pub async fn get_transaction_by_hash(
        &self,
        transaction_hash: &Felt,
    ) -> Result<RpcTransaction, ProviderError> {
        self.request(
            "starknet_getTransactionByHash",
            json!({ "transaction_hash": transaction_hash }),
        )
        .await
    }

    pub async fn get_transaction_receipt(
        &self,
        transaction_hash: &Felt,
    ) -> Result<RpcTransactionReceipt, ProviderError> {
        self.request(
            "starknet_getTransactionReceipt",
            json!({ "transaction_hash": transaction_hash }),
        )
        .await
    }

    pub async fn get_events(
        &self,
        filter: &EventFilterParams,
    ) -> Result<RpcEventsPage, ProviderError> {
        self.request("starknet_getEvents", filter.to_value()).await
    }

    pub async fn trace_block_transactions(
        &self,
        block_id: BlockId,
    ) -> Result<Vec<RpcBlockTrace>, ProviderError> {
        self.request(
            "starknet_traceBlockTransactions",
            json!({ "block_id": block_id.to_value() }),
        )
        .await
    }

    pub async fn call(
        &self,
        request: &CallRequest,
        block_id: BlockId,
    ) -> Result<Vec<Felt>, ProviderError> {
        self.request(
            "starknet_call",
            json!({ "request": request, "block_id": block_id.to_value() }),
        )
        .await
    }

    pub async fn get_storage_at(
        &self,
        contract_address: &Felt,
        key: &Felt,
        block_id: BlockId,
    ) -> Result<Felt, ProviderError> {
        self.request(
            "starknet_getStorageAt",
            json!({
                "contract_address": contract_address,
                "key": key,
                "block_id": block_id.to_value(),
            }),
        )
        .await
    }

    pub async fn get_class_at(
        &self,
        contract_address: &Felt,
        block_id: BlockId,
    ) -> Result<Value, ProviderError> {
        self.request(
            "starknet_getClassAt",
            json!({ "contract_address": contract_address, "block_id": block_id.to_value() }),
        )
        .await
    }

    pub async fn get_class_hash_at(
        &self,
        contract_address: &Felt,
        block_id: BlockId,
    ) -> Result<Felt, ProviderError> {
        self.request(
            "starknet_getClassHashAt",
            json!({ "contract_address": contract_address, "block_id": block_id.to_value() }),
        )
        .await
    }

    pub async fn get_nonce(
        &self,
        contract_address: &Felt,
        block_id: BlockId,
    ) -> Result<Felt, ProviderError> {
        self.request(
            "starknet_getNonce",
            json!({ "contract_address": contract_address, "block_id": block_id.to_value() }),
        )
        .await
    }

    pub async fn rpc_chain_id(&self) -> Result<Felt, ProviderError> {
        self.request("starknet_chainId", json!([])).await
    }

    pub async fn spec_version(&self) -> Result<String, ProviderError> {
        self.request("starknet_specVersion", json!([])).await
    }

    pub async fn syncing(&self) -> Result<Value, ProviderError> {
        self.request("starknet_syncing", json!([])).await
    }
}

static SUGGESTED_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    // Providers that answer with a workable range, e.g.
    // "try with this block range [0x64, 0x2bc]".
    Regex::new(r"block range\D*\[?0x([0-9a-fA-F]+)\s*,\s*0x([0-9a-fA-F]+)\]?").expect("static regex")
});

static SUGGESTED_WIDTH_RE: Lazy<Regex> = Lazy::new(|| {
    // Providers that answer with a maximum width, e.g. "limited to a 1,000
    // block range" or "exceeds the limit of 500 blocks".
    Regex::new(r"(?:limited to a|limit of|max(?:imum)? of)\s*([\d,.]+)").expect("static regex")
});

fn classify_rpc_error(method: &str, error: JsonRpcErrorObject) -> ProviderError {
    let message = error.message.clone();
    let haystack = {
        let mut h = message.to_lowercase();
        if let Some(data) = &error.data {
            h.push(' ');
            h.push_str(&data.to_string().to_lowercase());
        }
        h
    };

    if error.code == 429
        || haystack.contains("rate limit")
        || haystack.contains("too many requests")
    {
        return ProviderError::RateLimited;
    }

    if method == "starknet_getEvents" && is_range_error(&haystack) {
        let suggested_to = SUGGESTED_RANGE_RE
            .captures(&haystack)
            .and_then(|c| c.get(2))
            .and_then(|m| u64::from_str_radix(m.as_str(), 16).ok());
        let suggested_width = SUGGESTED_WIDTH_RE
            .captures(&haystack)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(&[',', '.'][..], "").parse::<u64>().ok());

        return ProviderError::RangeExceeded { message, suggested_to, suggested_width };
    }

    ProviderError::JsonRpc { code: error.code, message }
}

fn is_range_error(haystack: &str) -> bool {
    (haystack.contains("block range") || haystack.contains("page size") || haystack.contains("blocks"))
        && (haystack.contains("too large")
            || haystack.contains("too wide")
            || haystack.contains("too big")
            || haystack.contains("limited to")
            || haystack.contains("limit of")
            || haystack.contains("exceed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn error(code: i64, message: &str) -> JsonRpcErrorObject {
        JsonRpcErrorObject { code, message: message.to_string(), data: None }
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_rpc_error("starknet_call", error(-32000, "Rate limit exceeded"));
        assert!(matches!(err, ProviderError::RateLimited));
    }

    #[test]
    fn test_classify_range_error_with_suggestion() {
        let err = classify_rpc_error(
            "starknet_getEvents",
            error(-32602, "requested range too large, try with this block range [0x64, 0x1f3]"),
        );
        match err {
            ProviderError::RangeExceeded { suggested_to, .. } => {
                assert_eq!(suggested_to, Some(0x1f3));
            }
            other => panic!("expected range error, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_range_error_with_width() {
        let err = classify_rpc_error(
            "starknet_getEvents",
            error(-32602, "query exceeds the limit of 1,000 blocks"),
        );
        match err {
            ProviderError::RangeExceeded { suggested_width, .. } => {
                assert_eq!(suggested_width, Some(1000));
            }
            other => panic!("expected range error, got {other:?}"),
        }
    }

    #[test]
    fn test_range_error_outside_get_events_is_plain_rpc_error() {
        let err = classify_rpc_error(
            "starknet_call",
            error(-32602, "block range too large"),
        );
        assert!(matches!(err, ProviderError::JsonRpc { .. }));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::BlockNotFound.is_retryable());
        assert!(ProviderError::HttpStatus(500).is_retryable());

        assert!(!ProviderError::HttpStatus(404).is_retryable());
        assert!(!ProviderError::HttpStatus(501).is_retryable());
        assert!(!ProviderError::JsonRpc { code: -32601, message: "Method not found".into() }
            .is_retryable());
        assert!(!ProviderError::JsonRpc {
            code: -32000,
            message: "execution reverted: insufficient balance".into()
        }
        .is_retryable());
        assert!(ProviderError::JsonRpc { code: -32000, message: "internal error".into() }
            .is_retryable());
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": 42 }).to_string())
            .expect(1)
            .create_async()
            .await;

        let dispatcher =
            RpcDispatcher::new(1, &[server.url()], ShutdownSignal::never()).unwrap();
        let result: u64 = dispatcher.request("starknet_blockNumber", json!([])).await.unwrap();

        assert_eq!(result, 42);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_method_not_found_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": { "code": -32601, "message": "Method not found" }
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let dispatcher =
            RpcDispatcher::new(1, &[server.url()], ShutdownSignal::never()).unwrap();
        let result: Result<u64, _> =
            dispatcher.request("starknet_traceBlockTransactions", json!([])).await;

        let err = result.unwrap_err();
        assert!(err.is_method_unsupported());
        assert!(matches!(err, ProviderError::JsonRpc { code: -32601, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_null_block_raises_block_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({ "jsonrpc": "2.0", "id": 1, "result": null }).to_string())
            .expect_at_least(1)
            .create_async()
            .await;

        let dispatcher =
            RpcDispatcher::new(1, &[server.url()], ShutdownSignal::never()).unwrap();

        // Without the option a null result is passed through.
        let plain = dispatcher
            .request_once("starknet_getBlockWithTxs", &json!({ "block_id": "latest" }), RequestOptions::default())
            .await
            .unwrap();
        assert!(plain.is_null());

        // With it the dispatcher raises the typed error so retry kicks in.
        let result = dispatcher
            .request_once(
                "starknet_getBlockWithTxs",
                &json!({ "block_id": "latest" }),
                RequestOptions { retry_null_block: true },
            )
            .await;
        assert!(matches!(result, Err(ProviderError::BlockNotFound)));
    }
}
