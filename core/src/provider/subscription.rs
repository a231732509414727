use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::system_state::ShutdownSignal;

use super::jsonrpc::RpcBlockHeader;
use super::{BlockId, RpcDispatcher};

/// Consecutive websocket failures tolerated before falling back to polling
/// for the rest of the process.
const WS_MAX_FAILURES: u32 = 5;
/// Pause between websocket reconnect attempts.
const WS_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Bounded buffer between the watcher task and the realtime engine.
const HEAD_CHANNEL_SIZE: usize = 64;

/// Delivers new chain heads to the realtime engine, over a websocket
/// subscription when one is configured and healthy, over HTTP polling
/// otherwise. The transport choice is invisible to the consumer.
pub struct HeadWatcher {
    rx: mpsc::Receiver<RpcBlockHeader>,
}

impl HeadWatcher {
    pub fn spawn(
        dispatcher: Arc<RpcDispatcher>,
        ws_url: Option<String>,
        polling_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> HeadWatcher {
        let (tx, rx) = mpsc::channel(HEAD_CHANNEL_SIZE);

        tokio::spawn(async move {
            if let Some(ws_url) = ws_url {
                let mut consecutive_failures = 0u32;
                while !shutdown.is_shutdown() && consecutive_failures < WS_MAX_FAILURES {
                    match run_websocket(&ws_url, &tx, &shutdown).await {
                        Ok(()) => return,
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                url = %ws_url,
                                consecutive_failures,
                                error = %e,
                                "new-heads websocket failed"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(WS_RECONNECT_DELAY) => {}
                                _ = shutdown.cancelled() => return,
                            }
                        }
                    }
                }
                if !shutdown.is_shutdown() {
                    info!(
                        chain_id = dispatcher.chain_id(),
                        "websocket subscription degraded, falling back to head polling"
                    );
                }
            }

            run_polling(dispatcher, &tx, polling_interval, &shutdown).await;
        });

        HeadWatcher { rx }
    }

    pub async fn recv(&mut self) -> Option<RpcBlockHeader> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn from_channel(rx: mpsc::Receiver<RpcBlockHeader>) -> HeadWatcher {
        HeadWatcher { rx }
    }
}

#[derive(Debug, thiserror::Error)]
enum WsError {
    #[error("websocket transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("subscription handshake failed: {0}")]
    Handshake(String),

    #[error("stream closed by remote")]
    Closed,
}

async fn run_websocket(
    ws_url: &str,
    tx: &mpsc::Sender<RpcBlockHeader>,
    shutdown: &ShutdownSignal,
) -> Result<(), WsError> {
    let (stream, _) = connect_async(ws_url).await?;
    let (mut sink, mut source) = stream.split();

    let subscribe = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "starknet_subscribeNewHeads",
        "params": {},
    });
    sink.send(Message::Text(subscribe.to_string())).await?;

    let mut subscription_id: Option<Value> = None;

    loop {
        let message = tokio::select! {
            message = source.next() => message,
            _ = shutdown.cancelled() => {
                // Best-effort unsubscribe before dropping the connection.
                if let Some(id) = subscription_id {
                    let unsubscribe = json!({
                        "jsonrpc": "2.0",
                        "id": 2,
                        "method": "starknet_unsubscribe",
                        "params": { "subscription_id": id },
                    });
                    let _ = sink.send(Message::Text(unsubscribe.to_string())).await;
                }
                let _ = sink.close().await;
                return Ok(());
            }
        };

        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(WsError::Transport(e)),
            None => return Err(WsError::Closed),
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err(WsError::Closed),
            _ => continue,
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable websocket frame");
                continue;
            }
        };

        // The first reply carries the subscription id; notifications carry
        // the header under params.result.
        if subscription_id.is_none() {
            if let Some(result) = value.get("result") {
                if value.get("method").is_none() {
                    subscription_id = Some(result.clone());
                    continue;
                }
            }
            if let Some(error) = value.get("error") {
                return Err(WsError::Handshake(error.to_string()));
            }
        }

        if value.get("method").and_then(Value::as_str) == Some("starknet_subscriptionNewHeads") {
            let header = value.pointer("/params/result").cloned().and_then(|raw| {
                serde_json::from_value::<RpcBlockHeader>(raw)
                    .map_err(|e| debug!(error = %e, "dropping malformed new-heads notification"))
                    .ok()
            });
            if let Some(header) = header {
                if tx.send(header).await.is_err() {
                    // Consumer gone; wind the subscription down.
                    return Ok(());
                }
            }
        }
    }
}

async fn run_polling(
    dispatcher: Arc<RpcDispatcher>,
    tx: &mpsc::Sender<RpcBlockHeader>,
    polling_interval: Duration,
    shutdown: &ShutdownSignal,
) {
    let mut last_hash = None;

    while !shutdown.is_shutdown() {
        match dispatcher.get_block_with_tx_hashes(BlockId::Latest).await {
            Ok(block) => {
                if last_hash != Some(block.block_hash) {
                    last_hash = Some(block.block_hash);
                    let header = RpcBlockHeader {
                        block_hash: block.block_hash,
                        parent_hash: block.parent_hash,
                        block_number: block.block_number,
                        timestamp: block.timestamp,
                    };
                    if tx.send(header).await.is_err() {
                        return;
                    }
                }
            }
            Err(super::ProviderError::Shutdown) => return,
            Err(e) => {
                error!(
                    chain_id = dispatcher.chain_id(),
                    error = %e,
                    "failed to poll latest block"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(polling_interval) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
