use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::tab::Bridge;
use crate::config::CONSUMER_QUEUE_CAPACITY;
use crate::types::{BrokerCommand, ConsumerSignal, TabRef};

/// Pumps one consumer WebSocket through a dedicated `Bridge`.
/// Consumer frames become signals, bridge envelopes become text frames.
pub async fn serve_socket(socket: WebSocket, tab: TabRef, broker_tx: mpsc::Sender<BrokerCommand>) {
    let tab_id = tab.id;
    info!(tab = %tab_id, url = %tab.url, "[BRIDGE] consumer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let (out_tx, mut out_rx) = mpsc::channel(CONSUMER_QUEUE_CAPACITY);
    let bridge = tokio::spawn(Bridge::new(tab, broker_tx, signal_rx, out_tx).run());

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ConsumerSignal>(&text) {
                        Ok(signal) => {
                            if signal_tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(tab = %tab_id, "[BRIDGE] ignoring consumer frame: {e}"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(tab = %tab_id, "[BRIDGE] socket error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            envelope = out_rx.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(tab = %tab_id, "[BRIDGE] envelope serialization failed: {e}");
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    // Closing both ends lets the bridge finish and unregister.
    drop(signal_tx);
    drop(out_rx);
    let _ = bridge.await;
    info!(tab = %tab_id, "[BRIDGE] consumer disconnected");
}
