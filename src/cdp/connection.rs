use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::cdp::messages::{
    command, evaluate_params, evaluate_value, parse_frame, session_storage_expr, CdpFrame,
    OUTER_HTML_EXPR,
};
use crate::config::{CDP_COMMAND_TIMEOUT_SECS, CHANNEL_CAPACITY};
use crate::error::{AppError, Result};
use crate::page::PageProbe;

type Pending = Arc<DashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>>;

/// Protocol event as delivered to the session owner.
#[derive(Debug, Clone, PartialEq)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

/// One DevTools WebSocket session. Commands are correlated by id; events go
/// to the receiver returned from `connect`, which closes when the socket does.
pub struct CdpSession {
    out_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    command_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpSession {
    pub async fn connect(ws_url: &str) -> Result<(Self, mpsc::Receiver<CdpEvent>)> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        let (event_tx, event_rx) = mpsc::channel::<CdpEvent>(CHANNEL_CAPACITY);
        let pending: Pending = Arc::new(DashMap::new());

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    debug!("[CDP] write failed: {e}");
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match parse_frame(&text) {
                        Some(CdpFrame::Response { id, result }) => {
                            if let Some((_, tx)) = reader_pending.remove(&id) {
                                let _ = tx.send(result);
                            }
                        }
                        Some(CdpFrame::Event { method, params }) => {
                            if let Err(e) = event_tx.try_send(CdpEvent { method, params }) {
                                warn!("[CDP] event channel full, dropping event: {e}");
                            }
                        }
                        None => {}
                    },
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        debug!("[CDP] read failed: {e}");
                        break;
                    }
                    Ok(_) => {}
                }
            }
            // Fail outstanding commands instead of letting them wait for the timeout.
            reader_pending.clear();
        });

        Ok((
            Self {
                out_tx,
                pending,
                next_id: AtomicU64::new(1),
                command_timeout: Duration::from_secs(CDP_COMMAND_TIMEOUT_SECS),
                reader,
                writer,
            },
            event_rx,
        ))
    }

    /// Sends a command and waits for its result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.out_tx.send(command(id, method, params)).await.is_err() {
            self.pending.remove(&id);
            return Err(AppError::ChannelClosed(format!("devtools socket closed before {method}")));
        }

        match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(msg))) => Err(AppError::Cdp(format!("{method}: {msg}"))),
            Ok(Err(_)) => Err(AppError::ChannelClosed(format!("devtools socket closed during {method}"))),
            Err(_) => {
                self.pending.remove(&id);
                Err(AppError::Cdp(format!("{method} timed out after {:?}", self.command_timeout)))
            }
        }
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self.send("Runtime.evaluate", evaluate_params(expression)).await?;
        evaluate_value(result)
    }

    pub async fn enable_network(&self) -> Result<()> {
        self.send("Network.enable", json!({})).await?;
        Ok(())
    }

    /// Exposes `binding` to the page and runs `script` in every new document
    /// and once in the current one.
    pub async fn install_page_hook(&self, binding: &str, script: &str) -> Result<()> {
        self.send("Runtime.enable", json!({})).await?;
        self.send("Runtime.addBinding", json!({ "name": binding })).await?;
        self.send("Page.addScriptToEvaluateOnNewDocument", json!({ "source": script }))
            .await?;
        self.evaluate(script).await?;
        Ok(())
    }

    pub async fn response_body(&self, request_id: &str) -> Result<Value> {
        self.send("Network.getResponseBody", json!({ "requestId": request_id }))
            .await
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl PageProbe for CdpSession {
    async fn outer_html(&self) -> Result<String> {
        match self.evaluate(OUTER_HTML_EXPR).await? {
            Value::String(html) => Ok(html),
            other => Err(AppError::Cdp(format!("outerHTML returned {other}"))),
        }
    }

    async fn session_storage(&self, key: &str) -> Result<Option<String>> {
        match self.evaluate(&session_storage_expr(key)).await? {
            Value::String(entry) => Ok(Some(entry)),
            Value::Null => Ok(None),
            other => Err(AppError::Cdp(format!("sessionStorage returned {other}"))),
        }
    }
}
