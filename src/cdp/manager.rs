use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::cdp::connection::{CdpEvent, CdpSession};
use crate::cdp::messages::{
    binding_payload, parse_network_event, pick_target, response_body, NetworkEvent, TargetInfo,
};
use crate::config::{Config, RECONNECT_BACKOFF_MS};
use crate::dom::DomScanner;
use crate::error::{AppError, Result};
use crate::intercept::{
    hook_script, Fetch, HookReport, HttpRequest, Inspector, ObservationTap, PAGE_BINDING,
};
use crate::pipeline::StoragePoller;
use crate::scheduler::Recurring;
use crate::types::TokenChannel;

/// Page sensors bound to one DevTools session. Dropping the set stops them.
struct PageSensors {
    scanner: JoinHandle<()>,
    _storage: Recurring,
}

impl Drop for PageSensors {
    fn drop(&mut self) {
        self.scanner.abort();
    }
}

/// Keeps a DevTools session attached to the trading page and runs every
/// page-side sensor over it. Reconnects with backoff when the page goes away.
pub struct CdpManager<F> {
    cdp_url: String,
    target_match: String,
    http: F,
    inspector: Arc<Inspector>,
    page_hook: String,
    tap: ObservationTap,
    storage_key: String,
    scan_interval: Duration,
    storage_poll_interval: Duration,
    health: Arc<HealthState>,
    sessions: u64,
}

impl<F: Fetch> CdpManager<F> {
    pub fn new(cfg: &Config, cdp_url: String, http: F, tap: ObservationTap, health: Arc<HealthState>) -> Self {
        Self {
            cdp_url,
            target_match: cfg.target_url_match.clone(),
            http,
            inspector: Arc::new(Inspector::new(tap.clone(), cfg.query_paths.clone())),
            page_hook: hook_script(&cfg.query_paths),
            tap,
            storage_key: cfg.token_storage_key.clone(),
            scan_interval: cfg.scan_interval,
            storage_poll_interval: cfg.storage_poll_interval,
            health,
            sessions: 0,
        }
    }

    pub async fn run(mut self) {
        let mut backoff_idx = 0usize;

        loop {
            match self.connect_once().await {
                Ok(()) => {
                    info!("[CDP] session closed");
                    backoff_idx = 0;
                }
                Err(e) => {
                    error!("[CDP] session error: {e}");
                }
            }
            self.health.set_cdp_connected(false);

            let delay_ms = RECONNECT_BACKOFF_MS
                .get(backoff_idx)
                .or(RECONNECT_BACKOFF_MS.last())
                .copied()
                .unwrap_or(1000);
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len().saturating_sub(1));

            warn!("[CDP] reconnecting in {delay_ms}ms");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Resolves the debugger WebSocket URL of the trading page.
    pub async fn discover(&self) -> Result<String> {
        let resp = self
            .http
            .fetch(HttpRequest::get(format!("{}/json", self.cdp_url)))
            .await?;
        if resp.status != 200 {
            return Err(AppError::Cdp(format!("target list returned HTTP {}", resp.status)));
        }
        let targets: Vec<TargetInfo> = serde_json::from_slice(&resp.body)?;
        let target = pick_target(&targets, &self.target_match).ok_or_else(|| {
            AppError::Cdp(format!(
                "no page target matching '{}' among {} targets",
                self.target_match,
                targets.len()
            ))
        })?;
        debug!(target = %target.id, url = %target.url, "[CDP] target selected");
        target
            .web_socket_debugger_url
            .clone()
            .ok_or_else(|| AppError::Cdp("target has no debugger url".to_string()))
    }

    async fn connect_once(&mut self) -> Result<()> {
        let ws_url = self.discover().await?;
        let (session, mut events) = CdpSession::connect(&ws_url).await?;
        let session = Arc::new(session);
        session.enable_network().await?;
        if let Err(e) = session.install_page_hook(PAGE_BINDING, &self.page_hook).await {
            warn!("[CDP] page request hook not installed, network listener only: {e}");
        }

        self.sessions += 1;
        self.health.set_cdp_connected(true);
        info!(sessions = self.sessions, "[CDP] attached to {ws_url}");

        let _sensors = self.start_sensors(&session);
        self.pump_events(&session, &mut events).await;
        Ok(())
    }

    fn start_sensors(&self, session: &Arc<CdpSession>) -> PageSensors {
        let scanner = DomScanner::new(Arc::clone(session), self.tap.clone(), self.scan_interval);
        let storage = StoragePoller::new(Arc::clone(session), self.storage_key.clone(), self.tap.clone());
        PageSensors {
            scanner: tokio::spawn(scanner.run()),
            _storage: storage.spawn(self.storage_poll_interval),
        }
    }

    /// Runs until the session's event stream ends.
    async fn pump_events(&self, session: &Arc<CdpSession>, events: &mut mpsc::Receiver<CdpEvent>) {
        // requestId -> URL of query responses still loading
        let mut awaiting_body: HashMap<String, String> = HashMap::new();

        while let Some(event) = events.recv().await {
            if let Some(payload) = binding_payload(&event.method, &event.params, PAGE_BINDING) {
                match HookReport::parse(payload) {
                    Some(report) => self.inspector.inspect_report(&report),
                    None => debug!("[CDP] unrecognized page hook report"),
                }
                continue;
            }
            match parse_network_event(&event.method, &event.params) {
                Some(NetworkEvent::RequestHeaders { headers }) => {
                    self.inspector.inspect_headers(
                        headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                        TokenChannel::NetworkListener,
                    );
                }
                Some(NetworkEvent::ResponseReceived { request_id, url }) => {
                    if self.inspector.is_query_url(&url) {
                        awaiting_body.insert(request_id, url);
                    }
                }
                Some(NetworkEvent::LoadingFinished { request_id }) => {
                    if let Some(url) = awaiting_body.remove(&request_id) {
                        self.fetch_body(session, request_id, url);
                    }
                }
                Some(NetworkEvent::LoadingFailed { request_id }) => {
                    awaiting_body.remove(&request_id);
                }
                None => {}
            }
        }
    }

    fn fetch_body(&self, session: &Arc<CdpSession>, request_id: String, url: String) {
        let session = Arc::clone(session);
        let inspector = Arc::clone(&self.inspector);
        tokio::spawn(async move {
            match session.response_body(&request_id).await {
                Ok(result) => {
                    if let Some(body) = response_body(&result) {
                        inspector.inspect_body(&url, body.as_bytes());
                    }
                }
                Err(e) => debug!(url = %url, "[CDP] response body unavailable: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::HttpResponse;
    use crate::types::{Observation, RawRecord};
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    const CARD_PAGE: &str = r#"<html><body><div class="offer"><p>Banco XYZ</p><p>1,234.56 USDC</p><button>Aceptar</button></div></body></html>"#;

    struct TargetList {
        body: Value,
        status: u16,
    }

    #[async_trait]
    impl Fetch for TargetList {
        async fn fetch(&self, req: HttpRequest) -> Result<HttpResponse> {
            assert_eq!(req.url, "http://devtools.test/json");
            Ok(HttpResponse {
                status: self.status,
                url: req.url,
                headers: Vec::new(),
                body: self.body.to_string().into_bytes(),
            })
        }
    }

    fn config() -> Config {
        Config {
            log_level: "debug".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            cdp_url: Some("http://devtools.test".to_string()),
            target_url_match: "p2p".to_string(),
            query_paths: vec!["/p2p/operations".to_string()],
            token_storage_key: "token".to_string(),
            consumer_allowed_hosts: vec!["localhost".to_string()],
            scan_interval: Duration::from_millis(100),
            storage_poll_interval: Duration::from_secs(60),
        }
    }

    fn manager(body: Value, status: u16) -> (CdpManager<TargetList>, mpsc::Receiver<Observation>, Arc<HealthState>) {
        let (tx, rx) = mpsc::channel(64);
        let health = Arc::new(HealthState::new());
        let cfg = config();
        let m = CdpManager::new(
            &cfg,
            "http://devtools.test".to_string(),
            TargetList { body, status },
            ObservationTap::new(tx),
            Arc::clone(&health),
        );
        (m, rx, health)
    }

    /// DevTools endpoint that plays back one query response and serves a
    /// static page through Runtime.evaluate.
    async fn fake_page() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let req: Value = serde_json::from_str(text.as_str()).unwrap();
                let id = req["id"].as_u64().unwrap();
                let mut frames = Vec::new();
                match req["method"].as_str().unwrap() {
                    "Network.enable" => {
                        frames.push(json!({"id": id, "result": {}}));
                        frames.push(json!({"method": "Network.requestWillBeSent", "params": {
                            "requestId": "r1",
                            "request": {"url": "https://exchange.example/p2p/operations", "headers": {"Authorization": "Bearer abc123"}}
                        }}));
                        frames.push(json!({"method": "Network.responseReceived", "params": {
                            "requestId": "r1", "response": {"url": "https://exchange.example/p2p/operations?page=1"}
                        }}));
                        frames.push(json!({"method": "Network.loadingFinished", "params": {"requestId": "r1"}}));
                    }
                    "Runtime.addBinding" => {
                        assert_eq!(req["params"]["name"], PAGE_BINDING);
                        frames.push(json!({"id": id, "result": {}}));
                        let report = json!({
                            "kind": "request",
                            "url": "https://exchange.example/p2p/operations",
                            "headers": {"authorization": "Bearer page-token"}
                        });
                        frames.push(json!({"method": "Runtime.bindingCalled", "params": {
                            "name": PAGE_BINDING, "payload": report.to_string(), "executionContextId": 1
                        }}));
                    }
                    "Network.getResponseBody" => {
                        assert_eq!(req["params"]["requestId"], "r1");
                        let body = json!({"data": {"operations": [
                            {"id": "op-1", "grossAmount": 50.0, "paymentMethodName": "Nequi", "side": "BUY"}
                        ]}});
                        frames.push(json!({"id": id, "result": {"body": body.to_string(), "base64Encoded": false}}));
                    }
                    "Runtime.evaluate" => {
                        let value = if req["params"]["expression"].as_str().unwrap().contains("outerHTML") {
                            json!(CARD_PAGE)
                        } else {
                            Value::Null
                        };
                        frames.push(json!({"id": id, "result": {"result": {"value": value}}}));
                    }
                    _ => frames.push(json!({"id": id, "result": {}})),
                }
                for frame in frames {
                    if ws.send(Message::Text(frame.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
        });
        format!("ws://{addr}/devtools/page/ABC")
    }

    #[tokio::test]
    async fn discovery_picks_the_trading_page() {
        let (m, _, _) = manager(
            json!([
                {"id": "1", "type": "page", "url": "https://news.example", "webSocketDebuggerUrl": "ws://x/1"},
                {"id": "2", "type": "page", "url": "https://exchange.example/p2p", "webSocketDebuggerUrl": "ws://x/2"}
            ]),
            200,
        );
        assert_eq!(m.discover().await.unwrap(), "ws://x/2");
    }

    #[tokio::test]
    async fn discovery_fails_without_a_matching_page() {
        let (m, _, _) = manager(json!([{"id": "1", "type": "page", "url": "https://news.example"}]), 200);
        assert!(matches!(m.discover().await, Err(AppError::Cdp(_))));

        let (m, _, _) = manager(json!([]), 500);
        assert!(matches!(m.discover().await, Err(AppError::Cdp(msg)) if msg.contains("500")));
    }

    #[tokio::test]
    async fn attached_session_feeds_every_sensor() {
        let ws_url = fake_page().await;
        let (m, mut rx, health) = manager(
            json!([{"id": "p", "type": "page", "url": "https://exchange.example/p2p", "webSocketDebuggerUrl": ws_url}]),
            200,
        );
        let handle = tokio::spawn(m.run());

        let mut tokens = Vec::new();
        let mut network = None;
        let mut dom = None;
        tokio::time::timeout(Duration::from_secs(5), async {
            while tokens.len() < 2 || network.is_none() || dom.is_none() {
                match rx.recv().await.unwrap() {
                    Observation::Token { channel, raw } => tokens.push((channel, raw)),
                    Observation::Records { records } => match records.first() {
                        Some(RawRecord::Network { payload }) => network = Some(payload.clone()),
                        Some(other) => dom = Some(other.clone()),
                        None => {}
                    },
                }
            }
        })
        .await
        .expect("all three sensors reported");

        assert!(tokens.contains(&(TokenChannel::NetworkListener, "Bearer abc123".to_string())));
        assert!(tokens.contains(&(TokenChannel::PageHeader, "Bearer page-token".to_string())));
        assert_eq!(network.unwrap()["id"], "op-1");
        assert!(matches!(dom, Some(RawRecord::DomCard(ref e)) if e.method == "Banco XYZ"));
        assert!(health.cdp_connected());

        handle.abort();
    }
}
