use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::intercept::hook::HookReport;
use crate::intercept::sniff::{bearer_header, matches_query_path, operation_batch};
use crate::types::{Observation, RawRecord, TokenChannel};

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Request primitive used by the relay's own outbound calls.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, req: HttpRequest) -> Result<HttpResponse>;
}

// ---------------------------------------------------------------------------
// ObservationTap
// ---------------------------------------------------------------------------

/// Non-blocking sink for observations. A full or closed channel drops the
/// observation; the caller is never delayed.
#[derive(Clone)]
pub struct ObservationTap {
    tx: mpsc::Sender<Observation>,
    dropped: Arc<AtomicU64>,
}

impl ObservationTap {
    pub fn new(tx: mpsc::Sender<Observation>) -> Self {
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, obs: Observation) {
        if let Err(e) = self.tx.try_send(obs) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped <= 10 || dropped % 1000 == 0 {
                warn!(dropped, "observation dropped: {e}");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Inspector
// ---------------------------------------------------------------------------

/// Inspection shared by the page hook and the DevTools network listener.
pub struct Inspector {
    tap: ObservationTap,
    query_paths: Vec<String>,
}

impl Inspector {
    pub fn new(tap: ObservationTap, query_paths: Vec<String>) -> Self {
        Self { tap, query_paths }
    }

    pub fn is_query_url(&self, url: &str) -> bool {
        matches_query_path(url, &self.query_paths)
    }

    /// Emits a token observation if the headers carry a bearer credential.
    pub fn inspect_headers<'a, I>(&self, headers: I, channel: TokenChannel)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        if let Some(raw) = bearer_header(headers) {
            self.tap.emit(Observation::Token {
                channel,
                raw: raw.to_string(),
            });
        }
    }

    /// Emits one unfiltered batch per matching response. Unparsable or
    /// unrecognized bodies produce nothing.
    pub fn inspect_body(&self, url: &str, body: &[u8]) {
        if !self.is_query_url(url) {
            return;
        }
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) else {
            debug!(url, "query response body is not JSON");
            return;
        };
        let Some(items) = operation_batch(&json) else {
            debug!(url, "query response carries no known operation array");
            return;
        };
        let records = items
            .iter()
            .cloned()
            .map(|payload| RawRecord::Network { payload })
            .collect();
        self.tap.emit(Observation::Records { records });
    }

    /// Feeds one page hook report. Request headers are the page-header token
    /// channel; responses go through the same body inspection as the listener.
    pub fn inspect_report(&self, report: &HookReport) {
        match report {
            HookReport::Request { headers, .. } => self.inspect_headers(
                headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                TokenChannel::PageHeader,
            ),
            HookReport::Response { url, body } => self.inspect_body(url, body.as_bytes()),
        }
    }
}

// ---------------------------------------------------------------------------
// reqwest-backed primitives
// ---------------------------------------------------------------------------

/// `Fetch` over one `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn execute(client: &reqwest::Client, req: HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| AppError::Config(format!("invalid HTTP method {}: {e}", req.method)))?;
        let mut builder = client.request(method, &req.url);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse {
            status,
            url,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Fetch for ReqwestTransport {
    async fn fetch(&self, req: HttpRequest) -> Result<HttpResponse> {
        Self::execute(&self.client, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn inspector() -> (Inspector, mpsc::Receiver<Observation>) {
        let (tx, rx) = mpsc::channel(16);
        let inspector = Inspector::new(ObservationTap::new(tx), vec!["/p2p/operations".to_string()]);
        (inspector, rx)
    }

    fn request(headers: &[(&str, &str)]) -> HookReport {
        HookReport::Request {
            url: "https://x.test/p2p/operations?page=1".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn response(url: &str, body: &str) -> HookReport {
        HookReport::Response {
            url: url.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn page_reports_emit_token_and_unfiltered_batch() {
        let (inspector, mut rx) = inspector();
        inspector.inspect_report(&request(&[("Authorization", "Bearer abc123")]));
        inspector.inspect_report(&response(
            "https://x.test/p2p/operations?page=1",
            r#"{"operations":[{"id":"a","amount":"10.00"},{"id":"b","amount":"0"}]}"#,
        ));

        match rx.try_recv().unwrap() {
            Observation::Token { channel, raw } => {
                assert_eq!(channel, TokenChannel::PageHeader);
                assert_eq!(raw, "Bearer abc123");
            }
            other => panic!("expected Token, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Observation::Records { records } => assert_eq!(records.len(), 2, "batch is unfiltered"),
            other => panic!("expected Records, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_query_responses_bad_bodies_and_other_schemes_emit_nothing() {
        let (inspector, mut rx) = inspector();
        inspector.inspect_report(&request(&[("Authorization", "Basic dXNlcjpwYXNz")]));
        inspector.inspect_report(&response("https://x.test/profile", r#"{"operations":[{}]}"#));
        inspector.inspect_report(&response("https://x.test/p2p/operations", "<html>"));
        inspector.inspect_report(&response("https://x.test/p2p/operations", r#"{"unexpected":[]}"#));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let tap = ObservationTap::new(tx);
        for _ in 0..3 {
            tap.emit(Observation::Records { records: vec![] });
        }
        assert_eq!(tap.dropped(), 2);
    }
}
