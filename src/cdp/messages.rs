use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{AppError, Result};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// One entry of the DevTools `/json` target list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    pub url: String,
    pub web_socket_debugger_url: Option<String>,
}

/// First attachable page whose URL contains `url_match`.
pub fn pick_target<'a>(targets: &'a [TargetInfo], url_match: &str) -> Option<&'a TargetInfo> {
    targets.iter().find(|t| {
        t.target_type == "page" && t.url.contains(url_match) && t.web_socket_debugger_url.is_some()
    })
}

/// Inbound DevTools frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CdpFrame {
    /// Reply to a command; `Err` carries the protocol error message.
    Response {
        id: u64,
        result: std::result::Result<Value, String>,
    },
    Event { method: String, params: Value },
}

/// Classifies a text frame. Unrecognized frames yield None.
pub fn parse_frame(text: &str) -> Option<CdpFrame> {
    let val: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            let n = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
            if n <= 5 || n % 1000 == 0 {
                warn!(failures = n, "[CDP] unparsable frame: {e}");
            }
            return None;
        }
    };

    if let Some(id) = val.get("id").and_then(Value::as_u64) {
        let result = match val.get("error") {
            Some(err) => Err(err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string())),
            None => Ok(val.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Some(CdpFrame::Response { id, result });
    }

    let method = val.get("method").and_then(Value::as_str)?;
    Some(CdpFrame::Event {
        method: method.to_string(),
        params: val.get("params").cloned().unwrap_or(Value::Null),
    })
}

pub fn command(id: u64, method: &str, params: Value) -> String {
    json!({ "id": id, "method": method, "params": params }).to_string()
}

// ---------------------------------------------------------------------------
// Network domain
// ---------------------------------------------------------------------------

/// The subset of `Network.*` events the relay reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// Outgoing request headers (`requestWillBeSent` or its `ExtraInfo`
    /// companion, which carries headers added outside the page).
    RequestHeaders { headers: Vec<(String, String)> },
    ResponseReceived { request_id: String, url: String },
    LoadingFinished { request_id: String },
    LoadingFailed { request_id: String },
}

fn header_pairs(obj: Option<&Value>) -> Vec<(String, String)> {
    obj.and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn request_id(params: &Value) -> Option<String> {
    params.get("requestId").and_then(Value::as_str).map(str::to_string)
}

pub fn parse_network_event(method: &str, params: &Value) -> Option<NetworkEvent> {
    match method {
        "Network.requestWillBeSent" => Some(NetworkEvent::RequestHeaders {
            headers: header_pairs(params.get("request").and_then(|r| r.get("headers"))),
        }),
        "Network.requestWillBeSentExtraInfo" => Some(NetworkEvent::RequestHeaders {
            headers: header_pairs(params.get("headers")),
        }),
        "Network.responseReceived" => Some(NetworkEvent::ResponseReceived {
            request_id: request_id(params)?,
            url: params.get("response")?.get("url")?.as_str()?.to_string(),
        }),
        "Network.loadingFinished" => Some(NetworkEvent::LoadingFinished {
            request_id: request_id(params)?,
        }),
        "Network.loadingFailed" => Some(NetworkEvent::LoadingFailed {
            request_id: request_id(params)?,
        }),
        _ => None,
    }
}

/// Extracts the body of a `Network.getResponseBody` result. Base64 bodies are
/// binary payloads and never carry operation batches.
pub fn response_body(result: &Value) -> Option<&str> {
    if result.get("base64Encoded").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    result.get("body").and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Runtime domain
// ---------------------------------------------------------------------------

pub const OUTER_HTML_EXPR: &str = "document.documentElement.outerHTML";

pub fn session_storage_expr(key: &str) -> String {
    // JSON string literals are valid JavaScript string literals.
    format!("window.sessionStorage.getItem({})", Value::String(key.to_string()))
}

/// Payload of a `Runtime.bindingCalled` event addressed to `binding`.
pub fn binding_payload<'a>(method: &str, params: &'a Value, binding: &str) -> Option<&'a str> {
    if method != "Runtime.bindingCalled" || params.get("name")?.as_str()? != binding {
        return None;
    }
    params.get("payload")?.as_str()
}

pub fn evaluate_params(expression: &str) -> Value {
    json!({ "expression": expression, "returnByValue": true })
}

/// Unwraps a `Runtime.evaluate` result into the returned value.
pub fn evaluate_value(result: Value) -> Result<Value> {
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .get("exception")
            .and_then(|e| e.get("description"))
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("evaluation threw");
        return Err(AppError::Cdp(text.to_string()));
    }
    Ok(result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .unwrap_or(Value::Null))
}
