use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::config::UNKNOWN_METHOD;
use crate::state::OperationWindow;
use crate::types::{now_ms, DomExtract, Operation, RawRecord, Source};

/// Characters of the method label that take part in the fingerprint.
const METHOD_PREFIX_LEN: usize = 8;

const ID_KEYS: &[&str] = &["id", "operationId", "orderId", "uuid"];
const AMOUNT_KEYS: &[&str] = &["grossAmount", "amount", "total"];
const METHOD_KEYS: &[&str] = &["paymentMethodName", "method", "paymentMethod"];
const SIDE_KEYS: &[&str] = &["side", "type", "direction"];

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Stable dedup key built from normalized fields only, never from the channel.
pub fn fingerprint(amount: f64, is_buy: bool, method: &str) -> String {
    let prefix: String = method
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .take(METHOD_PREFIX_LEN)
        .collect();
    let side = if is_buy { "buy" } else { "sell" };
    format!("{amount:.2}:{side}:{prefix}")
}

/// Parses decimal text, removing grouping separators. `1,234.56` → 1234.56.
/// Returns None for unparsable, non-finite or non-positive values.
pub fn parse_decimal(text: &str) -> Option<f64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let value = match compact.parse::<f64>() {
        Ok(v) => v,
        Err(_) => ungroup(&compact)?.parse::<f64>().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Rewrites grouped digits to plain `digits[.d]` form. A trailing separator
/// followed by one or two digits is the decimal point; any other separator
/// groups thousands.
fn ungroup(s: &str) -> Option<String> {
    if !s.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }
    let decimal_at = s.rfind(['.', ',']).filter(|&i| {
        let tail = &s[i + 1..];
        (1..=2).contains(&tail.len()) && tail.chars().all(|c| c.is_ascii_digit())
    });
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.char_indices() {
        match c {
            '.' | ',' if Some(i) == decimal_at => out.push('.'),
            '.' | ',' => {}
            _ => out.push(c),
        }
    }
    Some(out)
}

fn first_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

fn value_amount(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|x| x.is_finite() && *x > 0.0),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(o) => o.get("name").and_then(value_text),
        _ => None,
    }
}

fn network_is_buy(obj: &Map<String, Value>) -> bool {
    if let Some(flag) = obj.get("isBuy").and_then(Value::as_bool) {
        return flag;
    }
    first_field(obj, SIDE_KEYS)
        .and_then(Value::as_str)
        .is_some_and(|s| matches!(s.to_ascii_lowercase().as_str(), "buy" | "add" | "deposit"))
}

/// Maps any extraction shape to the canonical record. Records without a
/// positive amount are rejected.
pub fn canonicalize(raw: &RawRecord) -> Option<Operation> {
    match raw {
        RawRecord::Network { payload } => {
            let obj = payload.as_object()?;
            let amount = first_field(obj, AMOUNT_KEYS).and_then(value_amount)?;
            let method = first_field(obj, METHOD_KEYS)
                .and_then(value_text)
                .unwrap_or_else(|| UNKNOWN_METHOD.to_string());
            let is_buy = network_is_buy(obj);
            let fp = fingerprint(amount, is_buy, &method);
            let id = first_field(obj, ID_KEYS)
                .and_then(value_text)
                .unwrap_or_else(|| fp.clone());
            let status = obj
                .get("status")
                .and_then(value_text)
                .unwrap_or_else(|| "OPEN".to_string());
            Some(Operation {
                id,
                fingerprint: fp,
                method,
                amount,
                is_buy,
                status,
                source: Source::Network,
                detected_at_ms: now_ms(),
            })
        }
        RawRecord::DomCard(extract) => from_dom(extract, Source::DomCard),
        RawRecord::DomRow(extract) => from_dom(extract, Source::DomRow),
    }
}

fn from_dom(extract: &DomExtract, source: Source) -> Option<Operation> {
    if !(extract.amount.is_finite() && extract.amount > 0.0) {
        return None;
    }
    let method = if extract.method.trim().is_empty() {
        UNKNOWN_METHOD.to_string()
    } else {
        extract.method.trim().to_string()
    };
    let fp = fingerprint(extract.amount, extract.is_buy, &method);
    Some(Operation {
        id: fp.clone(),
        fingerprint: fp,
        method,
        amount: extract.amount,
        is_buy: extract.is_buy,
        status: "Detected".to_string(),
        source,
        detected_at_ms: now_ms(),
    })
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Outcome of feeding one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Forward(Operation),
    Duplicate,
    Rejected,
}

/// Canonicalizes records and suppresses fingerprints already forwarded within
/// the active window.
pub struct Normalizer {
    window: Arc<OperationWindow>,
}

impl Normalizer {
    pub fn new(window: Arc<OperationWindow>) -> Self {
        Self { window }
    }

    pub fn accept(&mut self, raw: &RawRecord, now: Instant) -> Verdict {
        let Some(op) = canonicalize(raw) else {
            return Verdict::Rejected;
        };
        if self.window.contains_active(&op.fingerprint, now) {
            return Verdict::Duplicate;
        }
        self.window.insert(op.clone(), now);
        Verdict::Forward(op)
    }

    /// Withdraws a fingerprint whose forward never reached the broker.
    pub fn forget(&mut self, fingerprint: &str) {
        self.window.remove(fingerprint);
    }

    pub fn prune(&mut self, now: Instant) -> usize {
        self.window.prune(now)
    }

    pub fn window_ttl(&self) -> std::time::Duration {
        self.window.ttl()
    }
}
