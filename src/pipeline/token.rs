use serde_json::Value;

use crate::types::TokenChannel;

/// Strips the bearer prefix and surrounding whitespace. Empty results are rejected.
pub fn normalize_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = match trimmed.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => &trimmed[7..],
        _ => trimmed,
    };
    let token = stripped.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Interprets a session-storage entry, which may be a raw token, a JSON
/// string literal, or an object holding the token under a known key.
pub fn token_from_storage(entry: &str) -> Option<String> {
    match serde_json::from_str::<Value>(entry.trim()) {
        Ok(Value::String(s)) => normalize_token(&s),
        Ok(Value::Object(map)) => ["token", "accessToken", "access_token"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .and_then(normalize_token),
        Ok(_) => None,
        Err(_) => normalize_token(entry),
    }
}

/// Shortened form safe for logs.
pub fn redact(token: &str) -> String {
    let head: String = token.chars().take(4).collect();
    format!("{head}…({} chars)", token.chars().count())
}

/// Deduplicates token observations across every channel: only a value that
/// differs from the last one seen is emitted.
#[derive(Debug, Default)]
pub struct TokenTracker {
    last: Option<String>,
    observed: u64,
    emitted: u64,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the normalized token when it is new.
    pub fn observe(&mut self, _channel: TokenChannel, raw: &str) -> Option<String> {
        self.observed += 1;
        let token = normalize_token(raw)?;
        if self.last.as_deref() == Some(token.as_str()) {
            return None;
        }
        self.last = Some(token.clone());
        self.emitted += 1;
        Some(token)
    }

    /// Clears `token` if it is the held value, so its next observation is
    /// emitted again.
    pub fn forget(&mut self, token: &str) {
        if self.last.as_deref() == Some(token) {
            self.last = None;
        }
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}
