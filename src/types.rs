use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Which extraction channel produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Network,
    DomCard,
    DomRow,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Source::Network => "network",
            Source::DomCard => "dom_card",
            Source::DomRow => "dom_row",
        };
        write!(f, "{s}")
    }
}

/// Canonical operation record, one per distinct underlying offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Provider-assigned id when the network path has one, else the fingerprint.
    pub id: String,
    /// Channel-independent dedup key.
    pub fingerprint: String,
    #[serde(alias = "paymentMethodName")]
    pub method: String,
    #[serde(alias = "grossAmount")]
    pub amount: f64,
    pub is_buy: bool,
    pub status: String,
    pub source: Source,
    /// Milliseconds since UNIX epoch when the relay first accepted the record.
    pub detected_at_ms: u64,
}

// ---------------------------------------------------------------------------
// Raw extraction results
// ---------------------------------------------------------------------------

/// Fields recovered from one DOM card or table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomExtract {
    pub amount: f64,
    pub method: String,
    pub is_buy: bool,
}

/// One raw record as produced by an extraction channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RawRecord {
    /// Element of an intercepted response array, shape as the provider sent it.
    Network { payload: serde_json::Value },
    DomCard(DomExtract),
    DomRow(DomExtract),
}

impl RawRecord {
    pub fn source(&self) -> Source {
        match self {
            RawRecord::Network { .. } => Source::Network,
            RawRecord::DomCard(_) => Source::DomCard,
            RawRecord::DomRow(_) => Source::DomRow,
        }
    }
}

/// Token observation points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenChannel {
    /// Authorization header seen by a wrapped request primitive.
    PageHeader,
    /// Authorization header seen by the DevTools network listener.
    NetworkListener,
    /// Session-storage probe.
    SessionStorage,
}

impl std::fmt::Display for TokenChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenChannel::PageHeader => "page_header",
            TokenChannel::NetworkListener => "network_listener",
            TokenChannel::SessionStorage => "session_storage",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Channel message types
// ---------------------------------------------------------------------------

/// Routed from the page-side sensors to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    /// Raw credential text, bearer prefix possibly still attached.
    Token { channel: TokenChannel, raw: String },
    Records { records: Vec<RawRecord> },
}

/// Opaque per-connection tab identity. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TabId(pub u64);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabRef {
    pub id: TabId,
    /// Address of the consumer tab, matched against the allow-list.
    pub url: String,
}

/// Messages the broker delivers to consumer tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerMessage {
    TokenUpdate { token: String },
    OperationUpdate { operation: Operation },
}

/// Same-tab envelope handed to consumer application code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub payload: ConsumerMessage,
}

impl Envelope {
    pub fn wrap(payload: ConsumerMessage) -> Self {
        Self {
            source: crate::config::EXTENSION_MARKER.to_string(),
            payload,
        }
    }
}

/// Inbox of the broker actor.
#[derive(Debug)]
pub enum BrokerCommand {
    TokenEvent {
        token: String,
        observed_at: std::time::Instant,
    },
    OperationEvent {
        operation: Operation,
        observed_at: std::time::Instant,
    },
    Register {
        tab: TabRef,
        sink: mpsc::Sender<ConsumerMessage>,
    },
    Unregister(TabId),
    ForceSync,
}

/// Signals a consumer tab sends to its bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerSignal {
    ClientReady,
    ForceSync,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_marker_and_tagged_payload() {
        let env = Envelope::wrap(ConsumerMessage::TokenUpdate { token: "abc123".to_string() });
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["source"], crate::config::EXTENSION_MARKER);
        assert_eq!(json["payload"]["type"], "TOKEN_UPDATE");
        assert_eq!(json["payload"]["token"], "abc123");
    }

    #[test]
    fn consumer_signal_parses_client_ready() {
        let sig: ConsumerSignal = serde_json::from_str(r#"{"type":"CLIENT_READY"}"#).unwrap();
        assert_eq!(sig, ConsumerSignal::ClientReady);
    }

    #[test]
    fn operation_accepts_provider_field_names() {
        let raw = r#"{"id":"x","fingerprint":"f","paymentMethodName":"Banco","grossAmount":10.5,
            "isBuy":true,"status":"OPEN","source":"network","detectedAtMs":1}"#;
        let op: Operation = serde_json::from_str(raw).unwrap();
        assert_eq!(op.method, "Banco");
        assert!((op.amount - 10.5).abs() < 1e-9);
    }
}
