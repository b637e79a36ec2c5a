use std::time::Duration;

use crate::error::{AppError, Result};

/// Envelope tag that lets consumer code tell relay messages apart from arbitrary page messages.
pub const EXTENSION_MARKER: &str = "P2P_RELAY_EXTENSION";

/// Durable key holding the last observed bearer credential.
pub const CREDENTIAL_KEY: &str = "lastKnownToken";

/// Ancestor levels walked from a currency text node while looking for an action button.
pub const MAX_CARD_DEPTH: usize = 8;

/// Scanner-local recent-id set is cleared on this period.
pub const SCANNER_DEDUP_CLEAR_SECS: u64 = 30;

/// Fingerprints forwarded by the normalizer are suppressed for this long.
pub const NORMALIZER_WINDOW_SECS: u64 = 120;

/// Bridge re-registration period. Registration is idempotent.
pub const REGISTER_INTERVAL_SECS: u64 = 5;

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Per-tab outbound queue. A full queue drops messages for that tab only.
pub const CONSUMER_QUEUE_CAPACITY: usize = 256;

/// How long a DevTools command may wait for its response.
pub const CDP_COMMAND_TIMEOUT_SECS: u64 = 10;

/// DevTools reconnect backoff values in milliseconds.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[500, 1000, 2000, 5000];

/// Payload keys that may hold the operation array, newest schema first.
pub const NETWORK_ARRAY_KEYS: &[&str] = &["operations", "orders", "items", "data", "results", "content"];

/// Placeholder label when no payment method can be recovered.
pub const UNKNOWN_METHOD: &str = "Desconocido";

/// DOM heuristic vocabulary.
pub mod dom_vocab {
    /// Substrings that mark a text node as carrying an amount.
    pub const CURRENCY_MARKERS: &[&str] = &["USDC", "USDT", "USD"];

    /// Action-button labels that identify an operation card (lowercase).
    pub const ACTION_LABELS: &[&str] = &["aceptar", "accept", "seleccionar", "select", "tomar", "take"];

    /// Keywords marking the buy direction (lowercase).
    pub const BUY_KEYWORDS: &[&str] = &["agregar", "add"];

    /// Lines whose first word is one of these never become the method label.
    pub const STOP_WORDS: &[&str] = &[
        // currency codes
        "usdc", "usdt", "usd", "ars", "cop", "mxn", "pen", "clp", "brl", "ves", "eur",
        // action verbs
        "aceptar", "accept", "seleccionar", "select", "tomar", "take", "agregar", "add",
        "retirar", "withdraw", "comprar", "buy", "vender", "sell", "enviar", "send",
        "cancelar", "cancel", "ver", "view",
        // month abbreviations
        "ene", "jan", "feb", "mar", "abr", "apr", "may", "jun", "jul", "ago", "aug",
        "sep", "sept", "oct", "nov", "dic", "dec",
        // date and amount fragments
        "de", "del", "hace", "hoy", "today", "ayer", "yesterday", "monto", "amount",
        "total", "comisión", "comision", "fee",
    ];

    /// Fixed cell positions used for tabular layouts.
    pub const ROW_METHOD_CELL: usize = 0;
    pub const ROW_AMOUNT_CELL: usize = 1;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// DevTools HTTP endpoint (CDP_URL). None disables page observation.
    pub cdp_url: Option<String>,
    /// Substring selecting the trading page among DevTools targets (TARGET_URL_MATCH)
    pub target_url_match: String,
    /// Response URL fragments inspected for operation batches (QUERY_PATHS, comma-separated)
    pub query_paths: Vec<String>,
    /// Session-storage key probed for the credential (TOKEN_STORAGE_KEY)
    pub token_storage_key: String,
    /// Consumer tab hosts allowed to receive broadcasts (CONSUMER_ALLOWED_HOSTS, comma-separated)
    pub consumer_allowed_hosts: Vec<String>,
    pub scan_interval: Duration,
    pub storage_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "relay.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            cdp_url: std::env::var("CDP_URL")
                .ok()
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            target_url_match: std::env::var("TARGET_URL_MATCH").unwrap_or_else(|_| "p2p".to_string()),
            query_paths: split_list(
                &std::env::var("QUERY_PATHS")
                    .unwrap_or_else(|_| "/p2p/operations,/p2p/orders,/operations/search".to_string()),
            ),
            token_storage_key: std::env::var("TOKEN_STORAGE_KEY").unwrap_or_else(|_| "token".to_string()),
            consumer_allowed_hosts: split_list(
                &std::env::var("CONSUMER_ALLOWED_HOSTS")
                    .unwrap_or_else(|_| "vercel.app,netlify.app,localhost,127.0.0.1".to_string()),
            ),
            scan_interval: Duration::from_millis(
                std::env::var("SCAN_INTERVAL_MS")
                    .unwrap_or_else(|_| "1500".to_string())
                    .parse::<u64>()
                    .unwrap_or(1500)
                    .max(100),
            ),
            storage_poll_interval: Duration::from_secs(
                std::env::var("STORAGE_POLL_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse::<u64>()
                    .unwrap_or(5)
                    .max(1),
            ),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
