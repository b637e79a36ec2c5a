use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::intercept::ObservationTap;
use crate::page::PageProbe;
use crate::pipeline::token::token_from_storage;
use crate::scheduler::Recurring;
use crate::types::{Observation, TokenChannel};

/// Fallback token channel: reads the page's session-storage entry on a slow
/// period. Repeats are left to the token tracker.
pub struct StoragePoller<P> {
    page: Arc<P>,
    key: String,
    tap: ObservationTap,
}

impl<P: PageProbe> StoragePoller<P> {
    pub fn new(page: Arc<P>, key: impl Into<String>, tap: ObservationTap) -> Self {
        Self {
            page,
            key: key.into(),
            tap,
        }
    }

    /// Returns true if a token was found and emitted.
    pub async fn poll_once(&self) -> bool {
        let entry = match self.page.session_storage(&self.key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                debug!(key = %self.key, "[STORAGE] probe failed: {e}");
                return false;
            }
        };
        match token_from_storage(&entry) {
            Some(token) => {
                self.tap.emit(Observation::Token {
                    channel: TokenChannel::SessionStorage,
                    raw: token,
                });
                true
            }
            None => false,
        }
    }

    pub fn spawn(self, period: Duration) -> Recurring {
        let poller = Arc::new(self);
        Recurring::spawn("storage-poll", period, true, move || {
            let poller = Arc::clone(&poller);
            async move {
                poller.poll_once().await;
            }
        })
    }
}
