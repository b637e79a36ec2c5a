use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{MAX_CARD_DEPTH, SCANNER_DEDUP_CLEAR_SECS};
use crate::dom::card::scan_document;
use crate::intercept::ObservationTap;
use crate::page::PageProbe;
use crate::pipeline::normalizer::fingerprint;
use crate::scheduler::ticker;
use crate::types::{Observation, RawRecord};

/// Periodically snapshots the page and emits cards not seen in the current
/// dedup window. Never fails: a snapshot error only skips that tick.
pub struct DomScanner<P> {
    page: Arc<P>,
    tap: ObservationTap,
    scan_interval: Duration,
    clear_interval: Duration,
    /// Fingerprints emitted since the last clear.
    recent: HashSet<String>,
    scans: u64,
    emitted: u64,
}

impl<P: PageProbe> DomScanner<P> {
    pub fn new(page: Arc<P>, tap: ObservationTap, scan_interval: Duration) -> Self {
        Self {
            page,
            tap,
            scan_interval,
            clear_interval: Duration::from_secs(SCANNER_DEDUP_CLEAR_SECS),
            recent: HashSet::new(),
            scans: 0,
            emitted: 0,
        }
    }

    pub async fn run(mut self) {
        let mut scan_ticker = ticker(self.scan_interval);
        let mut clear_ticker = ticker(self.clear_interval);

        loop {
            tokio::select! {
                _ = scan_ticker.tick() => {
                    self.scan_once().await;
                }
                _ = clear_ticker.tick() => {
                    debug!(cleared = self.recent.len(), "[SCAN] dedup window cleared");
                    self.recent.clear();
                }
            }
        }
    }

    /// One scan pass. Returns how many records were emitted.
    pub async fn scan_once(&mut self) -> usize {
        self.scans += 1;
        let html = match self.page.outer_html().await {
            Ok(html) => html,
            Err(e) => {
                debug!("[SCAN] page snapshot unavailable: {e}");
                return 0;
            }
        };

        let fresh = self.keep_fresh(scan_document(&html, MAX_CARD_DEPTH));
        let count = fresh.len();
        if count > 0 {
            self.emitted += count as u64;
            self.tap.emit(Observation::Records { records: fresh });
        }

        if self.scans % 200 == 0 {
            info!(
                scans = self.scans,
                emitted = self.emitted,
                window = self.recent.len(),
                "[SCAN] {} scans | {} records emitted",
                self.scans,
                self.emitted,
            );
        }
        count
    }

    fn keep_fresh(&mut self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        records
            .into_iter()
            .filter(|record| match record {
                RawRecord::DomCard(e) | RawRecord::DomRow(e) => {
                    self.recent.insert(fingerprint(e.amount, e.is_buy, &e.method))
                }
                RawRecord::Network { .. } => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, Result};
    use crate::types::DomExtract;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const PAGE: &str = r#"<div><span>Banco XYZ</span><span>1,234.56 USDC</span><button>Aceptar</button></div>"#;

    /// Page fixture whose HTML can be swapped between scans.
    struct FixturePage {
        html: Mutex<Option<String>>,
    }

    impl FixturePage {
        fn new(html: &str) -> Arc<Self> {
            Arc::new(Self {
                html: Mutex::new(Some(html.to_string())),
            })
        }
    }

    #[async_trait]
    impl PageProbe for FixturePage {
        async fn outer_html(&self) -> Result<String> {
            self.html
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| AppError::Cdp("detached".to_string()))
        }

        async fn session_storage(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn scanner(page: Arc<FixturePage>) -> (DomScanner<FixturePage>, mpsc::Receiver<Observation>) {
        let (tx, rx) = mpsc::channel(16);
        (DomScanner::new(page, ObservationTap::new(tx), Duration::from_millis(1500)), rx)
    }

    #[tokio::test]
    async fn unchanged_card_is_emitted_once_per_window() {
        let (mut scanner, mut rx) = scanner(FixturePage::new(PAGE));

        assert_eq!(scanner.scan_once().await, 1);
        match rx.try_recv().unwrap() {
            Observation::Records { records } => {
                assert_eq!(
                    records,
                    vec![RawRecord::DomCard(DomExtract {
                        amount: 1234.56,
                        method: "Banco XYZ".to_string(),
                        is_buy: false,
                    })]
                );
            }
            other => panic!("expected Records, got {other:?}"),
        }

        assert_eq!(scanner.scan_once().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshot_errors_are_swallowed() {
        let page = FixturePage::new(PAGE);
        *page.html.lock().unwrap() = None;
        let (mut scanner, mut rx) = scanner(page);
        assert_eq!(scanner.scan_once().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn window_clears_on_its_own_period() {
        let (scanner, mut rx) = scanner(FixturePage::new(PAGE));
        let handle = tokio::spawn(scanner.run());

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(matches!(rx.try_recv(), Ok(Observation::Records { .. })));

        // Rescans inside the window emit nothing.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());

        // After the 30s clear the same card is reported again.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(matches!(rx.try_recv(), Ok(Observation::Records { .. })));

        handle.abort();
    }
}
