use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::broker::allow_list::AllowList;
use crate::db::CredentialStore;
use crate::pipeline::token::redact;
use crate::types::{BrokerCommand, ConsumerMessage, Operation, TabId, TabRef};

struct TabEntry {
    url: String,
    sink: mpsc::Sender<ConsumerMessage>,
}

/// Sole owner of the credential and the registry of consumer tabs. Every
/// mutation arrives through its command channel.
pub struct Broker {
    cmd_rx: mpsc::Receiver<BrokerCommand>,
    store: CredentialStore,
    allow_list: AllowList,
    credential: Option<String>,
    tabs: BTreeMap<TabId, TabEntry>,
    health: Arc<HealthState>,
    latency: Arc<LatencyStats>,
    /// Messages dropped because a tab's queue was full.
    dropped_deliveries: u64,
    broadcasts: u64,
}

impl Broker {
    /// Loads the persisted credential. A read failure starts the broker empty.
    pub async fn new(
        cmd_rx: mpsc::Receiver<BrokerCommand>,
        store: CredentialStore,
        allow_list: AllowList,
        health: Arc<HealthState>,
        latency: Arc<LatencyStats>,
    ) -> Self {
        let credential = match store.load().await {
            Ok(c) => c,
            Err(e) => {
                error!("[BROKER] failed to load stored credential: {e}");
                None
            }
        };
        if let Some(token) = &credential {
            info!(token = %redact(token), "[BROKER] restored credential");
        }
        health.set_has_credential(credential.is_some());

        Self {
            cmd_rx,
            store,
            allow_list,
            credential,
            tabs: BTreeMap::new(),
            health,
            latency,
            dropped_deliveries: 0,
            broadcasts: 0,
        }
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle(cmd).await;
        }
        info!(broadcasts = self.broadcasts, "[BROKER] command channel closed, stopping");
    }

    pub async fn handle(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::TokenEvent { token, observed_at } => {
                self.on_token_event(token, observed_at).await
            }
            BrokerCommand::OperationEvent {
                operation,
                observed_at,
            } => self.on_operation_event(operation, observed_at),
            BrokerCommand::Register { tab, sink } => self.on_register(tab, sink),
            BrokerCommand::Unregister(id) => self.on_unregister(id),
            BrokerCommand::ForceSync => self.on_force_sync(),
        }
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    async fn on_token_event(&mut self, token: String, observed_at: Instant) {
        if self.credential.as_deref() == Some(token.as_str()) {
            return;
        }
        if let Err(e) = self.store.save(&token).await {
            error!("[BROKER] failed to persist credential: {e}");
        }
        info!(token = %redact(&token), tabs = self.tabs.len(), "[BROKER] credential updated");
        self.credential = Some(token.clone());
        self.health.set_has_credential(true);
        self.broadcast(ConsumerMessage::TokenUpdate { token });
        self.latency.record(observed_at.elapsed());
    }

    fn on_operation_event(&mut self, operation: Operation, observed_at: Instant) {
        debug!(id = %operation.id, tabs = self.tabs.len(), "[BROKER] fanning out operation");
        self.broadcast(ConsumerMessage::OperationUpdate { operation });
        self.latency.record(observed_at.elapsed());
    }

    fn on_register(&mut self, tab: TabRef, sink: mpsc::Sender<ConsumerMessage>) {
        if !self.allow_list.allows(&tab.url) {
            debug!(tab = %tab.id, url = %tab.url, "[BROKER] registration ignored, host not allow-listed");
            return;
        }
        let previous = self.tabs.insert(tab.id, TabEntry { url: tab.url, sink });
        if previous.is_none() {
            info!(tab = %tab.id, tabs = self.tabs.len(), "[BROKER] tab registered");
        }
        self.health.set_registered_tabs(self.tabs.len());
    }

    fn on_unregister(&mut self, id: TabId) {
        if let Some(entry) = self.tabs.remove(&id) {
            info!(tab = %id, url = %entry.url, tabs = self.tabs.len(), "[BROKER] tab unregistered");
        }
        self.health.set_registered_tabs(self.tabs.len());
    }

    fn on_force_sync(&mut self) {
        match self.credential.clone() {
            Some(token) => {
                debug!(tabs = self.tabs.len(), "[BROKER] force sync");
                self.broadcast(ConsumerMessage::TokenUpdate { token });
            }
            None => debug!("[BROKER] force sync requested with no credential"),
        }
    }

    /// Delivers to every tab independently. Closed tabs are removed, full
    /// queues lose this message only. Returns the number of tabs reached.
    fn broadcast(&mut self, msg: ConsumerMessage) -> usize {
        self.broadcasts += 1;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, entry) in &self.tabs {
            match entry.sink.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped_deliveries += 1;
                    warn!(tab = %id, dropped = self.dropped_deliveries, "[BROKER] tab queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            self.tabs.remove(&id);
            debug!(tab = %id, "[BROKER] tab channel closed, removed");
        }
        self.health.set_registered_tabs(self.tabs.len());

        if self.broadcasts % 100 == 0 {
            info!(
                broadcasts = self.broadcasts,
                tabs = self.tabs.len(),
                dropped = self.dropped_deliveries,
                "[BROKER] {} broadcasts | {} tabs | {} dropped deliveries",
                self.broadcasts,
                self.tabs.len(),
                self.dropped_deliveries,
            );
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::credential::memory_pool;
    use crate::types::Source;

    async fn broker() -> (Broker, CredentialStore, Arc<HealthState>) {
        let (_tx, rx) = mpsc::channel(16);
        let store = CredentialStore::new(memory_pool().await);
        let health = Arc::new(HealthState::new());
        let broker = Broker::new(
            rx,
            store.clone(),
            AllowList::new(["vercel.app", "localhost"]),
            Arc::clone(&health),
            Arc::new(LatencyStats::new()),
        )
        .await;
        (broker, store, health)
    }

    async fn register(broker: &mut Broker, id: u64, url: &str, capacity: usize) -> mpsc::Receiver<ConsumerMessage> {
        let (sink, rx) = mpsc::channel(capacity);
        broker
            .handle(BrokerCommand::Register {
                tab: TabRef { id: TabId(id), url: url.to_string() },
                sink,
            })
            .await;
        rx
    }

    fn token_event(token: &str) -> BrokerCommand {
        BrokerCommand::TokenEvent {
            token: token.to_string(),
            observed_at: Instant::now(),
        }
    }

    fn operation() -> Operation {
        Operation {
            id: "op-1".to_string(),
            fingerprint: "1234.56:sell:bancoxyz".to_string(),
            method: "Banco XYZ".to_string(),
            amount: 1234.56,
            is_buy: false,
            status: "OPEN".to_string(),
            source: Source::Network,
            detected_at_ms: 1,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ConsumerMessage>) -> Vec<ConsumerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn distinct_transitions_broadcast_and_repeats_do_not() {
        let (mut broker, store, health) = broker().await;
        let mut tab = register(&mut broker, 1, "https://app.vercel.app", 16).await;

        for t in ["A", "A", "B", "A", "A"] {
            broker.handle(token_event(t)).await;
        }

        let tokens: Vec<ConsumerMessage> = drain(&mut tab);
        assert_eq!(
            tokens,
            ["A", "B", "A"]
                .iter()
                .map(|t| ConsumerMessage::TokenUpdate { token: t.to_string() })
                .collect::<Vec<_>>()
        );
        assert_eq!(broker.credential(), Some("A"));
        assert_eq!(store.load().await.unwrap().as_deref(), Some("A"));
        assert!(health.has_credential());
    }

    #[tokio::test]
    async fn only_allow_listed_tabs_receive_operations() {
        let (mut broker, _, health) = broker().await;
        let mut t1 = register(&mut broker, 1, "http://localhost:5173/", 16).await;
        let mut t2 = register(&mut broker, 2, "https://example.com/", 16).await;
        assert_eq!(broker.tab_count(), 1);
        assert_eq!(health.registered_tabs(), 1);

        broker
            .handle(BrokerCommand::OperationEvent { operation: operation(), observed_at: Instant::now() })
            .await;

        assert_eq!(drain(&mut t1), vec![ConsumerMessage::OperationUpdate { operation: operation() }]);
        assert!(drain(&mut t2).is_empty());
    }

    #[tokio::test]
    async fn closed_tab_does_not_break_delivery_to_others() {
        let (mut broker, _, _) = broker().await;
        let closed = register(&mut broker, 1, "https://a.vercel.app", 16).await;
        let mut open = register(&mut broker, 2, "https://b.vercel.app", 16).await;
        drop(closed);

        broker
            .handle(BrokerCommand::OperationEvent { operation: operation(), observed_at: Instant::now() })
            .await;

        assert_eq!(drain(&mut open).len(), 1);
        assert_eq!(broker.tab_count(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_tab_only() {
        let (mut broker, _, _) = broker().await;
        let mut slow = register(&mut broker, 1, "https://a.vercel.app", 1).await;
        let mut fast = register(&mut broker, 2, "https://b.vercel.app", 16).await;

        broker.handle(token_event("A")).await;
        broker.handle(token_event("B")).await;

        assert_eq!(drain(&mut slow).len(), 1);
        assert_eq!(drain(&mut fast).len(), 2);
        assert_eq!(broker.tab_count(), 2);
    }

    #[tokio::test]
    async fn force_sync_re_emits_the_held_credential() {
        let (mut broker, _, _) = broker().await;
        let mut tab = register(&mut broker, 1, "https://app.vercel.app", 16).await;

        broker.handle(BrokerCommand::ForceSync).await;
        assert!(drain(&mut tab).is_empty());

        broker.handle(token_event("abc123")).await;
        broker.handle(BrokerCommand::ForceSync).await;
        assert_eq!(
            drain(&mut tab),
            vec![
                ConsumerMessage::TokenUpdate { token: "abc123".to_string() },
                ConsumerMessage::TokenUpdate { token: "abc123".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn restored_credential_is_not_rebroadcast_on_repeat() {
        let pool = memory_pool().await;
        let store = CredentialStore::new(pool);
        store.save("abc123").await.unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let mut broker = Broker::new(
            rx,
            store,
            AllowList::new(["localhost"]),
            Arc::new(HealthState::new()),
            Arc::new(LatencyStats::new()),
        )
        .await;
        assert_eq!(broker.credential(), Some("abc123"));

        let mut tab = register(&mut broker, 1, "http://localhost/", 16).await;
        broker.handle(token_event("abc123")).await;
        assert!(drain(&mut tab).is_empty());

        broker.handle(BrokerCommand::ForceSync).await;
        assert_eq!(drain(&mut tab).len(), 1);
    }

    #[tokio::test]
    async fn unregister_and_reregister_are_idempotent() {
        let (mut broker, _, health) = broker().await;
        let _first = register(&mut broker, 1, "https://app.vercel.app", 16).await;
        let mut second = register(&mut broker, 1, "https://app.vercel.app", 16).await;
        assert_eq!(broker.tab_count(), 1);

        broker.handle(token_event("A")).await;
        assert_eq!(drain(&mut second).len(), 1);

        broker.handle(BrokerCommand::Unregister(TabId(1))).await;
        broker.handle(BrokerCommand::Unregister(TabId(1))).await;
        assert_eq!(broker.tab_count(), 0);
        assert_eq!(health.registered_tabs(), 0);
    }
}
