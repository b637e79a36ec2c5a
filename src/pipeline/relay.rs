use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::health::HealthState;
use crate::pipeline::normalizer::{Normalizer, Verdict};
use crate::pipeline::token::{redact, TokenTracker};
use crate::scheduler::ticker;
use crate::types::{BrokerCommand, Observation, RawRecord, TokenChannel};

/// Page-side funnel: every sensor's observations pass through the token
/// tracker or the normalizer here before anything is sent to the broker.
pub struct PageRelay {
    obs_rx: mpsc::Receiver<Observation>,
    broker_tx: mpsc::Sender<BrokerCommand>,
    tracker: TokenTracker,
    normalizer: Normalizer,
    health: Arc<HealthState>,
    /// Observations consumed since start (for diagnostics).
    observations: u64,
    /// Broker sends that failed (full or closed channel).
    send_failures: u64,
}

impl PageRelay {
    pub fn new(
        obs_rx: mpsc::Receiver<Observation>,
        broker_tx: mpsc::Sender<BrokerCommand>,
        normalizer: Normalizer,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            obs_rx,
            broker_tx,
            tracker: TokenTracker::new(),
            normalizer,
            health,
            observations: 0,
            send_failures: 0,
        }
    }

    pub async fn run(mut self) {
        let mut prune_ticker = ticker(self.normalizer.window_ttl() / 4);

        loop {
            tokio::select! {
                obs = self.obs_rx.recv() => {
                    match obs {
                        Some(obs) => self.handle(obs),
                        None => break,
                    }
                }
                _ = prune_ticker.tick() => {
                    let pruned = self.normalizer.prune(Instant::now());
                    if pruned > 0 {
                        debug!(pruned, "[RELAY] normalizer window pruned");
                    }
                }
            }
        }
        info!(observations = self.observations, "[RELAY] observation channel closed, stopping");
    }

    pub fn handle(&mut self, obs: Observation) {
        let received_at = Instant::now();
        self.observations += 1;
        match obs {
            Observation::Token { channel, raw } => self.handle_token(channel, &raw, received_at),
            Observation::Records { records } => self.handle_records(&records, received_at),
        }

        if self.observations % 500 == 0 {
            info!(
                observations = self.observations,
                tokens_observed = self.tracker.observed(),
                tokens_emitted = self.tracker.emitted(),
                forwarded = self.health.forwarded(),
                suppressed = self.health.suppressed(),
                rejected = self.health.rejected(),
                send_failures = self.send_failures,
                "[RELAY] {} observations | fwd={} dup={} rej={}",
                self.observations,
                self.health.forwarded(),
                self.health.suppressed(),
                self.health.rejected(),
            );
        }
    }

    fn handle_token(&mut self, channel: TokenChannel, raw: &str, received_at: Instant) {
        let Some(token) = self.tracker.observe(channel, raw) else {
            return;
        };
        info!(channel = %channel, token = %redact(&token), "[RELAY] new credential observed");
        let cmd = BrokerCommand::TokenEvent {
            token,
            observed_at: received_at,
        };
        // Undelivered: the next sighting of this value must count as new.
        if let Err(BrokerCommand::TokenEvent { token, .. }) = self.send(cmd) {
            self.tracker.forget(&token);
        }
    }

    fn handle_records(&mut self, records: &[RawRecord], received_at: Instant) {
        for raw in records {
            match self.normalizer.accept(raw, received_at) {
                Verdict::Forward(operation) => {
                    let detected_at_ms = operation.detected_at_ms;
                    debug!(
                        id = %operation.id,
                        source = %operation.source,
                        amount = operation.amount,
                        "[RELAY] operation forwarded"
                    );
                    let cmd = BrokerCommand::OperationEvent {
                        operation,
                        observed_at: received_at,
                    };
                    match self.send(cmd) {
                        Ok(()) => self.health.record_forwarded(detected_at_ms),
                        Err(BrokerCommand::OperationEvent { operation, .. }) => {
                            self.normalizer.forget(&operation.fingerprint);
                        }
                        Err(_) => {}
                    }
                }
                Verdict::Duplicate => self.health.inc_suppressed(),
                Verdict::Rejected => {
                    self.health.inc_rejected();
                    debug!(source = %raw.source(), "[RELAY] record rejected");
                }
            }
        }
    }

    /// Never waits on the broker. An undelivered command is handed back so the
    /// caller can un-record it; the next scan or token observation is the retry.
    fn send(&mut self, cmd: BrokerCommand) -> std::result::Result<(), BrokerCommand> {
        match self.broker_tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.send_failures += 1;
                warn!(failures = self.send_failures, "[RELAY] broker channel unavailable: {e}");
                Err(e.into_inner())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OperationWindow;
    use crate::types::DomExtract;
    use serde_json::json;
    use std::time::Duration;

    fn relay(capacity: usize) -> (PageRelay, mpsc::Sender<Observation>, mpsc::Receiver<BrokerCommand>, Arc<HealthState>) {
        let (obs_tx, obs_rx) = mpsc::channel(16);
        let (broker_tx, broker_rx) = mpsc::channel(capacity);
        let health = Arc::new(HealthState::new());
        let normalizer = Normalizer::new(OperationWindow::new(Duration::from_secs(120)));
        (PageRelay::new(obs_rx, broker_tx, normalizer, Arc::clone(&health)), obs_tx, broker_rx, health)
    }

    fn token(channel: TokenChannel, raw: &str) -> Observation {
        Observation::Token { channel, raw: raw.to_string() }
    }

    fn drain(rx: &mut mpsc::Receiver<BrokerCommand>) -> Vec<BrokerCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn only_distinct_tokens_reach_the_broker() {
        let (mut relay, _obs_tx, mut broker_rx, _) = relay(16);
        relay.handle(token(TokenChannel::PageHeader, "Bearer A"));
        relay.handle(token(TokenChannel::NetworkListener, "Bearer A"));
        relay.handle(token(TokenChannel::SessionStorage, "B"));
        relay.handle(token(TokenChannel::PageHeader, "Bearer A"));
        relay.handle(token(TokenChannel::NetworkListener, "bearer A "));

        let tokens: Vec<String> = drain(&mut broker_rx)
            .into_iter()
            .map(|cmd| match cmd {
                BrokerCommand::TokenEvent { token, .. } => token,
                other => panic!("expected TokenEvent, got {other:?}"),
            })
            .collect();
        assert_eq!(tokens, vec!["A", "B", "A"]);
    }

    #[test]
    fn same_offer_from_network_and_dom_is_forwarded_once() {
        let (mut relay, _obs_tx, mut broker_rx, health) = relay(16);
        relay.handle(Observation::Records {
            records: vec![RawRecord::Network {
                payload: json!({
                    "id": "op-77",
                    "grossAmount": "1,234.56",
                    "paymentMethodName": "Banco XYZ",
                    "side": "SELL",
                }),
            }],
        });
        relay.handle(Observation::Records {
            records: vec![
                RawRecord::DomCard(DomExtract {
                    amount: 1234.56,
                    method: "Banco XYZ".to_string(),
                    is_buy: false,
                }),
                RawRecord::DomCard(DomExtract {
                    amount: -1.0,
                    method: "Banco XYZ".to_string(),
                    is_buy: false,
                }),
            ],
        });

        let cmds = drain(&mut broker_rx);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            BrokerCommand::OperationEvent { operation, .. } => {
                assert_eq!(operation.id, "op-77");
                assert_eq!(operation.amount, 1234.56);
            }
            other => panic!("expected OperationEvent, got {other:?}"),
        }
        assert_eq!(health.forwarded(), 1);
        assert_eq!(health.suppressed(), 1);
        assert_eq!(health.rejected(), 1);
        assert!(health.last_operation_at_ms() > 0);
    }

    #[test]
    fn undelivered_token_is_sent_on_its_next_sighting() {
        let (mut relay, _obs_tx, mut broker_rx, _) = relay(1);
        relay.handle(token(TokenChannel::PageHeader, "Bearer A"));
        relay.handle(token(TokenChannel::PageHeader, "Bearer B"));
        assert_eq!(relay.send_failures, 1);
        assert_eq!(drain(&mut broker_rx).len(), 1);

        relay.handle(token(TokenChannel::SessionStorage, "B"));
        match broker_rx.try_recv() {
            Ok(BrokerCommand::TokenEvent { token, .. }) => assert_eq!(token, "B"),
            other => panic!("expected TokenEvent, got {other:?}"),
        }
    }

    #[test]
    fn undelivered_operation_is_forwarded_on_its_next_sighting() {
        let (mut relay, _obs_tx, mut broker_rx, health) = relay(1);
        let card = || Observation::Records {
            records: vec![RawRecord::DomCard(DomExtract {
                amount: 75.0,
                method: "Nequi".to_string(),
                is_buy: true,
            })],
        };
        relay.handle(token(TokenChannel::PageHeader, "A"));
        relay.handle(card());
        assert_eq!(relay.send_failures, 1);
        assert_eq!(health.forwarded(), 0);
        assert_eq!(drain(&mut broker_rx).len(), 1);

        relay.handle(card());
        assert!(matches!(broker_rx.try_recv(), Ok(BrokerCommand::OperationEvent { .. })));
        assert_eq!(health.forwarded(), 1);
        assert_eq!(health.suppressed(), 0);
    }

    #[tokio::test]
    async fn run_stops_when_sensors_are_gone() {
        let (relay, obs_tx, mut broker_rx, _) = relay(16);
        let handle = tokio::spawn(relay.run());
        obs_tx.send(token(TokenChannel::PageHeader, "Bearer abc123")).await.unwrap();
        drop(obs_tx);
        handle.await.unwrap();
        match broker_rx.try_recv().unwrap() {
            BrokerCommand::TokenEvent { token, .. } => assert_eq!(token, "abc123"),
            other => panic!("expected TokenEvent, got {other:?}"),
        }
    }
}
