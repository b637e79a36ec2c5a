use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::config::{CONSUMER_QUEUE_CAPACITY, REGISTER_INTERVAL_SECS};
use crate::scheduler::ticker;
use crate::types::{BrokerCommand, ConsumerMessage, ConsumerSignal, Envelope, TabRef};

/// Why a bridge stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The consumer side went away (socket closed or outbound queue dropped).
    ConsumerClosed,
    /// The broker's command channel is gone. Delivery is abandoned silently.
    BrokerClosed,
}

/// Per-tab adapter: keeps the tab registered with the broker and rewraps
/// every broker message in the extension envelope for the consumer.
pub struct Bridge {
    tab: TabRef,
    broker_tx: mpsc::Sender<BrokerCommand>,
    /// Handed to the broker on every registration.
    sink: mpsc::Sender<ConsumerMessage>,
    inbound_rx: mpsc::Receiver<ConsumerMessage>,
    signal_rx: mpsc::Receiver<ConsumerSignal>,
    out_tx: mpsc::Sender<Envelope>,
    register_interval: Duration,
    delivered: u64,
}

impl Bridge {
    pub fn new(
        tab: TabRef,
        broker_tx: mpsc::Sender<BrokerCommand>,
        signal_rx: mpsc::Receiver<ConsumerSignal>,
        out_tx: mpsc::Sender<Envelope>,
    ) -> Self {
        let (sink, inbound_rx) = mpsc::channel(CONSUMER_QUEUE_CAPACITY);
        Self {
            tab,
            broker_tx,
            sink,
            inbound_rx,
            signal_rx,
            out_tx,
            register_interval: Duration::from_secs(REGISTER_INTERVAL_SECS),
            delivered: 0,
        }
    }

    pub async fn run(mut self) -> BridgeExit {
        let exit = self.relay_loop().await;
        // Best effort; the broker also drops closed sinks on the next broadcast.
        let _ = self.broker_tx.try_send(BrokerCommand::Unregister(self.tab.id));
        info!(tab = %self.tab.id, delivered = self.delivered, ?exit, "[BRIDGE] stopped");
        exit
    }

    async fn relay_loop(&mut self) -> BridgeExit {
        // Registration may precede the consumer's ready signal; it is idempotent.
        if !self.request(self.registration()) {
            return BridgeExit::BrokerClosed;
        }
        let mut reregister = ticker(self.register_interval);

        loop {
            tokio::select! {
                _ = reregister.tick() => {
                    if !self.request(self.registration()) {
                        return BridgeExit::BrokerClosed;
                    }
                }
                signal = self.signal_rx.recv() => {
                    let ok = match signal {
                        Some(ConsumerSignal::ClientReady) => {
                            debug!(tab = %self.tab.id, "[BRIDGE] client ready");
                            self.request(self.registration()) && self.request(BrokerCommand::ForceSync)
                        }
                        Some(ConsumerSignal::ForceSync) => self.request(BrokerCommand::ForceSync),
                        None => return BridgeExit::ConsumerClosed,
                    };
                    if !ok {
                        return BridgeExit::BrokerClosed;
                    }
                }
                Some(msg) = self.inbound_rx.recv() => {
                    if self.out_tx.send(Envelope::wrap(msg)).await.is_err() {
                        return BridgeExit::ConsumerClosed;
                    }
                    self.delivered += 1;
                }
            }
        }
    }

    fn registration(&self) -> BrokerCommand {
        BrokerCommand::Register {
            tab: self.tab.clone(),
            sink: self.sink.clone(),
        }
    }

    /// Returns false once the broker channel is closed.
    fn request(&self, cmd: BrokerCommand) -> bool {
        match self.broker_tx.try_send(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // The next registration tick retries.
                warn!(tab = %self.tab.id, "[BRIDGE] broker busy, request skipped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(tab = %self.tab.id, "[BRIDGE] broker channel closed");
                false
            }
        }
    }
}
