use std::sync::Arc;

use tracing::debug;

use crate::{
    channel::{Channel, SendOutcome},
    diagnostics::DiagnosticLog,
    message::Message,
    registry::{ConnectionId, Registry},
};

/// What happened during one relay. Only used for diagnostics; the origin is
/// never told how its peers fared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub removed: usize,
    pub failed: usize,
    /// Peers released by their owner between the snapshot and the send.
    pub skipped: usize,
}

/// Forwards a message from one connection to every other registered one.
pub struct Relay<C> {
    registry: Arc<Registry<C>>,
    log: Arc<DiagnosticLog>,
}

impl<C> Clone for Relay<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            log: Arc::clone(&self.log),
        }
    }
}

impl<C: Channel> Relay<C> {
    pub fn new(registry: Arc<Registry<C>>, log: Arc<DiagnosticLog>) -> Self {
        Self { registry, log }
    }

    /// Sends `message` to every peer except `origin`, one at a time in
    /// snapshot order. A failing peer never stops delivery to the rest.
    pub async fn relay(&self, origin: ConnectionId, message: &Message) -> RelayReport {
        let peers = self.registry.snapshot_excluding(origin).await;
        let mut report = RelayReport::default();

        for (peer, handle) in peers {
            let Some(channel) = handle.upgrade() else {
                debug!(%origin, %peer, "peer released before send, skipping");
                report.skipped += 1;
                continue;
            };

            let outcome = channel.send(message).await;
            self.handle_outcome(peer, outcome, &mut report).await;
        }

        debug!(%origin, ?report, "relay finished");
        report
    }

    async fn handle_outcome(
        &self,
        peer: ConnectionId,
        outcome: SendOutcome,
        report: &mut RelayReport,
    ) {
        match outcome {
            SendOutcome::Success => {
                self.log
                    .debug(&format!("Successfully sent message to {peer}"))
                    .await;
                report.delivered += 1;
            }
            SendOutcome::DeliveryFailure => {
                // A client that exited without closing leaves its entry behind;
                // a failure status is the only sign of it.
                self.log
                    .info(&format!(
                        "Error sending to {peer}. Removing it from the list of active connections."
                    ))
                    .await;
                if self.registry.remove(peer).await {
                    report.removed += 1;
                }
            }
            SendOutcome::TransportError(detail) => {
                self.log
                    .error(&format!("Error sending message to {peer} - {detail}"))
                    .await;
                report.failed += 1;
            }
            SendOutcome::UnknownStatus(status) => {
                self.log
                    .error(&format!("Error sending to {peer} - {status}"))
                    .await;
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::message::ResponseStatus;

    /// Records every message it is sent and answers with a fixed outcome.
    struct Recorder {
        outcome: SendOutcome,
        received: Mutex<Vec<Message>>,
    }

    impl Recorder {
        fn new(outcome: SendOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                received: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<Message> {
            self.received.lock().expect("recorder lock").clone()
        }
    }

    impl Channel for Recorder {
        async fn send(&self, message: &Message) -> SendOutcome {
            self.received
                .lock()
                .expect("recorder lock")
                .push(message.clone());
            self.outcome.clone()
        }
    }

    async fn register(registry: &Registry<Recorder>, channel: &Arc<Recorder>) -> ConnectionId {
        let id = registry.next_id();
        registry.add(id, channel).await.expect("register");
        id
    }

    fn relay_with(registry: &Arc<Registry<Recorder>>) -> Relay<Recorder> {
        Relay::new(Arc::clone(registry), Arc::new(DiagnosticLog::disabled()))
    }

    #[tokio::test]
    async fn delivery_failure_removes_only_the_failing_peer() {
        let registry = Arc::new(Registry::new());
        let origin = Recorder::new(SendOutcome::Success);
        let origin_id = register(&registry, &origin).await;

        let mut peers = Vec::new();
        for n in 0..5 {
            let outcome = if n == 2 {
                SendOutcome::DeliveryFailure
            } else {
                SendOutcome::Success
            };
            let peer = Recorder::new(outcome);
            let id = register(&registry, &peer).await;
            peers.push((id, peer));
        }

        let message = Message::single("Echo", "hi");
        let report = relay_with(&registry).relay(origin_id, &message).await;

        assert_eq!(report.delivered, 4);
        assert_eq!(report.removed, 1);
        for (id, peer) in &peers {
            assert_eq!(peer.received(), vec![message.clone()]);
            let should_remain = *id != peers[2].0;
            assert_eq!(registry.contains(*id).await, should_remain);
        }
        assert!(origin.received().is_empty());
    }

    #[tokio::test]
    async fn transport_errors_and_unknown_statuses_keep_the_peer() {
        let registry = Arc::new(Registry::new());
        let origin = Recorder::new(SendOutcome::Success);
        let origin_id = register(&registry, &origin).await;
        let flaky = Recorder::new(SendOutcome::TransportError("connection reset".into()));
        let flaky_id = register(&registry, &flaky).await;
        let busy = Recorder::new(SendOutcome::UnknownStatus(
            ResponseStatus::ResourceLimitsExceeded,
        ));
        let busy_id = register(&registry, &busy).await;
        let healthy = Recorder::new(SendOutcome::Success);
        register(&registry, &healthy).await;

        let report = relay_with(&registry)
            .relay(origin_id, &Message::single("Echo", "hi"))
            .await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.removed, 0);
        assert!(registry.contains(flaky_id).await);
        assert!(registry.contains(busy_id).await);
        assert_eq!(healthy.received().len(), 1);
    }

    #[tokio::test]
    async fn released_peers_are_skipped() {
        let registry = Arc::new(Registry::new());
        let origin = Recorder::new(SendOutcome::Success);
        let origin_id = register(&registry, &origin).await;
        let gone = Recorder::new(SendOutcome::Success);
        register(&registry, &gone).await;
        drop(gone);

        let report = relay_with(&registry)
            .relay(origin_id, &Message::single("Echo", "hi"))
            .await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn relay_with_no_peers_is_a_no_op() {
        let registry = Arc::new(Registry::new());
        let origin = Recorder::new(SendOutcome::Success);
        let origin_id = register(&registry, &origin).await;

        let report = relay_with(&registry)
            .relay(origin_id, &Message::single("Echo", "alone"))
            .await;

        assert_eq!(report, RelayReport::default());
    }
}
