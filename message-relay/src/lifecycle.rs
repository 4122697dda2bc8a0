use std::{future::Future, sync::Arc};

use tokio::{select, sync::mpsc};
use tracing::{debug, warn};

use crate::{
    channel::{Channel, InboundRequest},
    diagnostics::DiagnosticLog,
    registry::{ConnectionId, Registry},
    relay::Relay,
};

/// Where a single connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Active,
    ClosedByPeer,
    Cancelled,
    FailedSetup,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::ClosedByPeer | ConnectionState::Cancelled | ConnectionState::FailedSetup
        )
    }

    /// Moves to `next` if the transition is allowed; terminal states never change.
    pub fn transition(self, next: ConnectionState) -> ConnectionState {
        use ConnectionState::*;

        let allowed = matches!(
            (self, next),
            (Accepted, Active | FailedSetup) | (Active, ClosedByPeer | Cancelled)
        );
        if allowed {
            next
        } else {
            warn!(from = ?self, to = ?next, "refusing connection state transition");
            self
        }
    }
}

/// A registered connection that has not been driven to a terminal state yet.
pub struct ActiveConnection<C> {
    id: ConnectionId,
    channel: Arc<C>,
    state: ConnectionState,
}

impl<C> ActiveConnection<C> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Broker context shared by every connection: one registry, one relay and
/// one diagnostic log.
///
/// Each accepted connection is driven on its own task, either through
/// [`ConnectionManager::run_connection`] or its two halves,
/// [`ConnectionManager::register`] and [`ConnectionManager::drive`].
pub struct ConnectionManager<C> {
    registry: Arc<Registry<C>>,
    relay: Relay<C>,
    log: Arc<DiagnosticLog>,
}

impl<C> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            relay: self.relay.clone(),
            log: Arc::clone(&self.log),
        }
    }
}

impl<C: Channel> ConnectionManager<C> {
    pub fn new(log: Arc<DiagnosticLog>) -> Self {
        let registry = Arc::new(Registry::new());
        let relay = Relay::new(Arc::clone(&registry), Arc::clone(&log));
        Self {
            registry,
            relay,
            log,
        }
    }

    pub fn registry(&self) -> &Arc<Registry<C>> {
        &self.registry
    }

    pub fn relay(&self) -> &Relay<C> {
        &self.relay
    }

    pub fn log(&self) -> &Arc<DiagnosticLog> {
        &self.log
    }

    /// Drives one connection from acceptance to a terminal state.
    ///
    /// `channel` is `None` when the transport could not produce a usable
    /// channel. Otherwise this is [`ConnectionManager::register`] followed by
    /// [`ConnectionManager::drive`].
    pub async fn run_connection<F>(
        &self,
        channel: Option<C>,
        inbound: mpsc::Receiver<InboundRequest>,
        cancelled: F,
    ) -> ConnectionState
    where
        F: Future<Output = ()> + Send,
    {
        let Some(channel) = channel else {
            self.log
                .error("Connection setup failed: no usable channel, ignoring this request")
                .await;
            return ConnectionState::Accepted.transition(ConnectionState::FailedSetup);
        };

        match self.register(channel).await {
            Some(connection) => self.drive(connection, inbound, cancelled).await,
            None => ConnectionState::FailedSetup,
        }
    }

    /// Mints an id for `channel` and enters it into the registry. Returns
    /// `None` (after logging) if the registry refuses the id.
    pub async fn register(&self, channel: C) -> Option<ActiveConnection<C>> {
        let channel = Arc::new(channel);
        let id = self.registry.next_id();
        if let Err(err) = self.registry.add(id, &channel).await {
            self.log
                .error(&format!("Connection setup failed: {err}"))
                .await;
            return None;
        }

        self.log.debug(&format!("Connection opened: {id}")).await;
        Some(ActiveConnection {
            id,
            channel,
            state: ConnectionState::Accepted.transition(ConnectionState::Active),
        })
    }

    /// Relays inbound requests one at a time until the stream ends (the peer
    /// closed) or `cancelled` resolves. On the way out the connection is
    /// removed from the registry before its channel is released.
    pub async fn drive<F>(
        &self,
        connection: ActiveConnection<C>,
        mut inbound: mpsc::Receiver<InboundRequest>,
        cancelled: F,
    ) -> ConnectionState
    where
        F: Future<Output = ()> + Send,
    {
        let ActiveConnection { id, channel, state } = connection;

        tokio::pin!(cancelled);
        let next = loop {
            // Cancellation wins over requests still waiting in the queue.
            select! {
                biased;
                _ = &mut cancelled => break ConnectionState::Cancelled,
                request = inbound.recv() => match request {
                    Some(request) => self.handle_request(id, request).await,
                    None => break ConnectionState::ClosedByPeer,
                },
            }
        };

        match next {
            ConnectionState::Cancelled => {
                self.log
                    .info(&format!(
                        "MessageRelay was cancelled, removing {id} from the list of active connections."
                    ))
                    .await;
            }
            _ => self.log.debug(&format!("Connection closed: {id}")).await,
        }

        // Queued requests still hold deferrals; dropping them releases those.
        drop(inbound);
        self.registry.remove(id).await;
        drop(channel);

        state.transition(next)
    }

    async fn handle_request(&self, origin: ConnectionId, request: InboundRequest) {
        let InboundRequest { message, deferral } = request;
        self.log
            .debug(&format!("Request initiated by {origin}"))
            .await;

        let report = self.relay.relay(origin, &message).await;
        debug!(%origin, delivered = report.delivered, removed = report.removed, "request relayed");

        deferral.complete();
    }
}
