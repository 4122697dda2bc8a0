use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{info, warn};

use crate::{
    diagnostics::DiagnosticLog,
    lifecycle::{ConnectionManager, ConnectionState},
    transport::{self, Accepted, PeerChannel},
};

/// Settings for a [`Broker`].
#[derive(Clone)]
pub struct BrokerConfig {
    /// How long a peer gets to answer a relayed message.
    pub send_timeout: Duration,
    /// How long a new client gets to send its `hello`.
    pub handshake_timeout: Duration,
    pub log: Arc<DiagnosticLog>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            log: Arc::new(DiagnosticLog::disabled()),
        }
    }
}

/// Accepts local TCP clients and relays every message to the other clients.
pub struct Broker {
    listener: TcpListener,
    manager: ConnectionManager<PeerChannel>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(listener: TcpListener, config: BrokerConfig) -> Self {
        Self {
            listener,
            manager: ConnectionManager::new(Arc::clone(&config.log)),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn manager(&self) -> &ConnectionManager<PeerChannel> {
        &self.manager
    }

    /// Serves clients until `shutdown` resolves, then cancels every
    /// connection and waits for each one to leave the registry.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Broker {
            listener,
            manager,
            config,
        } = self;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &manager, &config, &cancel_rx, &mut connections);
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "connection task failed");
                    }
                }
            }
        }

        info!("broker shutting down");
        let _ = cancel_tx.send(true);
        while let Some(finished) = connections.join_next().await {
            if let Err(err) = finished {
                warn!(error = ?err, "connection task failed during shutdown");
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    manager: &ConnectionManager<PeerChannel>,
    config: &BrokerConfig,
    cancel: &watch::Receiver<bool>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            let manager = manager.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            connections.spawn(async move {
                let state = handle_connection(stream, &manager, &config, cancel).await;
                info!(peer = %peer, ?state, "client connection finished");
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    manager: &ConnectionManager<PeerChannel>,
    config: &BrokerConfig,
    cancel: watch::Receiver<bool>,
) -> ConnectionState {
    let cancelled = wait_for_cancel(cancel);

    match transport::accept(stream, config.handshake_timeout, config.send_timeout).await {
        Ok(Accepted {
            channel,
            inbound,
            reader,
            ready,
        }) => {
            let state = match manager.register(channel).await {
                Some(connection) => {
                    let _ = ready.send(());
                    manager.drive(connection, inbound, cancelled).await
                }
                None => ConnectionState::FailedSetup,
            };
            // Relays still sending to this client fail now, not at their timeout.
            reader.stop().await;
            state
        }
        Err(err) => {
            warn!(error = %err, "client handshake failed");
            let (_inbound_tx, inbound_rx) = mpsc::channel(1);
            manager.run_connection(None, inbound_rx, cancelled).await
        }
    }
}

async fn wait_for_cancel(mut cancel: watch::Receiver<bool>) {
    // A dropped sender also means the broker is going away.
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}
