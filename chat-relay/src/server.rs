use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    broker::{self, BrokerHandle},
    bus::{Bus, forward_deliveries},
    session::{HandshakeError, SessionConfig, SessionError, serve_connection},
};

/// Upper bound on waiting for connection tasks after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct RelayConfig {
    pub session: SessionConfig,
}

/// One relay process: a TCP listener in front of a broker that shares its
/// traffic with other relays through the bus.
pub struct Relay {
    listener: TcpListener,
    bus: Arc<dyn Bus>,
    config: RelayConfig,
}

impl Relay {
    pub fn new(listener: TcpListener, bus: Arc<dyn Bus>, config: RelayConfig) -> Self {
        Self {
            listener,
            bus,
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients until `shutdown` resolves.
    ///
    /// On shutdown the listener is closed, every active session is evicted
    /// (each gets a Leave and its mailbox closed), the bus subscription
    /// stops, and connection tasks are given [`SHUTDOWN_GRACE`] to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            bus,
            config,
        } = self;
        tokio::pin!(shutdown);

        // Subscribe before accepting so no session can miss its own join notice.
        let deliveries = bus
            .subscribe()
            .await
            .context("failed to subscribe to the message bus")?;
        let (broker, broker_task) = broker::spawn(Arc::clone(&bus));
        let cancel = CancellationToken::new();
        let subscription = tokio::spawn(forward_deliveries(
            deliveries,
            broker.clone(),
            cancel.child_token(),
        ));
        let connections = TaskTracker::new();

        loop {
            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &broker, &connections, &cancel, config);
                }
            }
        }

        info!("relay shutting down");
        drop(listener);
        cancel.cancel();
        broker.shutdown().await;
        drop(broker);

        connections.close();
        if timeout(SHUTDOWN_GRACE, connections.wait()).await.is_err() {
            warn!(
                remaining = connections.len(),
                "connections still open after shutdown grace period"
            );
        }
        if let Err(err) = subscription.await {
            warn!(error = ?err, "bus subscription task failed");
        }
        if let Err(err) = broker_task.await {
            warn!(error = ?err, "broker task failed");
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
    broker: &BrokerHandle,
    connections: &TaskTracker,
    cancel: &CancellationToken,
    config: RelayConfig,
) {
    match result {
        Ok((stream, peer)) => {
            spawn_connection(stream, peer, broker, connections, cancel, config);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: &BrokerHandle,
    connections: &TaskTracker,
    cancel: &CancellationToken,
    config: RelayConfig,
) {
    debug!(%peer, "accepted connection");
    let broker = broker.clone();
    let cancel = cancel.child_token();
    connections.spawn(async move {
        match serve_connection(stream, broker, config.session, cancel).await {
            Ok(()) => {}
            Err(SessionError::Handshake(err @ HandshakeError::Disconnected)) => {
                debug!(%peer, error = %err, "handshake abandoned");
            }
            Err(SessionError::Handshake(err)) => {
                info!(%peer, error = %err, "handshake rejected");
            }
            Err(err) => warn!(%peer, error = %err, "client connection closed with error"),
        }
    });
}
