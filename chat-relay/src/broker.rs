//! Single-owner event loop for the session registry.
//!
//! The broker task is the only code that reads or writes the [`Registry`].
//! Connections, the bus subscription, and the relay talk to it exclusively
//! through [`BrokerHandle`], so registry mutations are applied one event at a
//! time in the order they were received and no lock is needed.
//!
//! Local chat lines are never delivered straight to local mailboxes. They are
//! published to the bus and come back through the subscription as
//! [`BrokerEvent::Deliver`], so local and remote traffic reach clients by the
//! same path and in the order the bus handed it to this process. A sender
//! therefore sees its own line exactly once.

use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    bus::Bus,
    mailbox::Mailbox,
    protocol::{BusEvent, render_payload},
    registry::{Registry, RegistryError, SessionId},
};

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("broker is no longer running")]
pub struct BrokerClosed;

pub(crate) enum BrokerEvent {
    Join {
        id: SessionId,
        alias: String,
        mailbox: Mailbox,
    },
    Leave {
        id: SessionId,
    },
    Outbound {
        alias: String,
        text: String,
    },
    Deliver {
        payload: String,
    },
    Roster {
        respond_to: oneshot::Sender<Vec<(SessionId, String)>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of the broker's event queue.
#[derive(Clone)]
pub struct BrokerHandle {
    events: mpsc::Sender<BrokerEvent>,
}

impl BrokerHandle {
    pub(crate) fn new(events: mpsc::Sender<BrokerEvent>) -> Self {
        Self { events }
    }

    pub async fn join(
        &self,
        id: SessionId,
        alias: impl Into<String>,
        mailbox: Mailbox,
    ) -> Result<(), BrokerClosed> {
        self.send(BrokerEvent::Join {
            id,
            alias: alias.into(),
            mailbox,
        })
        .await
    }

    pub async fn leave(&self, id: SessionId) -> Result<(), BrokerClosed> {
        self.send(BrokerEvent::Leave { id }).await
    }

    pub async fn outbound(
        &self,
        alias: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), BrokerClosed> {
        self.send(BrokerEvent::Outbound {
            alias: alias.into(),
            text: text.into(),
        })
        .await
    }

    pub async fn deliver(&self, payload: impl Into<String>) -> Result<(), BrokerClosed> {
        self.send(BrokerEvent::Deliver {
            payload: payload.into(),
        })
        .await
    }

    /// Active sessions as seen once every previously queued event is applied.
    pub async fn roster(&self) -> Result<Vec<(SessionId, String)>, BrokerClosed> {
        let (respond_to, response) = oneshot::channel();
        self.send(BrokerEvent::Roster { respond_to }).await?;
        response.await.map_err(|_| BrokerClosed)
    }

    /// Evicts every session and stops the broker. Safe to call repeatedly or
    /// after the broker already stopped.
    pub async fn shutdown(&self) {
        let (respond_to, response) = oneshot::channel();
        if self
            .send(BrokerEvent::Shutdown { respond_to })
            .await
            .is_err()
        {
            return;
        }
        let _ = response.await;
    }

    async fn send(&self, event: BrokerEvent) -> Result<(), BrokerClosed> {
        self.events.send(event).await.map_err(|_| BrokerClosed)
    }
}

/// Starts the broker task publishing through `bus`.
pub fn spawn(bus: Arc<dyn Bus>) -> (BrokerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let broker = Broker {
        registry: Registry::new(),
        bus,
        events: rx,
    };
    (BrokerHandle::new(tx), tokio::spawn(broker.run()))
}

struct Broker {
    registry: Registry,
    bus: Arc<dyn Bus>,
    events: mpsc::Receiver<BrokerEvent>,
}

impl Broker {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                BrokerEvent::Join { id, alias, mailbox } => self.on_join(id, alias, mailbox).await,
                BrokerEvent::Leave { id } => self.on_leave(id).await,
                BrokerEvent::Outbound { alias, text } => {
                    self.publish(BusEvent::Chat { alias, text }).await
                }
                BrokerEvent::Deliver { payload } => self.on_deliver(&payload).await,
                BrokerEvent::Roster { respond_to } => {
                    let _ = respond_to.send(self.registry.roster());
                }
                BrokerEvent::Shutdown { respond_to } => {
                    self.evict_all().await;
                    let _ = respond_to.send(());
                    break;
                }
            }
        }

        // Also reached when every handle was dropped without a shutdown.
        self.evict_all().await;
        info!("broker stopped");
    }

    async fn on_join(&mut self, id: SessionId, alias: String, mailbox: Mailbox) {
        match self.registry.insert(id, alias.clone(), mailbox) {
            Ok(()) => {
                info!(%id, alias, active = self.registry.len(), "session joined");
                self.publish(BusEvent::Joined { alias }).await;
            }
            Err(RegistryError::DuplicateIdentity(id)) => {
                warn!(%id, alias, "rejecting join for an identity that is already active");
            }
        }
    }

    async fn on_leave(&mut self, id: SessionId) {
        let Some(record) = self.registry.remove(id) else {
            debug!(%id, "leave for unknown session ignored");
            return;
        };
        let alias = record.close();
        info!(%id, alias, active = self.registry.len(), "session left");
        self.publish(BusEvent::Left { alias }).await;
    }

    async fn on_deliver(&mut self, payload: &str) {
        let line = render_payload(payload);
        for id in self.registry.fan_out(&line) {
            warn!(%id, "mailbox full; evicting slow session");
            self.on_leave(id).await;
        }
    }

    async fn evict_all(&mut self) {
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "evicting all sessions");
        for (id, record) in sessions {
            let alias = record.close();
            debug!(%id, alias, "session closed by shutdown");
            self.publish(BusEvent::Left { alias }).await;
        }
    }

    async fn publish(&self, event: BusEvent) {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, ?event, "failed to encode bus event");
                return;
            }
        };
        // Not retried: a failed publish loses this message for everyone.
        if let Err(error) = self.bus.publish(payload).await {
            warn!(%error, "bus publish failed; message dropped");
        }
    }
}
