//! Publish/subscribe transport shared by relay processes.
//!
//! Every relay publishes onto one topic and subscribes to the same topic, so
//! clients attached to different processes share one conversation. The
//! transport only promises at-least-once delivery to current subscribers;
//! messages from different publishers may interleave arbitrarily.

use async_trait::async_trait;
use futures::{StreamExt, future, stream::BoxStream};
use redis::AsyncCommands;
use thiserror::Error;
use tokio::{select, sync::broadcast};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::BrokerHandle;

pub const DEFAULT_TOPIC: &str = "global chat";
pub const DEFAULT_REDIS_ADDR: &str = "localhost:6379";

const LOCAL_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable at {addr}: {source}")]
    Unavailable {
        addr: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("publish to '{topic}' failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("subscribe to '{topic}' failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: redis::RedisError,
    },
}

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, payload: String) -> Result<(), BusError>;

    /// Opens a subscription. Messages published after this returns are
    /// yielded in the order the transport hands them to this process.
    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError>;
}

/// Redis pub/sub on a single channel.
pub struct RedisBus {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
    topic: String,
}

impl RedisBus {
    /// Connects and pings the server. Any failure here means the relay
    /// cannot serve and is reported as [`BusError::Unavailable`].
    pub async fn connect(addr: &str, topic: impl Into<String>) -> Result<Self, BusError> {
        let url = redis_url(addr);
        let unavailable = |source| BusError::Unavailable {
            addr: addr.to_string(),
            source,
        };

        let client = redis::Client::open(url.as_str()).map_err(unavailable)?;
        let mut publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut publisher)
            .await
            .map_err(unavailable)?;

        let topic = topic.into();
        info!(addr, topic, "connected to redis");
        Ok(Self {
            client,
            publisher,
            topic,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, payload: String) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(self.topic.as_str(), payload)
            .await
            .map_err(|source| BusError::Publish {
                topic: self.topic.clone(),
                source,
            })?;
        debug!(receivers, "published to redis");
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError> {
        let subscribe_error = |source| BusError::Subscribe {
            topic: self.topic.clone(),
            source,
        };

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(subscribe_error)?;
        pubsub
            .subscribe(self.topic.as_str())
            .await
            .map_err(subscribe_error)?;

        let messages = pubsub.into_on_message().filter_map(|msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(error) => {
                    warn!(%error, "dropping undecodable bus payload");
                    None
                }
            };
            future::ready(payload)
        });
        Ok(messages.boxed())
    }
}

fn redis_url(addr: &str) -> String {
    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}

/// In-process bus backed by a Tokio `broadcast` channel. Clones share the
/// same channel, so several relays in one process behave like relays sharing
/// a Redis topic.
#[derive(Clone, Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<String>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, payload: String) -> Result<(), BusError> {
        if self.sender.send(payload).is_err() {
            debug!("no local bus subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError> {
        let messages = BroadcastStream::new(self.sender.subscribe()).filter_map(|item| {
            let payload = match item {
                Ok(payload) => Some(payload),
                Err(error @ BroadcastStreamRecvError::Lagged(_)) => {
                    warn!(%error, "local bus subscriber lagged; messages lost");
                    None
                }
            };
            future::ready(payload)
        });
        Ok(messages.boxed())
    }
}

/// Drains a bus subscription into the broker, one message at a time, until
/// the stream ends, the broker stops, or `cancel` fires.
pub async fn forward_deliveries(
    mut deliveries: BoxStream<'static, String>,
    broker: BrokerHandle,
    cancel: CancellationToken,
) {
    loop {
        select! {
            _ = cancel.cancelled() => {
                debug!("bus subscription cancelled");
                break;
            }
            next = deliveries.next() => {
                let Some(payload) = next else {
                    warn!("bus subscription ended; remote messages will no longer arrive");
                    break;
                };
                if broker.deliver(payload).await.is_err() {
                    debug!("broker stopped; ending bus subscription");
                    break;
                }
            }
        }
    }
}
