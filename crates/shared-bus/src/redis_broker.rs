//! # Redis Broker
//!
//! Production substrate over the `redis` crate. Commands (GET/SET/DEL/
//! PUBLISH) run on a multiplexed connection; pub/sub traffic lives on a
//! dedicated connection split into sink and stream, owned by a background
//! task. Subscribe/unsubscribe requests reach that task over a control
//! channel, so the subscription set can change while the stream is live.

use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::ports::{ChannelBus, ChannelMessage, KeyValue};
use crate::BusError;

enum SubscriptionCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// A connected Redis broker client.
pub struct RedisBroker {
    conn: MultiplexedConnection,
    control: mpsc::UnboundedSender<SubscriptionCommand>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
}

impl RedisBroker {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// Opens the command connection and the pub/sub connection, and
    /// spawns the background task that drives the latter.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let pubsub = client.get_async_pubsub().await?;
        let (mut sink, mut stream) = pubsub.split();

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = control_rx.recv() => match command {
                        Some(SubscriptionCommand::Subscribe(channel)) => {
                            if let Err(err) = sink.subscribe(&channel).await {
                                warn!(channel, error = %err, "subscribe failed");
                            }
                        }
                        Some(SubscriptionCommand::Unsubscribe(channel)) => {
                            if let Err(err) = sink.unsubscribe(&channel).await {
                                warn!(channel, error = %err, "unsubscribe failed");
                            }
                        }
                        // All broker handles dropped.
                        None => return,
                    },
                    message = stream.next() => match message {
                        Some(msg) => {
                            let channel = msg.get_channel_name().to_string();
                            match msg.get_payload::<String>() {
                                Ok(payload) => {
                                    if inbox_tx
                                        .send(ChannelMessage { channel, payload })
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(channel, error = %err, "non-string payload dropped");
                                }
                            }
                        }
                        None => {
                            warn!("pub/sub stream closed");
                            return;
                        }
                    },
                }
            }
        });

        debug!(url, "redis broker connected");
        Ok(Self {
            conn,
            control: control_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        })
    }

    fn send_control(&self, command: SubscriptionCommand) -> Result<(), BusError> {
        self.control
            .send(command)
            .map_err(|_| BusError::SubscriptionClosed)
    }
}

#[async_trait::async_trait]
impl ChannelBus for RedisBroker {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload.to_string()).await?;
        if receivers == 0 {
            debug!(channel, "published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        self.send_control(SubscriptionCommand::Subscribe(channel.to_string()))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        self.send_control(SubscriptionCommand::Unsubscribe(channel.to_string()))
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        self.inbox_rx.lock().take()
    }
}

#[async_trait::async_trait]
impl KeyValue for RedisBroker {
    async fn get(&self, key: &str) -> Result<Option<Value>, BusError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|source| BusError::InvalidValue {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value.to_string()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}
