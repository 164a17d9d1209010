//! # In-Memory Broker
//!
//! A process-local substrate with the same observable semantics the
//! dispatcher relies on from Redis: channels are fan-out broadcast,
//! keys hold whole JSON objects, and every client is an independent
//! connection. Suitable for tests and single-node operation; distributed
//! deployments use [`crate::RedisBroker`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ports::{ChannelBus, ChannelMessage, KeyValue};
use crate::{BusError, MEMORY_CHANNEL_CAPACITY};

/// The shared "server" side: key map plus lazily created channels.
#[derive(Default)]
pub struct MemoryBroker {
    keys: RwLock<HashMap<String, Value>>,
    channels: RwLock<HashMap<String, broadcast::Sender<ChannelMessage>>>,
}

impl MemoryBroker {
    /// Create a broker shared by any number of clients.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of keys currently stored. Test observability.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    fn channel(&self, name: &str) -> broadcast::Sender<ChannelMessage> {
        if let Some(sender) = self.channels.read().get(name) {
            return sender.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// One client connection: its own subscription set and inbound stream.
pub struct MemoryClient {
    broker: Arc<MemoryBroker>,
    inbox_tx: mpsc::UnboundedSender<ChannelMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl MemoryClient {
    /// Open a client connection on `broker`.
    #[must_use]
    pub fn connect(broker: &Arc<MemoryBroker>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            broker: Arc::clone(broker),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl ChannelBus for MemoryClient {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), BusError> {
        let sender = self.broker.channel(channel);
        let message = ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // Err means no subscriber is listening, which mirrors PUBLISH
        // returning 0 receivers.
        if sender.send(message).is_err() {
            debug!(channel, "published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(channel) {
            return Ok(());
        }

        let mut receiver = self.broker.channel(channel).subscribe();
        let inbox = self.inbox_tx.clone();
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if inbox.send(message).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        debug!(channel = %name, lagged = count, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        subscriptions.insert(channel.to_string(), task);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        if let Some(task) = self.subscriptions.lock().remove(channel) {
            task.abort();
        }
        Ok(())
    }

    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        self.inbox_rx.lock().take()
    }
}

#[async_trait::async_trait]
impl KeyValue for MemoryClient {
    async fn get(&self, key: &str) -> Result<Option<Value>, BusError> {
        Ok(self.broker.keys.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), BusError> {
        self.broker
            .keys
            .write()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BusError> {
        self.broker.keys.write().remove(key);
        Ok(())
    }
}
