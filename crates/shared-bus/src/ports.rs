//! # Broker Ports
//!
//! Trait definitions the dispatcher core depends on. Adapters implement
//! these against the in-memory broker or Redis; the core never sees the
//! difference.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Channel the message arrived on.
    pub channel: String,
    /// Raw JSON payload as published.
    pub payload: String,
}

/// Named-channel publish/subscribe.
///
/// A client holds one merged inbound stream covering every channel it is
/// subscribed to; [`ChannelBus::take_messages`] hands that stream to the
/// single consumer. Subscribing twice to one channel is a no-op.
#[async_trait]
pub trait ChannelBus: Send + Sync {
    /// Publish a JSON payload on `channel`.
    ///
    /// Publishing to a channel nobody subscribed to is not an error; the
    /// message is simply dropped by the substrate.
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), crate::BusError>;

    /// Start receiving messages published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<(), crate::BusError>;

    /// Stop receiving messages from `channel`.
    async fn unsubscribe(&self, channel: &str) -> Result<(), crate::BusError>;

    /// Take the merged inbound stream. Returns `None` after the first
    /// call; there is exactly one consumer.
    fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>>;
}

/// Whole-object JSON storage.
///
/// Reads and writes replace the entire value under a key; callers do
/// read-modify-write and tolerate the race window that implies.
#[async_trait]
pub trait KeyValue: Send + Sync {
    /// Fetch the JSON value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Value>, crate::BusError>;

    /// Replace the JSON value under `key`.
    async fn set(&self, key: &str, value: &Value) -> Result<(), crate::BusError>;

    /// Remove `key` entirely.
    async fn delete(&self, key: &str) -> Result<(), crate::BusError>;
}
