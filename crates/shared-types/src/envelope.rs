//! # Wire Envelope
//!
//! The JSON message exchanged on broker channels.
//!
//! Every message is an [`EventMessage`]: a `name`, an optional `data`
//! object, and a `redisMetadata` block identifying the sender and linking
//! the message to the transaction log. The `origin` field is the sole
//! identity a receiver may trust; messages without metadata are malformed
//! and dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::incomer::Subscription;

/// The universal message envelope for all channel traffic.
///
/// Reserved names (`register`, `approvement`, `ping`, `OK`) drive the
/// dispatcher protocol; every other name is a business event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event name.
    pub name: String,

    /// Event payload. `None` for protocol messages without a body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Routing and transaction-log metadata.
    #[serde(rename = "redisMetadata")]
    pub metadata: RedisMetadata,
}

impl EventMessage {
    /// Build a message with the given name and metadata and no body.
    #[must_use]
    pub fn protocol(name: impl Into<String>, metadata: RedisMetadata) -> Self {
        Self {
            name: name.into(),
            data: None,
            metadata,
        }
    }
}

/// Metadata block carried by every message.
///
/// `transactionId` refers to the transaction record backing this message
/// in the sender's store; `eventTransactionId` always points back to the
/// original publisher's main transaction, however many hops the event has
/// taken.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisMetadata {
    /// Sender identity: the dispatcher's `privateUUID` or an incomer's
    /// `providedUUID` (its `baseUUID` before approval).
    pub origin: Uuid,

    /// Target `providedUUID` when the message is directed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Uuid>,

    /// Service name of the target incomer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomer_name: Option<String>,

    /// Environment scoping prefix, when one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Transaction backing this message in the sender's store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,

    /// Original publisher's main transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_transaction_id: Option<Uuid>,

    /// True on the publisher's original record of an event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_transaction: Option<bool>,

    /// The peer transaction this one answers; absent on mains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_transaction: Option<Uuid>,

    /// True once the receiving side acknowledged the work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<bool>,

    /// Fan-out attempt count, incremented on re-home and retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

/// Body of a `register` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationData {
    /// Capability/service name of the registering incomer.
    pub name: String,

    /// Event names this incomer may publish.
    #[serde(default)]
    pub events_cast: Vec<String>,

    /// Subscriptions this incomer wants delivered.
    #[serde(default)]
    pub events_subscribe: Vec<Subscription>,

    /// Environment scoping prefix the incomer runs under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}
