//! # Error Types
//!
//! The dispatcher-side error taxonomy. Handler paths log these and drop
//! the offending message; none of them abort the message loop. Store
//! races are not represented here — a lost update converges on the next
//! reconciliation tick.

use shared_bus::BusError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while handling channel messages and store records.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Message without `name`/`redisMetadata`, or schema failure.
    #[error("malformed message on {channel}: {reason}")]
    MalformedMessage {
        /// Channel the message arrived on.
        channel: String,
        /// What made it unprocessable.
        reason: String,
    },

    /// No validator registered for this event name.
    #[error("unknown event: {name}")]
    UnknownEvent {
        /// The unrecognized event name.
        name: String,
    },

    /// A process re-registered with an already-known `baseUUID`.
    #[error("duplicate registration for baseUUID {base_uuid}")]
    DuplicateRegistration {
        /// The colliding instance identity.
        base_uuid: Uuid,
    },

    /// Incoming message references a transaction the sender never stored.
    #[error("missing related transaction {transaction_id}")]
    MissingRelatedTransaction {
        /// The dangling reference.
        transaction_id: Uuid,
    },

    /// Broker layer failure.
    #[error(transparent)]
    Store(#[from] BusError),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
