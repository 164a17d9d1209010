//! # Transaction Records
//!
//! Both sides of the delivery log persist the same record shape: the
//! publisher holds the **main** transaction, the dispatcher and each
//! consumer hold **related** transactions pointing back at it via
//! `relatedTransaction`. A pair is swept once both sides are resolved.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A persisted transaction, keyed by `transaction_id` in its store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Event name this transaction tracks.
    pub name: String,

    /// Event payload snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Identity that created this record.
    pub origin: Uuid,

    /// Target incomer; `None` on parked zero-subscriber backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Uuid>,

    /// Service name of the incomer involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomer_name: Option<String>,

    /// Environment scoping prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Store key of this record, assigned at insert.
    pub transaction_id: Uuid,

    /// Original publisher's main transaction id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_transaction_id: Option<Uuid>,

    /// True iff this is the original side held by the publisher (or by
    /// the dispatcher on a self-originated ping).
    #[serde(default)]
    pub main_transaction: bool,

    /// The peer transaction this one answers; `None` on mains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_transaction: Option<Uuid>,

    /// True once the receiving side acknowledged the work.
    #[serde(default)]
    pub resolved: bool,

    /// Set true on the sender's main once fan-out was issued.
    #[serde(default)]
    pub published: bool,

    /// Creation time in milliseconds.
    pub alive_since: u64,

    /// Fan-out attempt count, incremented on re-home and retry.
    #[serde(default)]
    pub iteration: u32,
}

/// Everything a transaction carries except what the store stamps at
/// insert (`transaction_id`, `alive_since`).
#[derive(Debug, Clone, Default)]
pub struct TransactionDraft {
    /// Event name.
    pub name: String,
    /// Event payload snapshot.
    pub data: Option<Value>,
    /// Identity creating the record.
    pub origin: Uuid,
    /// Target incomer, when directed.
    pub to: Option<Uuid>,
    /// Service name of the incomer involved.
    pub incomer_name: Option<String>,
    /// Environment scoping prefix.
    pub prefix: Option<String>,
    /// Original publisher's main transaction id.
    pub event_transaction_id: Option<Uuid>,
    /// True on the publisher's original record.
    pub main_transaction: bool,
    /// Peer transaction this one answers.
    pub related_transaction: Option<Uuid>,
    /// Receiving-side acknowledgement flag.
    pub resolved: bool,
    /// Fan-out attempt count.
    pub iteration: u32,
}

impl TransactionDraft {
    /// Materialize the draft into a full record.
    #[must_use]
    pub fn into_transaction(self, transaction_id: Uuid, alive_since: u64) -> Transaction {
        Transaction {
            name: self.name,
            data: self.data,
            origin: self.origin,
            to: self.to,
            incomer_name: self.incomer_name,
            prefix: self.prefix,
            transaction_id,
            event_transaction_id: self.event_transaction_id,
            main_transaction: self.main_transaction,
            related_transaction: self.related_transaction,
            resolved: self.resolved,
            published: false,
            alive_since,
            iteration: self.iteration,
        }
    }
}
