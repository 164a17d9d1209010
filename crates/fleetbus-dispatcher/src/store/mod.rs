//! # Persistent Stores
//!
//! Every piece of coordinated state lives under broker keys so that a
//! standby dispatcher can take relay from whatever the failed active left
//! behind. Values are whole JSON maps; reads and writes are coarse
//! read-modify-write replacements. The dispatcher is the only writer to
//! dispatcher-side stores and the only remote writer to an incomer's
//! store during reconciliation, which bounds the race window; a lost
//! update retries on the next reconciliation tick.

mod registry;
mod transactions;

pub use registry::IncomerRegistry;
pub use transactions::TransactionStore;

/// Key naming for every store namespace.
pub mod keys {
    use uuid::Uuid;

    /// Dispatcher-side transactions.
    #[must_use]
    pub fn dispatcher_transactions(prefix: &str) -> String {
        format!("{prefix}dispatcher-transaction")
    }

    /// One incomer's transactions.
    #[must_use]
    pub fn incomer_transactions(prefix: &str, incomer_uuid: &Uuid) -> String {
        format!("{prefix}{incomer_uuid}-incomer-transaction")
    }

    /// Orphaned dispatcher transactions parked for re-homing.
    #[must_use]
    pub fn backup_dispatcher_transactions(prefix: &str) -> String {
        format!("{prefix}backup-dispatcher-transaction")
    }

    /// Orphaned incomer transactions parked for re-homing.
    #[must_use]
    pub fn backup_incomer_transactions(prefix: &str) -> String {
        format!("{prefix}backup-incomer-transaction")
    }

    /// The incomer registry.
    #[must_use]
    pub fn incomer_registry(prefix: &str) -> String {
        format!("{prefix}incomer")
    }

}
