//! Keyed collection of transactions under one broker key.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use shared_bus::KeyValue;
use shared_types::{Clock, Transaction, TransactionDraft};
use uuid::Uuid;

use crate::errors::DispatchError;

/// A transaction store bound to one `{prefix, instance}` key.
///
/// The stored value is a JSON map `transactionId -> Transaction`. When a
/// delete empties the map, the key itself is removed.
#[derive(Clone)]
pub struct TransactionStore {
    kv: Arc<dyn KeyValue>,
    clock: Arc<dyn Clock>,
    key: String,
}

impl TransactionStore {
    /// Bind a store to `key`.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValue>, clock: Arc<dyn Clock>, key: String) -> Self {
        Self { kv, clock, key }
    }

    /// The broker key this store writes under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the whole map.
    pub async fn get_all(&self) -> Result<HashMap<Uuid, Transaction>, DispatchError> {
        match self.kv.get(&self.key).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(HashMap::new()),
        }
    }

    /// Read one transaction.
    pub async fn get(&self, id: &Uuid) -> Result<Option<Transaction>, DispatchError> {
        Ok(self.get_all().await?.remove(id))
    }

    /// Insert a draft: assigns a fresh UUID, stamps `alive_since`, writes.
    pub async fn set(&self, draft: TransactionDraft) -> Result<Transaction, DispatchError> {
        let transaction = draft.into_transaction(Uuid::new_v4(), self.clock.now_ms());
        self.insert(transaction.clone()).await?;
        Ok(transaction)
    }

    /// Insert a full record under its existing id.
    ///
    /// Used when a transaction migrates between stores and its id must
    /// survive, because other records reference it through
    /// `relatedTransaction`.
    pub async fn insert(&self, transaction: Transaction) -> Result<(), DispatchError> {
        let mut all = self.get_all().await?;
        all.insert(transaction.transaction_id, transaction);
        self.write(&all).await
    }

    /// Replace a transaction in place.
    pub async fn update(&self, id: &Uuid, transaction: Transaction) -> Result<(), DispatchError> {
        let mut all = self.get_all().await?;
        all.insert(*id, transaction);
        self.write(&all).await
    }

    /// Remove a transaction; removes the key once the map is empty.
    pub async fn delete(&self, id: &Uuid) -> Result<(), DispatchError> {
        let mut all = self.get_all().await?;
        if all.remove(id).is_none() {
            return Ok(());
        }
        if all.is_empty() {
            self.kv.delete(&self.key).await?;
            return Ok(());
        }
        self.write(&all).await
    }

    async fn write(&self, all: &HashMap<Uuid, Transaction>) -> Result<(), DispatchError> {
        let value: Value = serde_json::to_value(all)?;
        self.kv.set(&self.key, &value).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_bus::{MemoryBroker, MemoryClient};
    use shared_types::ManualClock;

    fn store() -> (Arc<MemoryBroker>, TransactionStore) {
        let broker = MemoryBroker::new();
        let kv: Arc<dyn KeyValue> = Arc::new(MemoryClient::connect(&broker));
        let clock = Arc::new(ManualClock::new(1_000));
        let store = TransactionStore::new(kv, clock, "dispatcher-transaction".into());
        (broker, store)
    }

    fn draft(name: &str) -> TransactionDraft {
        TransactionDraft {
            name: name.into(),
            origin: Uuid::new_v4(),
            main_transaction: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_set_stamps_id_and_alive_since() {
        let (_broker, store) = store();
        let tx = store.set(draft("ping")).await.unwrap();
        assert_eq!(tx.alive_since, 1_000);

        let read = store.get(&tx.transaction_id).await.unwrap().unwrap();
        assert_eq!(read.name, "ping");
        assert!(read.main_transaction);
    }

    #[tokio::test]
    async fn test_update_replaces_in_place() {
        let (_broker, store) = store();
        let mut tx = store.set(draft("accountingFolder")).await.unwrap();
        tx.resolved = true;
        store.update(&tx.transaction_id, tx.clone()).await.unwrap();

        let read = store.get(&tx.transaction_id).await.unwrap().unwrap();
        assert!(read.resolved);
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_last_entry_removes_key() {
        let (broker, store) = store();
        let a = store.set(draft("a")).await.unwrap();
        let b = store.set(draft("b")).await.unwrap();
        assert_eq!(broker.key_count(), 1);

        store.delete(&a.transaction_id).await.unwrap();
        assert_eq!(broker.key_count(), 1);

        store.delete(&b.transaction_id).await.unwrap();
        assert_eq!(broker.key_count(), 0);
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_id_is_noop() {
        let (broker, store) = store();
        store.set(draft("a")).await.unwrap();
        store.delete(&Uuid::new_v4()).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);
        assert_eq!(broker.key_count(), 1);
    }

    #[tokio::test]
    async fn test_insert_preserves_id_across_stores() {
        let (_broker, store) = store();
        let kv: Arc<dyn KeyValue> = Arc::new(MemoryClient::connect(&_broker));
        let backup = TransactionStore::new(
            kv,
            Arc::new(ManualClock::new(9_999)),
            "backup-dispatcher-transaction".into(),
        );

        let tx = store.set(draft("accountingFolder")).await.unwrap();
        backup.insert(tx.clone()).await.unwrap();
        store.delete(&tx.transaction_id).await.unwrap();

        let parked = backup.get(&tx.transaction_id).await.unwrap().unwrap();
        assert_eq!(parked.transaction_id, tx.transaction_id);
        assert_eq!(parked.alive_since, tx.alive_since);
    }
}
