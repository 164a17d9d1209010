//! # Eviction / Orphan Resolution
//!
//! Evicting an incomer removes its registry entry and then re-homes
//! everything it was involved in: mains migrate to a same-named peer that
//! casts the event (or park in the incomer backup store), related
//! transactions re-publish to another subscriber (or park if
//! unresolved), and dispatcher-side transactions targeting the evicted
//! incomer are re-homed or parked the same way. An unresolved main is
//! never lost.

use shared_types::{
    incomer_channel, Incomer, Transaction, EVENT_APPROVEMENT, EVENT_PING, EVENT_REGISTER,
};
use tracing::debug;
use uuid::Uuid;

use super::DispatcherInner;
use crate::errors::DispatchError;
use crate::store::TransactionStore;

impl DispatcherInner {
    pub(crate) async fn evict_incomer(&self, incomer: &Incomer) -> Result<(), DispatchError> {
        self.registry.delete_incomer(&incomer.provided_uuid).await?;
        self.unsubscribe_channel(&incomer_channel(&self.config.prefix, &incomer.provided_uuid))
            .await;

        let survivors = self.registry.get_incomers().await?;
        let store = self.incomer_store(&incomer.provided_uuid);

        for (id, transaction) in store.get_all().await? {
            if transaction.name == EVENT_PING {
                store.delete(&id).await?;
                if let Some(related) = transaction.related_transaction {
                    self.dispatcher_store.delete(&related).await?;
                }
                continue;
            }

            if transaction.name == EVENT_REGISTER && transaction.main_transaction {
                store.delete(&id).await?;
                for (approval_id, approval) in self.dispatcher_store.get_all().await? {
                    if approval.related_transaction == Some(id) {
                        self.dispatcher_store.delete(&approval_id).await?;
                    }
                }
                continue;
            }

            if transaction.main_transaction {
                self.rehome_main(incomer, &survivors, id, transaction, &store)
                    .await?;
                continue;
            }

            if transaction.related_transaction.is_some() {
                self.rehome_related(&survivors, id, transaction, &store)
                    .await?;
                continue;
            }

            // Neither main nor related: nothing references it.
            store.delete(&id).await?;
        }

        for (child_id, child) in self.dispatcher_store.get_all().await? {
            if child.to != Some(incomer.provided_uuid) {
                continue;
            }
            if child.name == EVENT_PING || child.name == EVENT_APPROVEMENT {
                self.dispatcher_store.delete(&child_id).await?;
                continue;
            }
            if let Some(target) = survivors
                .iter()
                .find(|s| s.subscription(&child.name).is_some())
            {
                self.republish_child(
                    &child.name,
                    child.data.clone(),
                    child.related_transaction,
                    child.event_transaction_id,
                    target,
                    child.iteration + 1,
                )
                .await?;
                self.dispatcher_store.delete(&child_id).await?;
            } else {
                debug!(
                    transaction = %child_id,
                    "no subscriber left, parking dispatcher transaction"
                );
                self.backup_dispatcher_store.insert(child).await?;
                self.dispatcher_store.delete(&child_id).await?;
            }
        }
        Ok(())
    }

    /// Migrate an evicted publisher's main to a same-named peer that
    /// casts the event, re-pointing every dispatcher child at the new
    /// record. With no such peer, the main parks in the incomer backup
    /// store under its original id.
    async fn rehome_main(
        &self,
        evicted: &Incomer,
        survivors: &[Incomer],
        id: Uuid,
        transaction: Transaction,
        store: &TransactionStore,
    ) -> Result<(), DispatchError> {
        let heir = survivors
            .iter()
            .find(|s| s.name == evicted.name && s.casts(&transaction.name));

        let Some(heir) = heir else {
            self.backup_incomer_store.insert(transaction).await?;
            store.delete(&id).await?;
            return Ok(());
        };

        let mut migrated = transaction;
        migrated.transaction_id = Uuid::new_v4();
        migrated.origin = heir.provided_uuid;
        migrated.incomer_name = Some(heir.name.clone());
        let new_main_id = migrated.transaction_id;
        self.incomer_store(&heir.provided_uuid)
            .insert(migrated)
            .await?;

        for (child_id, mut child) in self.dispatcher_store.get_all().await? {
            if child.related_transaction == Some(id) {
                child.to = Some(heir.provided_uuid);
                child.related_transaction = Some(new_main_id);
                child.main_transaction = false;
                self.dispatcher_store.update(&child_id, child).await?;
            }
        }
        store.delete(&id).await?;
        debug!(
            old_main = %id,
            new_main = %new_main_id,
            heir = %heir.provided_uuid,
            "main migrated to sibling"
        );
        Ok(())
    }

    /// Re-publish an evicted consumer's unresolved work to another
    /// subscriber, or park it. Resolved records are simply dropped.
    async fn rehome_related(
        &self,
        survivors: &[Incomer],
        id: Uuid,
        transaction: Transaction,
        store: &TransactionStore,
    ) -> Result<(), DispatchError> {
        if let Some(target) = survivors
            .iter()
            .find(|s| s.subscription(&transaction.name).is_some())
        {
            if let Some(previous_child) = transaction.related_transaction {
                self.dispatcher_store.delete(&previous_child).await?;
            }
            self.republish_child(
                &transaction.name,
                transaction.data.clone(),
                transaction.event_transaction_id,
                transaction.event_transaction_id,
                target,
                transaction.iteration + 1,
            )
            .await?;
            store.delete(&id).await?;
        } else if !transaction.resolved {
            self.backup_incomer_store.insert(transaction).await?;
            store.delete(&id).await?;
        } else {
            store.delete(&id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::service::Dispatcher;
    use shared_bus::{ChannelBus, KeyValue, MemoryBroker, MemoryClient};
    use shared_types::{ManualClock, Subscription, TransactionDraft};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const NOW: u64 = 1_000_000;

    fn build(broker: &Arc<MemoryBroker>) -> Dispatcher {
        let client: Arc<MemoryClient> = Arc::new(MemoryClient::connect(&broker));
        let bus: Arc<dyn ChannelBus> = client.clone();
        let kv: Arc<dyn KeyValue> = client;
        let dispatcher = Dispatcher::new(
            DispatcherConfig::default(),
            bus,
            kv,
            Arc::new(ManualClock::new(NOW)),
        );
        dispatcher.inner.active.store(true, Ordering::SeqCst);
        dispatcher
    }

    fn incomer(name: &str, casts: &[&str], subscriptions: Vec<Subscription>) -> Incomer {
        Incomer {
            provided_uuid: Uuid::nil(),
            base_uuid: Uuid::new_v4(),
            name: name.into(),
            events_cast: casts.iter().map(|s| (*s).into()).collect(),
            events_subscribe: subscriptions,
            prefix: String::new(),
            alive_since: NOW,
            last_activity: NOW,
            is_dispatcher_active_instance: false,
        }
    }

    #[tokio::test]
    async fn test_ping_pair_is_deleted() {
        let broker = MemoryBroker::new();
        let dispatcher = build(&broker);
        let provided = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &[], Vec::new()))
            .await
            .unwrap();

        let ping_main = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: EVENT_PING.to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(provided),
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let store = dispatcher.inner.incomer_store(&provided);
        store
            .set(TransactionDraft {
                name: EVENT_PING.to_string(),
                origin: provided,
                related_transaction: Some(ping_main.transaction_id),
                resolved: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let record = dispatcher
            .inner
            .registry
            .get_incomer(&provided)
            .await
            .unwrap()
            .unwrap();
        dispatcher.inner.evict_incomer(&record).await.unwrap();

        assert!(store.get_all().await.unwrap().is_empty());
        assert!(dispatcher
            .inner
            .dispatcher_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_pending_registration_pair_is_deleted() {
        let broker = MemoryBroker::new();
        let dispatcher = build(&broker);
        // A same-named caster exists, but a pending registration is
        // never re-homed to it.
        let dying = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &["accountingFolder"], Vec::new()))
            .await
            .unwrap();
        let sibling = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &["accountingFolder"], Vec::new()))
            .await
            .unwrap();

        // The incomer died before acknowledging its approval: its
        // register main is still pending in its store.
        let store = dispatcher.inner.incomer_store(&dying);
        let register_main = store
            .set(TransactionDraft {
                name: EVENT_REGISTER.to_string(),
                origin: dying,
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let approval = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: EVENT_APPROVEMENT.to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(dying),
                related_transaction: Some(register_main.transaction_id),
                event_transaction_id: Some(register_main.transaction_id),
                ..Default::default()
            })
            .await
            .unwrap();

        let record = dispatcher
            .inner
            .registry
            .get_incomer(&dying)
            .await
            .unwrap()
            .unwrap();
        dispatcher.inner.evict_incomer(&record).await.unwrap();

        // Both sides are gone, and nothing was migrated or parked.
        assert!(store.get_all().await.unwrap().is_empty());
        assert!(dispatcher
            .inner
            .dispatcher_store
            .get(&approval.transaction_id)
            .await
            .unwrap()
            .is_none());
        assert!(dispatcher
            .inner
            .incomer_store(&sibling)
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .backup_incomer_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .backup_dispatcher_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_main_migrates_to_sibling_and_children_follow() {
        let broker = MemoryBroker::new();
        let dispatcher = build(&broker);
        let f1 = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &["accountingFolder"], Vec::new()))
            .await
            .unwrap();
        let f2 = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &["accountingFolder"], Vec::new()))
            .await
            .unwrap();

        let main = dispatcher
            .inner
            .incomer_store(&f1)
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: f1,
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let child = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(Uuid::new_v4()),
                related_transaction: Some(main.transaction_id),
                event_transaction_id: Some(main.transaction_id),
                ..Default::default()
            })
            .await
            .unwrap();

        let record = dispatcher
            .inner
            .registry
            .get_incomer(&f1)
            .await
            .unwrap()
            .unwrap();
        dispatcher.inner.evict_incomer(&record).await.unwrap();

        // The main lives in F2's store now, with a rewritten origin.
        let migrated = dispatcher.inner.incomer_store(&f2).get_all().await.unwrap();
        assert_eq!(migrated.len(), 1);
        let new_main = migrated.values().next().unwrap();
        assert_eq!(new_main.origin, f2);
        assert!(new_main.main_transaction);
        assert_ne!(new_main.transaction_id, main.transaction_id);

        // The dispatcher child follows the new main.
        let rewritten = dispatcher
            .inner
            .dispatcher_store
            .get(&child.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rewritten.to, Some(f2));
        assert_eq!(
            rewritten.related_transaction,
            Some(new_main.transaction_id)
        );
        assert!(!rewritten.main_transaction);

        // Old store is empty, nothing parked.
        assert!(dispatcher
            .inner
            .incomer_store(&f1)
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .backup_incomer_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_main_without_sibling_parks_in_backup() {
        let broker = MemoryBroker::new();
        let dispatcher = build(&broker);
        let f1 = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &["accountingFolder"], Vec::new()))
            .await
            .unwrap();

        let main = dispatcher
            .inner
            .incomer_store(&f1)
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: f1,
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let record = dispatcher
            .inner
            .registry
            .get_incomer(&f1)
            .await
            .unwrap()
            .unwrap();
        dispatcher.inner.evict_incomer(&record).await.unwrap();

        // Parked under its original id so children keep resolving.
        let parked = dispatcher
            .inner
            .backup_incomer_store
            .get(&main.transaction_id)
            .await
            .unwrap();
        assert!(parked.is_some());
        assert!(parked.unwrap().main_transaction);
    }

    #[tokio::test]
    async fn test_unresolved_related_without_subscriber_parks() {
        let broker = MemoryBroker::new();
        let dispatcher = build(&broker);
        let consumer = dispatcher
            .inner
            .registry
            .set_incomer(incomer(
                "consumer",
                &[],
                vec![Subscription::new("accountingFolder")],
            ))
            .await
            .unwrap();

        let store = dispatcher.inner.incomer_store(&consumer);
        let related = store
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: consumer,
                related_transaction: Some(Uuid::new_v4()),
                event_transaction_id: Some(Uuid::new_v4()),
                resolved: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let record = dispatcher
            .inner
            .registry
            .get_incomer(&consumer)
            .await
            .unwrap()
            .unwrap();
        dispatcher.inner.evict_incomer(&record).await.unwrap();

        assert!(dispatcher
            .inner
            .backup_incomer_store
            .get(&related.transaction_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_related_rehomes_to_other_subscriber() {
        let broker = MemoryBroker::new();
        let dispatcher = build(&broker);
        let dying = dispatcher
            .inner
            .registry
            .set_incomer(incomer(
                "a",
                &[],
                vec![Subscription::new("accountingFolder")],
            ))
            .await
            .unwrap();
        let surviving = dispatcher
            .inner
            .registry
            .set_incomer(incomer(
                "b",
                &[],
                vec![Subscription::new("accountingFolder")],
            ))
            .await
            .unwrap();

        let main_id = Uuid::new_v4();
        let old_child = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(dying),
                related_transaction: Some(main_id),
                event_transaction_id: Some(main_id),
                ..Default::default()
            })
            .await
            .unwrap();
        dispatcher
            .inner
            .incomer_store(&dying)
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: dying,
                related_transaction: Some(old_child.transaction_id),
                event_transaction_id: Some(main_id),
                resolved: false,
                iteration: 0,
                ..Default::default()
            })
            .await
            .unwrap();

        let record = dispatcher
            .inner
            .registry
            .get_incomer(&dying)
            .await
            .unwrap()
            .unwrap();
        dispatcher.inner.evict_incomer(&record).await.unwrap();

        // The previous dispatcher child is gone; exactly one fresh child
        // targets the survivor with a bumped iteration.
        let children = dispatcher.inner.dispatcher_store.get_all().await.unwrap();
        assert_eq!(children.len(), 1);
        let fresh = children.values().next().unwrap();
        assert!(fresh.transaction_id != old_child.transaction_id);
        assert_eq!(fresh.to, Some(surviving));
        assert_eq!(fresh.related_transaction, Some(main_id));
        assert_eq!(fresh.iteration, 1);
    }

    #[tokio::test]
    async fn test_dispatcher_transactions_to_evicted_are_parked() {
        let broker = MemoryBroker::new();
        let dispatcher = build(&broker);
        let dying = dispatcher
            .inner
            .registry
            .set_incomer(incomer(
                "only",
                &[],
                vec![Subscription::new("accountingFolder")],
            ))
            .await
            .unwrap();

        let child = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(dying),
                related_transaction: Some(Uuid::new_v4()),
                ..Default::default()
            })
            .await
            .unwrap();

        let record = dispatcher
            .inner
            .registry
            .get_incomer(&dying)
            .await
            .unwrap()
            .unwrap();
        dispatcher.inner.evict_incomer(&record).await.unwrap();

        assert!(dispatcher
            .inner
            .dispatcher_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .backup_dispatcher_store
            .get(&child.transaction_id)
            .await
            .unwrap()
            .is_some());
    }
}
