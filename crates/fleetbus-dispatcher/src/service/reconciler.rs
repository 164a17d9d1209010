//! # Transaction Reconciler
//!
//! The periodic pass that makes the delivery log converge. Three steps,
//! in order: redistribute parked backups to incomers that can take them,
//! sweep resolved transaction pairs, and clear fully-resolved mains. The
//! pass never overlaps itself; everything it does is idempotent, so a
//! lost update in one tick is repaired by the next.

use shared_types::{Transaction, EVENT_APPROVEMENT};
use tracing::debug;
use uuid::Uuid;

use super::DispatcherInner;
use crate::errors::DispatchError;

impl DispatcherInner {
    /// One full reconciliation pass. Re-entrant calls return immediately.
    pub(crate) async fn reconcile(&self) -> Result<(), DispatchError> {
        let Ok(_guard) = self.reconcile_gate.try_lock() else {
            debug!("reconciliation already running, skipping tick");
            return Ok(());
        };
        self.redistribute_backups().await?;
        self.resolve_pairs().await?;
        self.resolve_mains().await?;
        Ok(())
    }

    /// Step (a): drain the backup stores toward live incomers.
    async fn redistribute_backups(&self) -> Result<(), DispatchError> {
        let incomers = self.registry.get_incomers().await?;

        for (id, backup) in self.backup_incomer_store.get_all().await? {
            if backup.main_transaction {
                let Some(service) = backup.incomer_name.clone() else {
                    continue;
                };
                let Some(heir) = incomers
                    .iter()
                    .find(|i| i.name == service && i.casts(&backup.name))
                else {
                    continue;
                };
                let mut migrated = backup;
                migrated.origin = heir.provided_uuid;
                self.incomer_store(&heir.provided_uuid)
                    .insert(migrated)
                    .await?;
                self.backup_incomer_store.delete(&id).await?;
                debug!(transaction = %id, heir = %heir.provided_uuid, "backup main migrated");
            } else if backup.related_transaction.is_some() {
                let Some(target) = incomers
                    .iter()
                    .find(|i| i.subscription(&backup.name).is_some())
                else {
                    continue;
                };
                if backup.resolved {
                    self.incomer_store(&target.provided_uuid)
                        .insert(backup)
                        .await?;
                } else {
                    // The parked dispatcher child this record answered is
                    // superseded by the fresh publish.
                    if let Some(previous) = backup.related_transaction {
                        self.backup_dispatcher_store.delete(&previous).await?;
                    }
                    self.republish_child(
                        &backup.name,
                        backup.data.clone(),
                        backup.event_transaction_id,
                        backup.event_transaction_id,
                        target,
                        backup.iteration + 1,
                    )
                    .await?;
                }
                self.backup_incomer_store.delete(&id).await?;
            }
        }

        for (id, backup) in self.backup_dispatcher_store.get_all().await? {
            let Some(target) = incomers
                .iter()
                .find(|i| i.subscription(&backup.name).is_some())
            else {
                continue;
            };
            self.republish_child(
                &backup.name,
                backup.data.clone(),
                backup.related_transaction,
                backup.event_transaction_id,
                target,
                backup.iteration + 1,
            )
            .await?;
            self.backup_dispatcher_store.delete(&id).await?;
            debug!(transaction = %id, target = %target.provided_uuid, "parked event republished");
        }
        Ok(())
    }

    /// Step (b): sweep dispatcher transactions whose recipient resolved
    /// its side.
    async fn resolve_pairs(&self) -> Result<(), DispatchError> {
        let incomers = self.registry.get_incomers().await?;

        for (child_id, mut child) in self.dispatcher_store.get_all().await? {
            let Some(to) = child.to else { continue };
            let Some(recipient) = incomers.iter().find(|i| i.provided_uuid == to) else {
                // Unknown recipient: eviction will re-home or park this
                // transaction if it never returns.
                debug!(transaction = %child_id, to = %to, "recipient absent, skipping");
                continue;
            };

            let store = self.incomer_store(&to);
            let answers = store.get_all().await?;
            let Some(answer_id) = answers
                .iter()
                .find(|(_, a)| a.related_transaction == Some(child_id) && a.resolved)
                .map(|(id, _)| *id)
            else {
                continue; // still in flight
            };

            if child.main_transaction {
                // A self-originated ping that was answered.
                self.registry.update_incomer_state(&to).await?;
                store.delete(&answer_id).await?;
                self.dispatcher_store.delete(&child_id).await?;
            } else if child.name == EVENT_APPROVEMENT {
                store.delete(&answer_id).await?;
                self.dispatcher_store.delete(&child_id).await?;
            } else {
                child.resolved = true;
                self.dispatcher_store.update(&child_id, child).await?;
                store.delete(&answer_id).await?;
                self.registry
                    .update_incomer_state(&recipient.provided_uuid)
                    .await?;
            }
        }
        Ok(())
    }

    /// Step (c): clear publisher mains once every child resolved.
    async fn resolve_mains(&self) -> Result<(), DispatchError> {
        let incomers = self.registry.get_incomers().await?;

        for owner in &incomers {
            let store = self.incomer_store(&owner.provided_uuid);
            let transactions = store.get_all().await?;

            for (main_id, main) in transactions.iter().filter(|(_, t)| t.main_transaction) {
                // Fan-out was not observed yet: leave the main alone.
                if !main.published {
                    continue;
                }

                let children: Vec<(Uuid, Transaction)> = self
                    .dispatcher_store
                    .get_all()
                    .await?
                    .into_iter()
                    .filter(|(_, d)| d.related_transaction == Some(*main_id))
                    .collect();
                let backup_children: Vec<(Uuid, Transaction)> = self
                    .backup_dispatcher_store
                    .get_all()
                    .await?
                    .into_iter()
                    .filter(|(_, d)| d.related_transaction == Some(*main_id))
                    .collect();

                let mut outstanding_backups = false;
                for (backup_id, backup) in &backup_children {
                    if let Some(target) = incomers
                        .iter()
                        .find(|i| i.subscription(&backup.name).is_some())
                    {
                        self.republish_child(
                            &backup.name,
                            backup.data.clone(),
                            backup.related_transaction,
                            backup.event_transaction_id,
                            target,
                            backup.iteration + 1,
                        )
                        .await?;
                        self.backup_dispatcher_store.delete(backup_id).await?;
                    }
                    // Either way the main stays this tick: a republished
                    // child is unresolved, an unplaced one still parked.
                    outstanding_backups = true;
                }
                if outstanding_backups {
                    continue;
                }
                if children.iter().any(|(_, d)| !d.resolved) {
                    continue;
                }

                for (child_id, child) in &children {
                    self.dispatcher_store.delete(child_id).await?;
                    if let Some(recipient) = child.to {
                        self.registry.update_incomer_state(&recipient).await?;
                    }
                }
                store.delete(main_id).await?;
                self.registry
                    .update_incomer_state(&owner.provided_uuid)
                    .await?;
                debug!(main = %main_id, owner = %owner.provided_uuid, "main resolved and cleared");
            }
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
    use shared_types::{
        Incomer, ManualClock, Subscription, TransactionDraft, EVENT_PING,
    };
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    const NOW: u64 = 1_000_000;

    fn build(broker: &Arc<MemoryBroker>) -> (Dispatcher, Arc<ManualClock>) {
        let client: Arc<MemoryClient> = Arc::new(MemoryClient::connect(&broker));
        let bus: Arc<dyn ChannelBus> = client.clone();
        let kv: Arc<dyn KeyValue> = client;
        let clock = Arc::new(ManualClock::new(NOW));
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), bus, kv, clock.clone());
        dispatcher.inner.active.store(true, Ordering::SeqCst);
        (dispatcher, clock)
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

    /// Publisher main + resolved consumer answer: one pass clears the
    /// pair and bumps both sides.
    #[tokio::test]
    async fn test_resolved_pair_is_swept_and_both_sides_bumped() {
        let broker = MemoryBroker::new();
        let (dispatcher, clock) = build(&broker);
        let publisher = dispatcher
            .inner
            .registry
            .set_incomer(incomer("pub", &["accountingFolder"], Vec::new()))
            .await
            .unwrap();
        let consumer = dispatcher
            .inner
            .registry
            .set_incomer(incomer(
                "sub",
                &[],
                vec![Subscription::new("accountingFolder")],
            ))
            .await
            .unwrap();

        let mut main = dispatcher
            .inner
            .incomer_store(&publisher)
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: publisher,
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();
        main.published = true;
        dispatcher
            .inner
            .incomer_store(&publisher)
            .update(&main.transaction_id, main.clone())
            .await
            .unwrap();

        let child = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(consumer),
                related_transaction: Some(main.transaction_id),
                event_transaction_id: Some(main.transaction_id),
                ..Default::default()
            })
            .await
            .unwrap();
        dispatcher
            .inner
            .incomer_store(&consumer)
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: consumer,
                related_transaction: Some(child.transaction_id),
                resolved: true,
                ..Default::default()
            })
            .await
            .unwrap();

        clock.set(NOW + 5_000);
        dispatcher.reconcile().await.unwrap();

        assert!(dispatcher
            .inner
            .dispatcher_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .incomer_store(&publisher)
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .incomer_store(&consumer)
            .get_all()
            .await
            .unwrap()
            .is_empty());

        let registry = dispatcher.inner.registry.get_incomers().await.unwrap();
        for record in registry {
            assert_eq!(record.last_activity, NOW + 5_000);
        }
    }

    #[tokio::test]
    async fn test_unresolved_child_keeps_main() {
        let broker = MemoryBroker::new();
        let (dispatcher, _clock) = build(&broker);
        let publisher = dispatcher
            .inner
            .registry
            .set_incomer(incomer("pub", &["e"], Vec::new()))
            .await
            .unwrap();
        let consumer = dispatcher
            .inner
            .registry
            .set_incomer(incomer("sub", &[], vec![Subscription::new("e")]))
            .await
            .unwrap();

        let mut main = dispatcher
            .inner
            .incomer_store(&publisher)
            .set(TransactionDraft {
                name: "e".to_string(),
                origin: publisher,
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();
        main.published = true;
        dispatcher
            .inner
            .incomer_store(&publisher)
            .update(&main.transaction_id, main.clone())
            .await
            .unwrap();
        dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: "e".to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(consumer),
                related_transaction: Some(main.transaction_id),
                ..Default::default()
            })
            .await
            .unwrap();

        dispatcher.reconcile().await.unwrap();

        // No answer yet: everything stays.
        assert_eq!(
            dispatcher
                .inner
                .dispatcher_store
                .get_all()
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(dispatcher
            .inner
            .incomer_store(&publisher)
            .get(&main.transaction_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_answered_ping_bumps_and_clears() {
        let broker = MemoryBroker::new();
        let (dispatcher, clock) = build(&broker);
        let target = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &[], Vec::new()))
            .await
            .unwrap();

        let ping = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: EVENT_PING.to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(target),
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();
        dispatcher
            .inner
            .incomer_store(&target)
            .set(TransactionDraft {
                name: EVENT_PING.to_string(),
                origin: target,
                related_transaction: Some(ping.transaction_id),
                resolved: true,
                ..Default::default()
            })
            .await
            .unwrap();

        clock.set(NOW + 3_000);
        dispatcher.reconcile().await.unwrap();

        assert!(dispatcher
            .inner
            .dispatcher_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .incomer_store(&target)
            .get_all()
            .await
            .unwrap()
            .is_empty());
        let record = dispatcher
            .inner
            .registry
            .get_incomer(&target)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.last_activity, NOW + 3_000);
    }

    #[tokio::test]
    async fn test_approvement_pair_waits_for_resolution() {
        let broker = MemoryBroker::new();
        let (dispatcher, _clock) = build(&broker);
        let newcomer = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &[], Vec::new()))
            .await
            .unwrap();

        let approval = dispatcher
            .inner
            .dispatcher_store
            .set(TransactionDraft {
                name: EVENT_APPROVEMENT.to_string(),
                origin: dispatcher.inner.private_uuid,
                to: Some(newcomer),
                related_transaction: Some(Uuid::new_v4()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Unanswered approval survives the pass.
        dispatcher.reconcile().await.unwrap();
        assert_eq!(
            dispatcher
                .inner
                .dispatcher_store
                .get_all()
                .await
                .unwrap()
                .len(),
            1
        );

        // A resolved answer clears both sides.
        dispatcher
            .inner
            .incomer_store(&newcomer)
            .set(TransactionDraft {
                name: EVENT_APPROVEMENT.to_string(),
                origin: newcomer,
                related_transaction: Some(approval.transaction_id),
                resolved: true,
                ..Default::default()
            })
            .await
            .unwrap();
        dispatcher.reconcile().await.unwrap();
        assert!(dispatcher
            .inner
            .dispatcher_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
        assert!(dispatcher
            .inner
            .incomer_store(&newcomer)
            .get_all()
            .await
            .unwrap()
            .is_empty());
    }

    /// A publish that found no subscriber parks a backup; once a
    /// subscriber registers, the next pass republishes it.
    #[tokio::test]
    async fn test_parked_backup_republished_to_late_subscriber() {
        let broker = MemoryBroker::new();
        let (dispatcher, _clock) = build(&broker);
        let main_id = Uuid::new_v4();
        dispatcher
            .inner
            .backup_dispatcher_store
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: Uuid::new_v4(),
                to: None,
                related_transaction: Some(main_id),
                event_transaction_id: Some(main_id),
                ..Default::default()
            })
            .await
            .unwrap();

        // Nobody subscribes: the backup stays parked.
        dispatcher.reconcile().await.unwrap();
        assert_eq!(
            dispatcher
                .inner
                .backup_dispatcher_store
                .get_all()
                .await
                .unwrap()
                .len(),
            1
        );

        let late = dispatcher
            .inner
            .registry
            .set_incomer(incomer(
                "late",
                &[],
                vec![Subscription::new("accountingFolder")],
            ))
            .await
            .unwrap();
        dispatcher.reconcile().await.unwrap();

        assert!(dispatcher
            .inner
            .backup_dispatcher_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
        let children = dispatcher.inner.dispatcher_store.get_all().await.unwrap();
        assert_eq!(children.len(), 1);
        let fresh = children.values().next().unwrap();
        assert_eq!(fresh.to, Some(late));
        assert_eq!(fresh.related_transaction, Some(main_id));
        assert_eq!(fresh.iteration, 1);
    }

    #[tokio::test]
    async fn test_backup_main_migrates_to_live_caster() {
        let broker = MemoryBroker::new();
        let (dispatcher, _clock) = build(&broker);
        let parked = dispatcher
            .inner
            .backup_incomer_store
            .set(TransactionDraft {
                name: "accountingFolder".to_string(),
                origin: Uuid::new_v4(),
                incomer_name: Some("foo".to_string()),
                main_transaction: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let heir = dispatcher
            .inner
            .registry
            .set_incomer(incomer("foo", &["accountingFolder"], Vec::new()))
            .await
            .unwrap();
        dispatcher.reconcile().await.unwrap();

        assert!(dispatcher
            .inner
            .backup_incomer_store
            .get_all()
            .await
            .unwrap()
            .is_empty());
        let migrated = dispatcher
            .inner
            .incomer_store(&heir)
            .get(&parked.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(migrated.origin, heir);
        assert!(migrated.main_transaction);
    }

    #[tokio::test]
    async fn test_reconcile_does_not_reenter() {
        let broker = MemoryBroker::new();
        let (dispatcher, _clock) = build(&broker);
        let _held = dispatcher.inner.reconcile_gate.lock().await;
        // With the gate held, the pass skips without touching anything.
        dispatcher.reconcile().await.unwrap();
    }
}
