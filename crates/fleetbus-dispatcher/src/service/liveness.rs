//! # Ping / Liveness
//!
//! While active, the dispatcher probes every incomer on its private
//! channel and keeps a main ping transaction per probe. The activity
//! check runs on its own cadence: incomers past the idle threshold are
//! eviction candidates unless a recent ping answer sits in their store.

use shared_types::{incomer_channel, EventMessage, RedisMetadata, TransactionDraft, EVENT_PING};
use tracing::{debug, info};

use super::DispatcherInner;
use crate::errors::DispatchError;

impl DispatcherInner {
    /// One ping pass over the registry.
    ///
    /// For every foreign incomer: write a dispatcher-side main ping
    /// transaction and publish `ping` on its private channel. The
    /// dispatcher's own incomer record is bumped directly instead of
    /// pinged.
    pub(crate) async fn ping_round(&self) -> Result<(), DispatchError> {
        for incomer in self.registry.get_incomers().await? {
            if incomer.base_uuid == self.config.incomer_uuid {
                self.registry
                    .update_incomer_state(&incomer.provided_uuid)
                    .await?;
                continue;
            }

            let transaction = self
                .dispatcher_store
                .set(TransactionDraft {
                    name: EVENT_PING.to_string(),
                    origin: self.private_uuid,
                    to: Some(incomer.provided_uuid),
                    incomer_name: Some(incomer.name.clone()),
                    prefix: self.config.prefix_field(),
                    main_transaction: true,
                    related_transaction: None,
                    resolved: false,
                    ..Default::default()
                })
                .await?;

            let message = EventMessage::protocol(
                EVENT_PING,
                RedisMetadata {
                    origin: self.private_uuid,
                    to: Some(incomer.provided_uuid),
                    incomer_name: Some(incomer.name.clone()),
                    prefix: self.config.prefix_field(),
                    transaction_id: Some(transaction.transaction_id),
                    main_transaction: Some(true),
                    resolved: Some(false),
                    ..Default::default()
                },
            );
            let channel = incomer_channel(&self.config.prefix, &incomer.provided_uuid);
            self.bus
                .publish(&channel, &serde_json::to_value(&message)?)
                .await?;
            debug!(incomer = %incomer.provided_uuid, "ping sent");
        }
        Ok(())
    }

    /// One eviction-scan pass.
    ///
    /// Candidates are incomers whose `lastActivity` fell past the idle
    /// threshold. A candidate holding a ping transaction still inside
    /// the window counts as alive: its record is bumped and the stale
    /// ping consumed. Everyone else is evicted.
    pub(crate) async fn check_last_activity(&self) -> Result<(), DispatchError> {
        let now = self.clock.now_ms();
        let idle = self.config.idle_time_ms;

        for incomer in self.registry.get_incomers().await? {
            if !incomer.is_idle(now, idle) {
                continue;
            }

            let store = self.incomer_store(&incomer.provided_uuid);
            let transactions = store.get_all().await?;
            let recent_ping = transactions
                .iter()
                .find(|(_, tx)| tx.name == EVENT_PING && tx.alive_since.saturating_add(idle) > now)
                .map(|(id, _)| *id);

            if let Some(ping_id) = recent_ping {
                debug!(
                    incomer = %incomer.provided_uuid,
                    "idle record but recent ping answer, bumping"
                );
                self.registry
                    .update_incomer_state(&incomer.provided_uuid)
                    .await?;
                store.delete(&ping_id).await?;
                continue;
            }

            info!(
                incomer = %incomer.provided_uuid,
                name = %incomer.name,
                last_activity = incomer.last_activity,
                "idle incomer, evicting"
            );
            self.evict_incomer(&incomer).await?;
        }
        Ok(())
    }
}
