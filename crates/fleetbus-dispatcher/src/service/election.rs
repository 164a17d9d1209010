//! # Leader Election & Relay
//!
//! Dispatcher replicas share an `instance_name`. At most one of them is
//! active; the rest stand by and poll for its disappearance. The role is
//! won by a jittered race: wait a uniform random delay, and if no other
//! replica announces `OK` first, announce and take the role. Losing the
//! race is quiet — the loser simply keeps standing by.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use shared_types::{EventMessage, Incomer, RedisMetadata, EVENT_OK};
use tracing::{debug, info, warn};

use super::DispatcherInner;
use crate::errors::DispatchError;

impl DispatcherInner {
    /// A foreign dispatcher record of our `instance_name` still inside
    /// the idle window.
    pub(crate) fn find_live_active_peer<'a>(
        &self,
        incomers: &'a [Incomer],
        now: u64,
    ) -> Option<&'a Incomer> {
        incomers.iter().find(|incomer| {
            incomer.name == self.config.instance_name
                && incomer.base_uuid != self.config.incomer_uuid
                && incomer.is_dispatcher_active_instance
                && !incomer.is_idle(now, self.config.idle_time_ms)
        })
    }

    /// A foreign dispatcher record that fell past the idle window.
    fn find_stale_peer<'a>(&self, incomers: &'a [Incomer], now: u64) -> Option<&'a Incomer> {
        incomers.iter().find(|incomer| {
            incomer.name == self.config.instance_name
                && incomer.base_uuid != self.config.incomer_uuid
                && incomer.is_dispatcher_active_instance
                && incomer.is_idle(now, self.config.idle_time_ms)
        })
    }

    /// Race a jittered self-announcement against a foreign `OK`.
    ///
    /// Returns true if this process took the role. `lost_peer` carries
    /// the stale record being replaced on a relay takeover.
    pub(crate) async fn attempt_takeover(
        self: Arc<Self>,
        lost_peer: Option<Incomer>,
    ) -> Result<bool, DispatchError> {
        let jitter_ms = {
            let mut rng = rand::thread_rng();
            let upper = self.config.max_timeout_ms.max(self.config.min_timeout_ms);
            rng.gen_range(self.config.min_timeout_ms..=upper)
        };
        debug!(jitter_ms, "racing for the dispatcher role");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
            _ = self.foreign_ok.notified() => {
                debug!("foreign announcement won the race");
                return Ok(false);
            }
        }

        self.become_active(lost_peer).await?;
        Ok(true)
    }

    async fn become_active(self: Arc<Self>, lost_peer: Option<Incomer>) -> Result<(), DispatchError> {
        let taking_relay = lost_peer.is_some();
        if let Some(peer) = lost_peer {
            info!(
                peer_base = %peer.base_uuid,
                "taking relay from lost dispatcher"
            );
            self.registry.delete_incomer(&peer.provided_uuid).await?;
        }

        // Flag our own incomer record (if this process registered one)
        // as the active instance.
        for incomer in self.registry.get_incomers().await? {
            if incomer.base_uuid == self.config.incomer_uuid
                && !incomer.is_dispatcher_active_instance
            {
                let mut record = incomer;
                record.is_dispatcher_active_instance = true;
                self.registry.update_incomer(&record).await?;
            }
        }

        let announcement = EventMessage::protocol(
            EVENT_OK,
            RedisMetadata {
                origin: self.private_uuid,
                ..Default::default()
            },
        );
        self.bus
            .publish(
                &self.dispatcher_channel_name,
                &serde_json::to_value(&announcement)?,
            )
            .await?;

        self.active.store(true, Ordering::SeqCst);
        info!(private_uuid = %self.private_uuid, "dispatcher role taken");

        self.subscribe_all_incomers().await?;

        if taking_relay {
            // The lost peer's transactions cannot wait a full ping
            // period: probe everyone now and reconcile once answers had
            // a chance to land.
            self.ping_round().await?;
            let inner = Arc::clone(&self);
            let delay = Duration::from_millis(self.config.check_transaction_interval_ms);
            let mut shutdown = self.shutdown_signal();
            self.spawn_task(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(err) = inner.reconcile().await {
                    warn!(error = %err, "post-relay reconciliation failed");
                }
            }));
        }

        self.start_periodic_tasks();
        Ok(())
    }

    /// Start the standby poll: every `ping_interval`, look for a stale
    /// active peer and race for its role.
    pub(crate) fn spawn_standby(self: Arc<Self>) {
        let inner = Arc::clone(&self);
        let mut shutdown = self.shutdown_signal();
        let period = Duration::from_millis(self.config.ping_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        if inner.is_active() {
                            return;
                        }
                        match Arc::clone(&inner).take_relay().await {
                            Ok(true) => return,
                            Ok(false) => {}
                            Err(err) => warn!(error = %err, "relay poll failed"),
                        }
                    }
                }
            }
        });
        self.spawn_task(task);
    }

    async fn take_relay(self: Arc<Self>) -> Result<bool, DispatchError> {
        let now = self.clock.now_ms();
        let incomers = self.registry.get_incomers().await?;
        let Some(peer) = self.find_stale_peer(&incomers, now).cloned() else {
            return Ok(false);
        };
        self.attempt_takeover(Some(peer)).await
    }
}
