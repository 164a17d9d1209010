//! # Dispatcher Service
//!
//! Orchestration of the dispatcher role: the message loop, the three
//! periodic tasks (ping, activity check, reconciliation) and the
//! election/relay state machine. All coordinated state lives in broker
//! keys; the only in-process state is the subscription set, the timer
//! handles and the active flag.

mod election;
mod eviction;
mod liveness;
mod reconciler;
mod registration;
mod router;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared_bus::{ChannelBus, KeyValue};
use shared_types::{dispatcher_channel, Clock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::errors::DispatchError;
use crate::store::{keys, IncomerRegistry, TransactionStore};

pub(crate) struct DispatcherInner {
    pub(crate) config: DispatcherConfig,
    pub(crate) bus: Arc<dyn ChannelBus>,
    pub(crate) clock: Arc<dyn Clock>,

    /// Lifetime identity of this process on the bus.
    pub(crate) private_uuid: Uuid,
    pub(crate) dispatcher_channel_name: String,

    /// True while this process plays the active dispatcher role.
    pub(crate) active: AtomicBool,

    /// Fired whenever a foreign `OK` announcement arrives.
    pub(crate) foreign_ok: Notify,

    shutdown: watch::Sender<bool>,

    /// Reconciliation passes must not overlap themselves.
    pub(crate) reconcile_gate: tokio::sync::Mutex<()>,

    pub(crate) dispatcher_store: TransactionStore,
    pub(crate) backup_dispatcher_store: TransactionStore,
    pub(crate) backup_incomer_store: TransactionStore,
    pub(crate) registry: IncomerRegistry,

    kv: Arc<dyn KeyValue>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscribed: Mutex<HashSet<String>>,
    periodic_started: AtomicBool,
}

/// The dispatcher service.
///
/// Construct with [`Dispatcher::new`], then call [`Dispatcher::initialize`]
/// to join the election. The periodic entry points (`ping_round`,
/// `check_last_activity`, `reconcile`) are called from the internal timer
/// tasks and are public so tests can drive passes deterministically.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Build a dispatcher over the given broker ports and clock.
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        bus: Arc<dyn ChannelBus>,
        kv: Arc<dyn KeyValue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let prefix = config.prefix.clone();
        let (shutdown, _) = watch::channel(false);
        let inner = DispatcherInner {
            dispatcher_channel_name: dispatcher_channel(&prefix),
            private_uuid: Uuid::new_v4(),
            active: AtomicBool::new(false),
            foreign_ok: Notify::new(),
            shutdown,
            reconcile_gate: tokio::sync::Mutex::new(()),
            dispatcher_store: TransactionStore::new(
                Arc::clone(&kv),
                Arc::clone(&clock),
                keys::dispatcher_transactions(&prefix),
            ),
            backup_dispatcher_store: TransactionStore::new(
                Arc::clone(&kv),
                Arc::clone(&clock),
                keys::backup_dispatcher_transactions(&prefix),
            ),
            backup_incomer_store: TransactionStore::new(
                Arc::clone(&kv),
                Arc::clone(&clock),
                keys::backup_incomer_transactions(&prefix),
            ),
            registry: IncomerRegistry::new(
                Arc::clone(&kv),
                Arc::clone(&clock),
                keys::incomer_registry(&prefix),
            ),
            config,
            bus,
            kv,
            clock,
            tasks: Mutex::new(Vec::new()),
            subscribed: Mutex::new(HashSet::new()),
            periodic_started: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Join the election: become active, or stand by behind a live peer.
    pub async fn initialize(&self) -> Result<(), DispatchError> {
        Arc::clone(&self.inner).initialize().await
    }

    /// Shut down: cancel timers, unsubscribe channels, drop the role.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// True while this process plays the active dispatcher role.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// This process's lifetime identity on the bus.
    #[must_use]
    pub fn private_uuid(&self) -> Uuid {
        self.inner.private_uuid
    }

    /// One ping pass over the registry.
    ///
    /// Called from the timer task every `ping_interval`; public for
    /// deterministic testing.
    pub async fn ping_round(&self) -> Result<(), DispatchError> {
        self.inner.ping_round().await
    }

    /// One eviction-scan pass over the registry.
    ///
    /// Called from the timer task every `check_last_activity_interval`;
    /// public for deterministic testing.
    pub async fn check_last_activity(&self) -> Result<(), DispatchError> {
        self.inner.check_last_activity().await
    }

    /// One full reconciliation pass.
    ///
    /// Called from the timer task every `check_transaction_interval`;
    /// public for deterministic testing. Re-entrant calls return without
    /// doing work.
    pub async fn reconcile(&self) -> Result<(), DispatchError> {
        self.inner.reconcile().await
    }
}

impl DispatcherInner {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn incomer_store(&self, incomer_uuid: &Uuid) -> TransactionStore {
        TransactionStore::new(
            Arc::clone(&self.kv),
            Arc::clone(&self.clock),
            keys::incomer_transactions(&self.config.prefix, incomer_uuid),
        )
    }

    async fn initialize(self: Arc<Self>) -> Result<(), DispatchError> {
        self.ensure_subscribed(&self.dispatcher_channel_name).await?;
        let Some(inbox) = self.bus.take_messages() else {
            warn!("inbound stream already taken; initialize called twice?");
            return Ok(());
        };
        Arc::clone(&self).spawn_message_loop(inbox);

        let now = self.clock.now_ms();
        let incomers = self.registry.get_incomers().await?;
        if let Some(peer) = self.find_live_active_peer(&incomers, now) {
            info!(
                peer_base = %peer.base_uuid,
                instance = %self.config.instance_name,
                "live dispatcher detected, standing by"
            );
            self.spawn_standby();
            return Ok(());
        }

        if !Arc::clone(&self).attempt_takeover(None).await? {
            info!("lost the announcement race, standing by");
            self.spawn_standby();
        }
        Ok(())
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let channels: Vec<String> = self.subscribed.lock().drain().collect();
        for channel in channels {
            if let Err(err) = self.bus.unsubscribe(&channel).await {
                warn!(channel, error = %err, "unsubscribe failed on close");
            }
        }
        self.active.store(false, Ordering::SeqCst);
        info!("dispatcher closed");
    }

    /// Subscribe once; later calls for the same channel are no-ops.
    pub(crate) async fn ensure_subscribed(&self, channel: &str) -> Result<(), DispatchError> {
        if !self.subscribed.lock().insert(channel.to_string()) {
            return Ok(());
        }
        self.bus.subscribe(channel).await?;
        debug!(channel, "subscribed");
        Ok(())
    }

    pub(crate) async fn unsubscribe_channel(&self, channel: &str) {
        if self.subscribed.lock().remove(channel) {
            if let Err(err) = self.bus.unsubscribe(channel).await {
                warn!(channel, error = %err, "unsubscribe failed");
            }
        }
    }

    /// Subscribe to every registered incomer's private channel.
    pub(crate) async fn subscribe_all_incomers(&self) -> Result<(), DispatchError> {
        for incomer in self.registry.get_incomers().await? {
            let channel =
                shared_types::incomer_channel(&self.config.prefix, &incomer.provided_uuid);
            self.ensure_subscribed(&channel).await?;
        }
        Ok(())
    }

    pub(crate) fn spawn_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    fn spawn_message_loop(
        self: Arc<Self>,
        mut inbox: tokio::sync::mpsc::UnboundedReceiver<shared_bus::ChannelMessage>,
    ) {
        let inner = Arc::clone(&self);
        let mut shutdown = self.shutdown_signal();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    message = inbox.recv() => {
                        let Some(message) = message else { return };
                        if let Err(err) = inner.handle_channel_message(&message).await {
                            warn!(
                                channel = %message.channel,
                                message = %message.payload,
                                error = %err,
                                "message handling failed"
                            );
                        }
                    }
                }
            }
        });
        self.spawn_task(task);
    }

    /// Start the ping, activity-check and reconciliation loops. Idempotent.
    pub(crate) fn start_periodic_tasks(self: Arc<Self>) {
        if self.periodic_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let ping = self.config.ping_interval_ms;
        let activity = self.config.check_last_activity_interval_ms;
        let transactions = self.config.check_transaction_interval_ms;
        Arc::clone(&self).spawn_periodic(ping, "ping", |inner| async move {
            inner.ping_round().await
        });
        Arc::clone(&self).spawn_periodic(activity, "activity check", |inner| async move {
            inner.check_last_activity().await
        });
        self.spawn_periodic(transactions, "reconciliation", |inner| async move {
            inner.reconcile().await
        });
    }

    fn spawn_periodic<F, Fut>(self: Arc<Self>, period_ms: u64, label: &'static str, pass: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), DispatchError>> + Send,
    {
        let inner = Arc::clone(&self);
        let mut shutdown = self.shutdown_signal();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
            // The first tick of `interval` fires immediately; passes
            // start one full period after activation.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        if let Err(err) = pass(Arc::clone(&inner)).await {
                            warn!(error = %err, "{label} pass failed");
                        }
                    }
                }
            }
        });
        self.spawn_task(task);
    }
}
