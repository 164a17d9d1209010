//! Simulated incomers and observation helpers.
//!
//! A [`SimulatedIncomer`] holds its own broker connection and mimics the
//! client library closely enough for the dispatcher protocol: it logs a
//! main transaction before each publish, answers pings, and acknowledges
//! delivered events with resolved transactions. The [`StoreObserver`]
//! reads the shared stores the way any external tool reading the broker
//! keys would.

use std::sync::Arc;
use std::time::Duration;

use fleetbus_dispatcher::{
    keys, Dispatcher, DispatcherConfig, EventsValidation, IncomerRegistry, TransactionStore,
};
use serde_json::{json, Value};
use shared_bus::{ChannelBus, ChannelMessage, KeyValue, MemoryBroker, MemoryClient};
use shared_types::{
    dispatcher_channel, incomer_channel, Clock, EventMessage, ManualClock, RedisMetadata,
    Subscription, TransactionDraft, EVENT_APPROVEMENT, EVENT_OK, EVENT_PING, EVENT_REGISTER,
};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Milliseconds the harness starts its manual clock at.
pub const START_MS: u64 = 1_000_000;

/// Shared test substrate: one broker, one manual clock.
pub struct TestCluster {
    pub broker: Arc<MemoryBroker>,
    pub clock: Arc<ManualClock>,
}

impl TestCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            clock: Arc::new(ManualClock::new(START_MS)),
        }
    }

    /// A dispatcher config with a fast election and timers long enough
    /// that tests drive every pass by hand.
    #[must_use]
    pub fn dispatcher_config(&self, events: &[&str]) -> DispatcherConfig {
        let mut validation = EventsValidation::default();
        for event in events {
            validation.insert_permissive(*event);
        }
        DispatcherConfig {
            min_timeout_ms: 0,
            max_timeout_ms: 5,
            ping_interval_ms: 60_000,
            events_validation: validation,
            ..Default::default()
        }
    }

    /// Build a dispatcher on its own broker connection.
    #[must_use]
    pub fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher {
        let client: Arc<MemoryClient> = Arc::new(MemoryClient::connect(&self.broker));
        let bus: Arc<dyn ChannelBus> = client.clone();
        let kv: Arc<dyn KeyValue> = client;
        Dispatcher::new(config, bus, kv, self.clock.clone())
    }

    /// Build, initialize and wait for the dispatcher to win the race.
    pub async fn active_dispatcher(&self, events: &[&str]) -> Dispatcher {
        let dispatcher = self.dispatcher(self.dispatcher_config(events));
        dispatcher.initialize().await.expect("initialize");
        wait_active(&dispatcher).await;
        dispatcher
    }

    #[must_use]
    pub fn observer(&self) -> StoreObserver {
        StoreObserver {
            kv: Arc::new(MemoryClient::connect(&self.broker)),
            clock: self.clock.clone(),
        }
    }

    pub async fn incomer(
        &self,
        name: &str,
        casts: &[&str],
        subscriptions: Vec<Subscription>,
    ) -> SimulatedIncomer {
        SimulatedIncomer::connect(&self.broker, &self.clock, name, casts, subscriptions).await
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll until the dispatcher reports itself active.
pub async fn wait_active(dispatcher: &Dispatcher) {
    for _ in 0..100 {
        if dispatcher.is_active() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatcher never became active");
}

/// Let in-flight channel deliveries land.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Reads the shared stores like any external observer of the broker.
pub struct StoreObserver {
    kv: Arc<MemoryClient>,
    clock: Arc<ManualClock>,
}

impl StoreObserver {
    fn kv(&self) -> Arc<dyn KeyValue> {
        self.kv.clone()
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    #[must_use]
    pub fn dispatcher_store(&self) -> TransactionStore {
        TransactionStore::new(self.kv(), self.clock(), keys::dispatcher_transactions(""))
    }

    #[must_use]
    pub fn backup_dispatcher_store(&self) -> TransactionStore {
        TransactionStore::new(
            self.kv(),
            self.clock(),
            keys::backup_dispatcher_transactions(""),
        )
    }

    #[must_use]
    pub fn backup_incomer_store(&self) -> TransactionStore {
        TransactionStore::new(
            self.kv(),
            self.clock(),
            keys::backup_incomer_transactions(""),
        )
    }

    #[must_use]
    pub fn incomer_store(&self, provided_uuid: &Uuid) -> TransactionStore {
        TransactionStore::new(
            self.kv(),
            self.clock(),
            keys::incomer_transactions("", provided_uuid),
        )
    }

    #[must_use]
    pub fn registry(&self) -> IncomerRegistry {
        IncomerRegistry::new(self.kv(), self.clock(), keys::incomer_registry(""))
    }
}

/// A scripted stand-in for the incomer client library.
pub struct SimulatedIncomer {
    client: Arc<MemoryClient>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    clock: Arc<ManualClock>,
    pub base_uuid: Uuid,
    pub provided_uuid: Option<Uuid>,
    pub name: String,
    events_cast: Vec<String>,
    events_subscribe: Vec<Subscription>,
}

impl SimulatedIncomer {
    pub async fn connect(
        broker: &Arc<MemoryBroker>,
        clock: &Arc<ManualClock>,
        name: &str,
        casts: &[&str],
        subscriptions: Vec<Subscription>,
    ) -> Self {
        let client = Arc::new(MemoryClient::connect(&broker));
        client
            .subscribe(&dispatcher_channel(""))
            .await
            .expect("subscribe dispatcher channel");
        let inbox = client.take_messages().expect("inbox");
        Self {
            client,
            inbox: tokio::sync::Mutex::new(inbox),
            clock: clock.clone(),
            base_uuid: Uuid::new_v4(),
            provided_uuid: None,
            name: name.to_string(),
            events_cast: casts.iter().map(|s| (*s).to_string()).collect(),
            events_subscribe: subscriptions,
        }
    }

    fn store_for(&self, uuid: &Uuid) -> TransactionStore {
        TransactionStore::new(
            self.client.clone(),
            self.clock.clone(),
            keys::incomer_transactions("", uuid),
        )
    }

    /// The incomer-side transaction store (post-approval identity).
    #[must_use]
    pub fn store(&self) -> TransactionStore {
        self.store_for(&self.provided().expect("not registered"))
    }

    #[must_use]
    pub fn provided(&self) -> Option<Uuid> {
        self.provided_uuid
    }

    /// Register with the dispatcher and wait for approval.
    pub async fn register(&mut self) -> Uuid {
        let register_main = self
            .store_for(&self.base_uuid)
            .set(TransactionDraft {
                name: EVENT_REGISTER.to_string(),
                origin: self.base_uuid,
                main_transaction: true,
                ..Default::default()
            })
            .await
            .expect("register main");

        let message = EventMessage {
            name: EVENT_REGISTER.to_string(),
            data: Some(json!({
                "name": self.name,
                "eventsCast": self.events_cast,
                "eventsSubscribe": self.events_subscribe,
            })),
            metadata: RedisMetadata {
                origin: self.base_uuid,
                transaction_id: Some(register_main.transaction_id),
                main_transaction: Some(true),
                ..Default::default()
            },
        };
        self.client
            .publish(
                &dispatcher_channel(""),
                &serde_json::to_value(&message).expect("encode register"),
            )
            .await
            .expect("publish register");

        let approval = self
            .await_approvement(register_main.transaction_id)
            .await
            .expect("approvement never arrived");
        let provided: Uuid = approval
            .data
            .as_ref()
            .and_then(|d| d["uuid"].as_str())
            .and_then(|s| s.parse().ok())
            .expect("approvement uuid");
        self.provided_uuid = Some(provided);

        // Acknowledge the approval and drop the pending register main,
        // then start listening on the private channel.
        self.store()
            .set(TransactionDraft {
                name: EVENT_APPROVEMENT.to_string(),
                origin: provided,
                related_transaction: approval.metadata.transaction_id,
                resolved: true,
                ..Default::default()
            })
            .await
            .expect("approvement ack");
        self.store_for(&self.base_uuid)
            .delete(&register_main.transaction_id)
            .await
            .expect("register cleanup");
        self.client
            .subscribe(&incomer_channel("", &provided))
            .await
            .expect("subscribe private channel");
        provided
    }

    async fn await_approvement(&self, register_id: Uuid) -> Option<EventMessage> {
        let mut inbox = self.inbox.lock().await;
        for _ in 0..50 {
            let raw = tokio::time::timeout(Duration::from_millis(100), inbox.recv())
                .await
                .ok()??;
            let Ok(message) = serde_json::from_str::<EventMessage>(&raw.payload) else {
                continue;
            };
            if message.name == EVENT_APPROVEMENT
                && message.metadata.related_transaction == Some(register_id)
            {
                return Some(message);
            }
        }
        None
    }

    /// Log a main transaction and publish the event on the private
    /// channel, as the client library does.
    pub async fn publish(&self, event: &str, data: Value) -> Uuid {
        let provided = self.provided().expect("not registered");
        let main = self
            .store()
            .set(TransactionDraft {
                name: event.to_string(),
                data: Some(data.clone()),
                origin: provided,
                incomer_name: Some(self.name.clone()),
                main_transaction: true,
                ..Default::default()
            })
            .await
            .expect("main transaction");

        let message = EventMessage {
            name: event.to_string(),
            data: Some(data),
            metadata: RedisMetadata {
                origin: provided,
                incomer_name: Some(self.name.clone()),
                transaction_id: Some(main.transaction_id),
                main_transaction: Some(true),
                ..Default::default()
            },
        };
        self.client
            .publish(
                &incomer_channel("", &provided),
                &serde_json::to_value(&message).expect("encode event"),
            )
            .await
            .expect("publish event");
        main.transaction_id
    }

    /// Process everything delivered so far: answer pings and acknowledge
    /// business events with resolved transactions. Returns the business
    /// events received.
    pub async fn drain(&self) -> Vec<EventMessage> {
        let provided = self.provided().expect("not registered");
        let mut received = Vec::new();
        let mut inbox = self.inbox.lock().await;
        while let Ok(Some(raw)) =
            tokio::time::timeout(Duration::from_millis(50), inbox.recv()).await
        {
            let Ok(message) = serde_json::from_str::<EventMessage>(&raw.payload) else {
                continue;
            };
            if message.metadata.origin == provided || message.metadata.origin == self.base_uuid {
                continue; // own publish echoed back
            }
            match message.name.as_str() {
                EVENT_REGISTER | EVENT_APPROVEMENT | EVENT_OK => continue,
                EVENT_PING => {
                    self.store()
                        .set(TransactionDraft {
                            name: EVENT_PING.to_string(),
                            origin: provided,
                            related_transaction: message.metadata.transaction_id,
                            resolved: true,
                            ..Default::default()
                        })
                        .await
                        .expect("ping ack");
                }
                _ => {
                    self.store()
                        .set(TransactionDraft {
                            name: message.name.clone(),
                            origin: provided,
                            related_transaction: message.metadata.transaction_id,
                            event_transaction_id: message.metadata.event_transaction_id,
                            resolved: true,
                            ..Default::default()
                        })
                        .await
                        .expect("event ack");
                    received.push(message);
                }
            }
        }
        received
    }
}
