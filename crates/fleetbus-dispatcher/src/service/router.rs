//! # Event Router
//!
//! Entry point for every message the dispatcher receives. Messages are
//! validated, then routed by `(channel, name)`: the dispatcher channel
//! only accepts `register`; incomer channels carry business events that
//! fan out to subscribers.

use serde_json::Value;
use shared_bus::ChannelMessage;
use shared_types::{
    incomer_channel, is_reserved_event, EventMessage, Incomer, RedisMetadata, Transaction,
    TransactionDraft, EVENT_OK, EVENT_PING, EVENT_REGISTER,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::DispatcherInner;
use crate::errors::DispatchError;

impl DispatcherInner {
    /// Handle one message from the merged inbound stream.
    pub(crate) async fn handle_channel_message(
        &self,
        message: &ChannelMessage,
    ) -> Result<(), DispatchError> {
        let event: EventMessage =
            serde_json::from_str(&message.payload).map_err(|err| {
                DispatchError::MalformedMessage {
                    channel: message.channel.clone(),
                    reason: err.to_string(),
                }
            })?;

        // Election announcements are the one thing a standby reacts to.
        if event.name == EVENT_OK {
            if event.metadata.origin != self.private_uuid {
                debug!(origin = %event.metadata.origin, "foreign dispatcher announcement");
                self.foreign_ok.notify_waiters();
            }
            return Ok(());
        }

        if !self.is_active() {
            return Ok(());
        }
        if event.metadata.origin == self.private_uuid {
            return Ok(());
        }

        self.validate_event(&event, &message.channel)?;

        if message.channel == self.dispatcher_channel_name {
            if event.name == EVENT_REGISTER {
                return self.handle_registration(&event).await;
            }
            debug!(
                name = %event.name,
                "non-registration event on the dispatcher channel ignored"
            );
            return Ok(());
        }

        self.fan_out(&event).await
    }

    /// Validate the event body.
    ///
    /// The metadata block itself was already enforced structurally during
    /// deserialization. A configured custom delegate takes over for every
    /// event except `register` and `ping`; otherwise reserved events pass
    /// and business events need a registered validator.
    fn validate_event(&self, event: &EventMessage, channel: &str) -> Result<(), DispatchError> {
        if let Some(delegate) = &self.config.events_validation.validation_cb_fn {
            if event.name != EVENT_REGISTER && event.name != EVENT_PING {
                return delegate(event);
            }
        }

        if is_reserved_event(&event.name) {
            return Ok(());
        }

        match self
            .config
            .events_validation
            .events_validation_fn
            .get(&event.name)
        {
            Some(validator) => validator(event).map_err(|err| match err {
                DispatchError::MalformedMessage { .. } => err,
                other => DispatchError::MalformedMessage {
                    channel: channel.to_string(),
                    reason: other.to_string(),
                },
            }),
            None => Err(DispatchError::UnknownEvent {
                name: event.name.clone(),
            }),
        }
    }

    /// Fan an incomer's event out to its subscribers.
    pub(crate) async fn fan_out(&self, event: &EventMessage) -> Result<(), DispatchError> {
        let origin = event.metadata.origin;
        let main_id =
            event
                .metadata
                .transaction_id
                .ok_or_else(|| DispatchError::MalformedMessage {
                    channel: incomer_channel(&self.config.prefix, &origin),
                    reason: "missing transactionId".to_string(),
                })?;

        let sender_store = self.incomer_store(&origin);
        let mut main = sender_store.get(&main_id).await?.ok_or(
            DispatchError::MissingRelatedTransaction {
                transaction_id: main_id,
            },
        )?;

        let incomers = self.registry.get_incomers().await?;
        let targets = filter_targets(&incomers, &event.name);

        if targets.is_empty() {
            if event.name == EVENT_PING {
                warn!(origin = %origin, "ping with no subscribers dropped");
                return Ok(());
            }
            debug!(
                name = %event.name,
                origin = %origin,
                "no subscriber, parking backup dispatcher transaction"
            );
            self.backup_dispatcher_store
                .set(TransactionDraft {
                    name: event.name.clone(),
                    data: event.data.clone(),
                    origin,
                    to: None,
                    incomer_name: event.metadata.incomer_name.clone(),
                    prefix: self.config.prefix_field(),
                    event_transaction_id: Some(main_id),
                    main_transaction: false,
                    related_transaction: Some(main_id),
                    resolved: false,
                    ..Default::default()
                })
                .await?;
            main.published = true;
            sender_store.update(&main_id, main).await?;
            return Ok(());
        }

        let iteration = event.metadata.iteration.unwrap_or(0);
        for target in &targets {
            self.republish_child(
                &event.name,
                event.data.clone(),
                Some(main_id),
                Some(main_id),
                target,
                iteration,
            )
            .await?;
        }

        self.registry.update_incomer_state(&origin).await?;
        main.published = true;
        sender_store.update(&main_id, main).await?;
        Ok(())
    }

    /// Write a dispatcher-side child transaction for `target` and publish
    /// the event on its private channel.
    ///
    /// Shared by fan-out, eviction re-homing and backup redistribution.
    pub(crate) async fn republish_child(
        &self,
        name: &str,
        data: Option<Value>,
        related_transaction: Option<Uuid>,
        event_transaction_id: Option<Uuid>,
        target: &Incomer,
        iteration: u32,
    ) -> Result<Transaction, DispatchError> {
        let channel = incomer_channel(&self.config.prefix, &target.provided_uuid);
        self.ensure_subscribed(&channel).await?;

        let child = self
            .dispatcher_store
            .set(TransactionDraft {
                name: name.to_string(),
                data: data.clone(),
                origin: self.private_uuid,
                to: Some(target.provided_uuid),
                incomer_name: Some(target.name.clone()),
                prefix: self.config.prefix_field(),
                event_transaction_id,
                main_transaction: false,
                related_transaction,
                resolved: false,
                iteration,
            })
            .await?;

        let outgoing = EventMessage {
            name: name.to_string(),
            data,
            metadata: RedisMetadata {
                origin: self.private_uuid,
                to: Some(target.provided_uuid),
                incomer_name: Some(target.name.clone()),
                prefix: self.config.prefix_field(),
                transaction_id: Some(child.transaction_id),
                event_transaction_id,
                main_transaction: Some(false),
                related_transaction,
                resolved: Some(false),
                iteration: Some(iteration),
            },
        };
        self.bus
            .publish(&channel, &serde_json::to_value(&outgoing)?)
            .await?;
        Ok(child)
    }
}

/// Subscription filtering with horizontal-scale deduplication.
///
/// Candidates are grouped by service name. A candidate subscribing with
/// `horizontal_scale = true` is always kept; of the candidates
/// subscribing with `horizontal_scale = false`, only the first per group
/// survives.
pub(crate) fn filter_targets(incomers: &[Incomer], event: &str) -> Vec<Incomer> {
    let mut single_per_group: Vec<&str> = Vec::new();
    let mut targets = Vec::new();
    for incomer in incomers {
        let Some(subscription) = incomer.subscription(event) else {
            continue;
        };
        if subscription.horizontal_scale {
            targets.push(incomer.clone());
        } else if !single_per_group.contains(&incomer.name.as_str()) {
            single_per_group.push(incomer.name.as_str());
            targets.push(incomer.clone());
        }
    }
    targets
}
