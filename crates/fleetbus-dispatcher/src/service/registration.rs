//! # Registration Handler
//!
//! `register` messages arrive on the dispatcher channel from instances
//! that are not approved yet, so their `origin` is still a `baseUUID`.
//! Approval allocates the `providedUUID`, installs the private channel
//! and answers with `approvement` on the dispatcher channel.

use serde_json::json;
use shared_types::{
    incomer_channel, EventMessage, Incomer, RedisMetadata, RegistrationData, TransactionDraft,
    EVENT_APPROVEMENT,
};
use tracing::info;
use uuid::Uuid;

use super::DispatcherInner;
use crate::errors::DispatchError;

impl DispatcherInner {
    pub(crate) async fn handle_registration(
        &self,
        event: &EventMessage,
    ) -> Result<(), DispatchError> {
        let origin = event.metadata.origin;
        let transaction_id =
            event
                .metadata
                .transaction_id
                .ok_or_else(|| DispatchError::MalformedMessage {
                    channel: self.dispatcher_channel_name.clone(),
                    reason: "register without transactionId".to_string(),
                })?;
        let registration: RegistrationData = serde_json::from_value(
            event
                .data
                .clone()
                .ok_or_else(|| DispatchError::MalformedMessage {
                    channel: self.dispatcher_channel_name.clone(),
                    reason: "register without data".to_string(),
                })?,
        )?;

        // The sender must have logged its own side first.
        let sender_store = self.incomer_store(&origin);
        if sender_store.get(&transaction_id).await?.is_none() {
            return Err(DispatchError::MissingRelatedTransaction { transaction_id });
        }

        // Record the approval before the duplicate check so a rejection
        // can delete the transaction that would have approved it.
        let mut approval = self
            .dispatcher_store
            .set(TransactionDraft {
                name: EVENT_APPROVEMENT.to_string(),
                origin: self.private_uuid,
                to: None,
                incomer_name: Some(registration.name.clone()),
                prefix: self.config.prefix_field(),
                event_transaction_id: Some(transaction_id),
                main_transaction: false,
                related_transaction: Some(transaction_id),
                resolved: false,
                ..Default::default()
            })
            .await?;

        let incomers = self.registry.get_incomers().await?;
        if incomers.iter().any(|i| i.base_uuid == origin) {
            self.dispatcher_store
                .delete(&approval.transaction_id)
                .await?;
            return Err(DispatchError::DuplicateRegistration { base_uuid: origin });
        }

        let now = self.clock.now_ms();
        let record = Incomer {
            provided_uuid: Uuid::nil(),
            base_uuid: origin,
            name: registration.name.clone(),
            events_cast: registration.events_cast,
            events_subscribe: registration.events_subscribe,
            prefix: registration
                .prefix
                .unwrap_or_else(|| self.config.prefix.clone()),
            alive_since: now,
            last_activity: now,
            is_dispatcher_active_instance: origin == self.config.incomer_uuid,
        };
        let provided_uuid = self.registry.set_incomer(record).await?;

        let channel = incomer_channel(&self.config.prefix, &provided_uuid);
        self.ensure_subscribed(&channel).await?;

        // The approval targets the new identity from here on, so pair
        // resolution can find its recipient in the registry.
        approval.to = Some(provided_uuid);
        approval.data = Some(json!({ "uuid": provided_uuid }));
        self.dispatcher_store
            .update(&approval.transaction_id, approval.clone())
            .await?;

        let answer = EventMessage {
            name: EVENT_APPROVEMENT.to_string(),
            data: Some(json!({ "uuid": provided_uuid })),
            metadata: RedisMetadata {
                origin: self.private_uuid,
                to: Some(origin),
                incomer_name: Some(registration.name.clone()),
                prefix: self.config.prefix_field(),
                transaction_id: Some(approval.transaction_id),
                related_transaction: Some(transaction_id),
                resolved: Some(false),
                ..Default::default()
            },
        };
        self.bus
            .publish(
                &self.dispatcher_channel_name,
                &serde_json::to_value(&answer)?,
            )
            .await?;

        info!(
            provided = %provided_uuid,
            base = %origin,
            name = %registration.name,
            "incomer approved"
        );
        Ok(())
    }
}
