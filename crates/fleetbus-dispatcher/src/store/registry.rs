//! Persistent directory of approved incomers.

use std::sync::Arc;

use serde_json::{Map, Value};
use shared_bus::KeyValue;
use shared_types::{Clock, Incomer};
use uuid::Uuid;

use crate::errors::DispatchError;

/// The incomer registry: the full set of approved incomers under one key.
///
/// The stored value is a JSON map `providedUUID -> Incomer`. Iteration
/// order follows the map's key order; selection logic that picks "the
/// first" survivor inherits it, and callers must not rely on which
/// replica that is.
#[derive(Clone)]
pub struct IncomerRegistry {
    kv: Arc<dyn KeyValue>,
    clock: Arc<dyn Clock>,
    key: String,
}

impl IncomerRegistry {
    /// Bind the registry to its key.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValue>, clock: Arc<dyn Clock>, key: String) -> Self {
        Self { kv, clock, key }
    }

    /// All registered incomers, in registry iteration order.
    pub async fn get_incomers(&self) -> Result<Vec<Incomer>, DispatchError> {
        let map = self.read().await?;
        let mut incomers = Vec::with_capacity(map.len());
        for value in map.into_iter().map(|(_, v)| v) {
            incomers.push(serde_json::from_value(value)?);
        }
        Ok(incomers)
    }

    /// One incomer by `providedUUID`.
    pub async fn get_incomer(&self, provided_uuid: &Uuid) -> Result<Option<Incomer>, DispatchError> {
        let map = self.read().await?;
        match map.get(&provided_uuid.to_string()) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Insert a new incomer, allocating its `providedUUID`.
    pub async fn set_incomer(&self, mut record: Incomer) -> Result<Uuid, DispatchError> {
        let provided_uuid = Uuid::new_v4();
        record.provided_uuid = provided_uuid;
        let mut map = self.read().await?;
        map.insert(provided_uuid.to_string(), serde_json::to_value(&record)?);
        self.write(map).await?;
        Ok(provided_uuid)
    }

    /// Replace an incomer record in place.
    pub async fn update_incomer(&self, record: &Incomer) -> Result<(), DispatchError> {
        let mut map = self.read().await?;
        map.insert(
            record.provided_uuid.to_string(),
            serde_json::to_value(record)?,
        );
        self.write(map).await
    }

    /// Stamp an incomer's `lastActivity` with the current time.
    pub async fn update_incomer_state(&self, provided_uuid: &Uuid) -> Result<(), DispatchError> {
        let Some(mut record) = self.get_incomer(provided_uuid).await? else {
            return Ok(());
        };
        record.last_activity = self.clock.now_ms();
        self.update_incomer(&record).await
    }

    /// Remove an incomer; removes the key once the directory is empty.
    pub async fn delete_incomer(&self, provided_uuid: &Uuid) -> Result<(), DispatchError> {
        let mut map = self.read().await?;
        if map.remove(&provided_uuid.to_string()).is_none() {
            return Ok(());
        }
        if map.is_empty() {
            self.kv.delete(&self.key).await?;
            return Ok(());
        }
        self.write(map).await
    }

    async fn read(&self) -> Result<Map<String, Value>, DispatchError> {
        match self.kv.get(&self.key).await? {
            Some(Value::Object(map)) => Ok(map),
            Some(other) => Ok(serde_json::from_value(other)?),
            None => Ok(Map::new()),
        }
    }

    async fn write(&self, map: Map<String, Value>) -> Result<(), DispatchError> {
        self.kv.set(&self.key, &Value::Object(map)).await?;
        Ok(())
    }
}
