//! # Dispatcher Configuration
//!
//! All cadences are milliseconds. Defaults match the protocol contract:
//! an incomer is pinged well inside the idle threshold, and the idle
//! threshold is what both eviction and relay takeover key off.

use std::collections::HashMap;
use std::sync::Arc;

use shared_types::EventMessage;
use uuid::Uuid;

use crate::errors::DispatchError;

/// Per-event payload validator.
pub type ValidatorFn = Arc<dyn Fn(&EventMessage) -> Result<(), DispatchError> + Send + Sync>;

/// Event validation wiring.
///
/// `events_validation_fn` maps each business event name to its validator;
/// an event with no entry is unknown and rejected. `validation_cb_fn`,
/// when set, takes over validation for everything except `register` and
/// `ping`.
#[derive(Clone, Default)]
pub struct EventsValidation {
    /// Validators by event name.
    pub events_validation_fn: HashMap<String, ValidatorFn>,

    /// Custom delegate replacing per-event validators.
    pub validation_cb_fn: Option<ValidatorFn>,
}

impl EventsValidation {
    /// Register a validator for `name`.
    pub fn insert(&mut self, name: impl Into<String>, validator: ValidatorFn) {
        self.events_validation_fn.insert(name.into(), validator);
    }

    /// Register `name` with a validator that accepts any payload.
    pub fn insert_permissive(&mut self, name: impl Into<String>) {
        self.insert(name, Arc::new(|_| Ok(())));
    }
}

impl std::fmt::Debug for EventsValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventsValidation")
            .field(
                "events_validation_fn",
                &self.events_validation_fn.keys().collect::<Vec<_>>(),
            )
            .field("validation_cb_fn", &self.validation_cb_fn.is_some())
            .finish()
    }
}

/// Dispatcher runtime options.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Environment scoping for every key and channel. May be empty.
    pub prefix: String,

    /// Ping cadence.
    pub ping_interval_ms: u64,

    /// Eviction-scan cadence.
    pub check_last_activity_interval_ms: u64,

    /// Reconciliation cadence.
    pub check_transaction_interval_ms: u64,

    /// Activity threshold past which an incomer is considered dead.
    pub idle_time_ms: u64,

    /// `baseUUID` this dispatcher process registers for itself.
    pub incomer_uuid: Uuid,

    /// Group key for leader election among dispatcher replicas.
    pub instance_name: String,

    /// Lower bound of the election jitter.
    pub min_timeout_ms: u64,

    /// Upper bound of the election jitter.
    pub max_timeout_ms: u64,

    /// Event validation wiring.
    pub events_validation: EventsValidation,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            ping_interval_ms: 300_000,
            check_last_activity_interval_ms: 120_000,
            check_transaction_interval_ms: 180_000,
            idle_time_ms: 600_000,
            incomer_uuid: Uuid::new_v4(),
            instance_name: "dispatcher".to_string(),
            min_timeout_ms: 0,
            max_timeout_ms: 60_000,
            events_validation: EventsValidation::default(),
        }
    }
}

impl DispatcherConfig {
    /// The configured prefix as stored in record fields: `None` when empty.
    #[must_use]
    pub fn prefix_field(&self) -> Option<String> {
        if self.prefix.is_empty() {
            None
        } else {
            Some(self.prefix.clone())
        }
    }
}
