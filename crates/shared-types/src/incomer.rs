//! # Incomer Records
//!
//! Directory entries for approved incomers, persisted in the incomer
//! registry under a single key.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One subscription of an incomer.
///
/// `horizontal_scale` controls fan-out when several incomers share a
/// service name: `true` delivers to every replica, `false` to exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Subscribed event name.
    pub name: String,

    /// Deliver to all same-named replicas, not just one.
    #[serde(default)]
    pub horizontal_scale: bool,
}

impl Subscription {
    /// Single-replica subscription to `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            horizontal_scale: false,
        }
    }

    /// All-replica subscription to `name`.
    #[must_use]
    pub fn horizontal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            horizontal_scale: true,
        }
    }
}

/// A registered incomer.
///
/// `provided_uuid` is allocated by the dispatcher at approval and is the
/// identity used on the wire from then on; `base_uuid` is the instance's
/// self-identifier and stays unique across the registry (re-registering
/// with a known `base_uuid` is rejected).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incomer {
    /// Dispatcher-assigned wire identity.
    #[serde(rename = "providedUUID")]
    pub provided_uuid: Uuid,

    /// Instance-provided identity of the process itself.
    #[serde(rename = "baseUUID")]
    pub base_uuid: Uuid,

    /// Capability/service name. Several incomers may share one name
    /// (horizontal scale).
    pub name: String,

    /// Event names this incomer may publish.
    #[serde(default)]
    pub events_cast: Vec<String>,

    /// Subscriptions this incomer receives.
    #[serde(default)]
    pub events_subscribe: Vec<Subscription>,

    /// Environment scoping prefix (may be empty).
    #[serde(default)]
    pub prefix: String,

    /// Registration time in milliseconds.
    pub alive_since: u64,

    /// Last observed activity in milliseconds.
    pub last_activity: u64,

    /// True iff this process currently plays the active dispatcher role.
    #[serde(default)]
    pub is_dispatcher_active_instance: bool,
}

impl Incomer {
    /// True if this incomer may publish `event`.
    #[must_use]
    pub fn casts(&self, event: &str) -> bool {
        self.events_cast.iter().any(|e| e == event)
    }

    /// The subscription entry for `event`, if any.
    #[must_use]
    pub fn subscription(&self, event: &str) -> Option<&Subscription> {
        self.events_subscribe.iter().find(|s| s.name == event)
    }

    /// True once `last_activity` has fallen more than `idle_time` behind.
    #[must_use]
    pub fn is_idle(&self, now_ms: u64, idle_time_ms: u64) -> bool {
        self.last_activity.saturating_add(idle_time_ms) < now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Incomer {
        Incomer {
            provided_uuid: Uuid::new_v4(),
            base_uuid: Uuid::new_v4(),
            name: "foo".into(),
            events_cast: vec!["accountingFolder".into()],
            events_subscribe: vec![Subscription::new("connector")],
            prefix: String::new(),
            alive_since: 1_000,
            last_activity: 1_000,
            is_dispatcher_active_instance: false,
        }
    }

    #[test]
    fn test_uuid_field_names() {
        let incomer = sample();
        let value = serde_json::to_value(&incomer).unwrap();
        assert!(value.get("providedUUID").is_some());
        assert!(value.get("baseUUID").is_some());
        assert_eq!(value["lastActivity"], json!(1_000));
    }

    #[test]
    fn test_casts_and_subscription() {
        let incomer = sample();
        assert!(incomer.casts("accountingFolder"));
        assert!(!incomer.casts("connector"));
        assert!(incomer.subscription("connector").is_some());
        assert!(incomer.subscription("accountingFolder").is_none());
    }

    #[test]
    fn test_is_idle_threshold() {
        let incomer = sample();
        assert!(!incomer.is_idle(1_500, 600));
        // lastActivity + idleTime == now is still fresh
        assert!(!incomer.is_idle(1_600, 600));
        assert!(incomer.is_idle(1_601, 600));
    }

    #[test]
    fn test_horizontal_scale_default_is_false() {
        let sub: Subscription = serde_json::from_value(json!({"name": "e"})).unwrap();
        assert!(!sub.horizontal_scale);
        let sub: Subscription =
            serde_json::from_value(json!({"name": "e", "horizontalScale": true})).unwrap();
        assert!(sub.horizontal_scale);
    }
}
