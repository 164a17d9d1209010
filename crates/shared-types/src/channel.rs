//! Channel naming.
//!
//! Two channel families exist on the broker: the shared dispatcher channel
//! (registration and leader-election announcements) and one private channel
//! per approved incomer. The environment `prefix` scopes both.

use uuid::Uuid;

/// Name of the shared dispatcher channel for the given prefix.
#[must_use]
pub fn dispatcher_channel(prefix: &str) -> String {
    format!("{prefix}dispatcher")
}

/// Name of an incomer's private channel.
#[must_use]
pub fn incomer_channel(prefix: &str, provided_uuid: &Uuid) -> String {
    format!("{prefix}{provided_uuid}")
}
