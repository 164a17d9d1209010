//! # Shared Bus
//!
//! Broker ports and adapters for the fleetbus dispatcher.
//!
//! The dispatcher talks to its substrate through two narrow ports:
//!
//! - [`ChannelBus`]: named-channel publish/subscribe with one merged
//!   inbound stream per client.
//! - [`KeyValue`]: whole-JSON-object get/set/delete by key.
//!
//! Two adapters implement both:
//!
//! - [`MemoryBroker`]: an in-process substrate for tests and single-node
//!   runs. Clients created from one broker see each other exactly as
//!   distinct Redis connections would.
//! - [`RedisBroker`]: the production substrate over the `redis` crate.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod error;
pub mod memory;
pub mod ports;
pub mod redis_broker;

// Re-export main types
pub use error::BusError;
pub use memory::{MemoryBroker, MemoryClient};
pub use ports::{ChannelBus, ChannelMessage, KeyValue};
pub use redis_broker::RedisBroker;

/// Events buffered per in-memory channel before slow subscribers lag.
pub const MEMORY_CHANNEL_CAPACITY: usize = 1024;
