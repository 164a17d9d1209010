//! # Fleetbus Dispatcher
//!
//! The singleton coordinator of a fleet of service instances ("incomers")
//! exchanging named business events over a broker.
//!
//! ## Responsibilities
//!
//! - **Registration**: approve incomers, allocate their wire identity and
//!   private channel.
//! - **Fan-out**: deliver each published event to every subscriber,
//!   deduplicating same-named replicas unless the subscription asks for
//!   horizontal scale.
//! - **Liveness**: ping every incomer, evict the silent ones, re-home
//!   their in-flight work to same-named peers.
//! - **Reconciliation**: sweep resolved transaction pairs, redistribute
//!   parked backups, keep both sides of the delivery log converging.
//! - **Relay**: stand by behind an active dispatcher and take over its
//!   role when it disappears, without losing transactions.
//!
//! ## Architecture
//!
//! ```text
//! incomer ──publish──▶ {prefix}{uuid} channel ─┐
//!                                              ▼
//!                                        ┌────────────┐
//!   {prefix}dispatcher channel ────────▶ │ Dispatcher │──fan-out──▶ subscriber channels
//!   (register / OK announcements)        └────────────┘
//!                                              │
//!                         transaction stores / incomer registry (broker keys)
//! ```
//!
//! The dispatcher owns no durable state of its own: the incomer registry
//! and every transaction store live under broker keys, so a standby can
//! take relay from whatever the failed active left behind.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod errors;
pub mod service;
pub mod store;

// Re-export main types
pub use config::{DispatcherConfig, EventsValidation, ValidatorFn};
pub use errors::DispatchError;
pub use service::Dispatcher;
pub use store::{keys, IncomerRegistry, TransactionStore};
