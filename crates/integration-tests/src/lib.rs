//! # Integration Tests Crate
//!
//! End-to-end scenarios that drive a real [`fleetbus_dispatcher::Dispatcher`]
//! over a shared in-memory broker, with simulated incomers playing the
//! client side of the protocol.
//!
//! ## Structure
//!
//! ```text
//! integration-tests/
//! └── src/
//!     ├── lib.rs        # This file
//!     ├── harness.rs    # Simulated incomers + store observer
//!     └── end_to_end.rs # The end-to-end scenarios
//! ```
//!
//! ## Scenario coverage
//!
//! 1. Single publish, single subscriber, full pair sweep.
//! 2. Publish with no subscriber, late subscriber redistribution.
//! 3. Eviction migrates an unresolved main to a same-named sibling.
//! 4. Dispatcher failover via relay takeover.
//! 5. Horizontal-scale fan-out filtering.
//! 6. Duplicate registration rejection.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod end_to_end;
pub mod harness;
