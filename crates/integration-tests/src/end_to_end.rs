//! End-to-end dispatcher scenarios.
//!
//! Each test stands up a real dispatcher on a shared in-memory broker,
//! registers simulated incomers through the actual protocol, and drives
//! the periodic passes by hand against a manual clock.
