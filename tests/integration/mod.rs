//! Integration test suite for conductor.
//!
//! These tests run whole systems (transport, coordinator, workers and
//! gateway as separate actors) and observe them only through the gateway.
//!
//! # Test Categories
//!
//! - `end_to_end`: Requests through decomposition to aggregated results
//! - `failures`: Failure propagation, policies and timeouts
//! - `concurrency`: Many trees and many workers at once

mod fixtures;

mod concurrency;
mod end_to_end;
mod failures;
