// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for the convergence engine and master resolution.
//!
//! These tests drive the real reconciliation building blocks against an
//! in-memory object store and a table-driven replica prober, so they run
//! WITHOUT a Kubernetes cluster or Redis.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_failover_rolls_sentinel_workload
//! ```
//!
//! ## Test Categories
//!
//! - **Converge tests**: create/update/recreate decisions, drift detection
//!   and volume capacity coordination
//! - **Topology tests**: replica probing, master selection and its effect
//!   on the sentinel workload

#[path = "../common/mod.rs"]
#[allow(dead_code)]
mod common;
mod mock_store;

use common::fixtures;

mod converge_tests;
mod topology_tests;
