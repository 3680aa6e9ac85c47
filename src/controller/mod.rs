//! Controller module for redis-sentinel-operator.
//!
//! The reconcile engine is split bottom-up:
//! - `store`: typed access to cluster objects (StatefulSets, claims, pods, secrets)
//! - `patch`: patch planning between desired and observed objects
//! - `capacity`: in-place growth of volume claims
//! - `converger`: one convergence pass over a StatefulSet
//! - `topology`: replica probing and master resolution
//!
//! Two controllers drive it:
//! - RedisReplication controller (`replication_reconciler`)
//! - RedisSentinel controller (`sentinel_reconciler`)

// Shared modules
pub mod common;
pub mod context;
pub mod error;

// Reconcile engine
pub mod capacity;
pub mod converger;
pub mod patch;
pub mod store;
pub mod topology;

// Controllers
pub mod replication_reconciler;
pub mod sentinel_reconciler;
