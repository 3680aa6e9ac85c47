//! Resource generation module.
//!
//! Pure functions compiling a RedisReplication or RedisSentinel into the
//! objects the operator owns. No I/O happens here.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | Stable pod identity and per-replica storage |
//! | Headless Service | Per-pod DNS (publishNotReadyAddresses) |
//! | Client Service | Client access endpoint |
//! | Additional Service | User-configurable exposure |
//! | PodDisruptionBudget | Keep the sentinel quorum during disruptions |

pub mod common;
pub mod env;
pub mod pdb;
pub mod replication;
pub mod sentinel;
pub mod services;
pub mod statefulset;
pub mod volumes;

pub use common::{owner_reference, workload_labels};
pub use replication::compile_replication;
pub use sentinel::compile_sentinel;
