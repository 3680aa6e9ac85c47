//! Custom Resource Definitions (CRDs) for redis-sentinel-operator.
//!
//! - `RedisReplication`: replicated Redis set with per-replica storage
//! - `RedisSentinel`: Sentinel processes monitoring a `RedisReplication`

mod common;
mod redis_replication;
mod redis_sentinel;

pub use common::*;
pub use redis_replication::*;
pub use redis_sentinel::*;
