//! Redis client module for replica introspection.
//!
//! Thin wrapper around the `fred` Redis client used to ask a single replica
//! for its replication role.
//!
//! ## Architecture
//!
//! - `redis_client`: single-node connection with optional TLS
//! - `parsing`: `INFO` output parsing
//! - `types`: role classification
//!
//! ## Example
//!
//! ```rust,ignore
//! use redis_sentinel_operator::client::RedisClient;
//!
//! let client = RedisClient::connect_single("10.0.0.5", 6379, None, None, timeout).await?;
//! let info = client.info_replication().await;
//! client.close().await;
//! ```

pub mod parsing;
pub mod redis_client;
pub mod types;

pub use parsing::ReplicationInfo;
pub use redis_client::{RedisClient, RedisError, TlsCertData};
pub use types::{RedisRole, ReplicaStatus};
