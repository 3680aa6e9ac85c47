//! Types for classified Redis replica state.

use std::str::FromStr;

use thiserror::Error;

/// Errors that can occur when parsing replica state.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to compile regex: {0}")]
    RegexCompilation(String),
    #[error("Unknown role: {0}")]
    UnknownRole(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Operational role of a Redis process, as reported by its own status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RedisRole {
    Master,
    Replica,
    Sentinel,
    /// The process could not be reached or reported something else.
    #[default]
    Unknown,
}

impl FromStr for RedisRole {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "master" => Ok(RedisRole::Master),
            "slave" | "replica" => Ok(RedisRole::Replica),
            "sentinel" => Ok(RedisRole::Sentinel),
            other => Err(ParseError::UnknownRole(other.to_string())),
        }
    }
}

impl std::fmt::Display for RedisRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedisRole::Master => write!(f, "master"),
            RedisRole::Replica => write!(f, "slave"),
            RedisRole::Sentinel => write!(f, "sentinel"),
            RedisRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of probing one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaStatus {
    pub role: RedisRole,
    /// Attached replicas; only meaningful for masters.
    pub connected_slaves: u32,
}

impl ReplicaStatus {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn master(connected_slaves: u32) -> Self {
        Self {
            role: RedisRole::Master,
            connected_slaves,
        }
    }

    pub fn replica() -> Self {
        Self {
            role: RedisRole::Replica,
            connected_slaves: 0,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == RedisRole::Master
    }
}
