//! Parsing of Redis `INFO` text output.
//!
//! `INFO` replies are CRLF-delimited `key:value` lines, with optional
//! section headers starting with `#`.

use std::collections::HashMap;

use regex::Regex;

use super::types::{ParseError, RedisRole, ReplicaStatus};

/// Parse key-value pairs from INFO command output.
///
/// # Example
/// ```
/// use redis_sentinel_operator::client::parsing::parse_info_output;
///
/// let info = "# Replication\r\nrole:master\r\nconnected_slaves:2\r\n";
/// let parsed = parse_info_output(info).unwrap();
/// assert_eq!(parsed.get("role"), Some(&"master".to_string()));
/// ```
pub fn parse_info_output(info: &str) -> Result<HashMap<String, String>, ParseError> {
    let kv_regex =
        Regex::new(r"^([\w-]+):(.*)$").map_err(|e| ParseError::RegexCompilation(e.to_string()))?;

    let mut result = HashMap::new();

    for line in info.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(caps) = kv_regex.captures(line)
            && let (Some(key), Some(value)) = (caps.get(1), caps.get(2))
        {
            result.insert(key.as_str().to_string(), value.as_str().to_string());
        }
    }

    Ok(result)
}

/// Replication state from `INFO replication`.
///
/// Only `role` and `connected_slaves` drive master selection; the link
/// status and offset are logged with each probe.
#[derive(Debug, Clone, Default)]
pub struct ReplicationInfo {
    pub role: RedisRole,
    pub connected_slaves: u32,
    /// Master link status of a replica ("up" or "down").
    pub master_link_status: Option<String>,
    pub master_repl_offset: Option<i64>,
}

impl ReplicationInfo {
    pub fn parse(info: &str) -> Result<Self, ParseError> {
        let parsed = parse_info_output(info)?;

        let role = parsed
            .get("role")
            .ok_or_else(|| ParseError::MissingField("role".to_string()))?
            .parse()
            .unwrap_or(RedisRole::Unknown);

        Ok(ReplicationInfo {
            role,
            connected_slaves: parsed
                .get("connected_slaves")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            master_link_status: parsed.get("master_link_status").cloned(),
            master_repl_offset: parsed
                .get("master_repl_offset")
                .and_then(|v| v.trim().parse().ok()),
        })
    }

    pub fn status(&self) -> ReplicaStatus {
        match self.role {
            RedisRole::Master => ReplicaStatus::master(self.connected_slaves),
            role => ReplicaStatus {
                role,
                connected_slaves: 0,
            },
        }
    }
}
