//! Lock record stored next to the shared store
//!
//! The lock object is a small JSON document naming the holder. Any process
//! may delete a lock whose timestamp is older than the stale threshold.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Age after which a lock is presumed abandoned
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(300);

/// Holder of the shared store lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLock {
    #[serde(rename = "hostname")]
    pub holder_host: String,
    #[serde(rename = "pid")]
    pub holder_pid: u32,
    #[serde(rename = "timestamp", deserialize_with = "lenient_timestamp")]
    pub acquired_at: DateTime<Utc>,
}

impl RemoteLock {
    /// Lock record for this process, stamped now
    pub fn for_current_process() -> Self {
        Self {
            holder_host: hostname(),
            holder_pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("Failed to parse lock object")
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize lock object")
    }

    /// Time since the lock was taken; zero for timestamps in the future
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > threshold
    }

    /// Whether this record names the running process
    pub fn is_current_process(&self) -> bool {
        self.holder_pid == std::process::id() && self.holder_host == hostname()
    }
}

/// Host name of this machine, or "unknown"
pub fn hostname() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Accepts RFC 3339 as well as offset-less ISO timestamps in local time
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
