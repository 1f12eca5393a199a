//! Engine configuration
//!
//! Loaded in the following order of priority:
//! 1. An explicit JSON file
//! 2. `mailsync.json` in the config directory
//! 3. Built-in defaults
//!
//! Environment variables are applied on top of whichever source was used.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::imap::ImapSessionFactory;
use crate::storage::{LockSettings, ObjectStore, STALE_LOCK_AFTER, SharedStore};

/// Config filename in the mailsync config directory
const CONFIG_FILE: &str = "mailsync.json";

/// Local store filename in the data directory
const STORE_FILE: &str = "mailsync.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub imap: ImapConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub skip_tls_verify: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".to_string(),
            port: 993,
            username: None,
            skip_tls_verify: false,
        }
    }
}

impl ImapConfig {
    pub fn session_factory(&self) -> ImapSessionFactory {
        ImapSessionFactory {
            port: self.port,
            skip_tls_verify: self.skip_tls_verify,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub recent_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            recent_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Remote bucket; without one the store stays local
    pub bucket: Option<String>,
    pub object_name: String,
    /// Defaults to `<object_name>.lock`
    pub lock_object_name: Option<String>,
    /// Defaults to the data directory
    pub local_path: Option<PathBuf>,
    pub lock_attempts: u32,
    pub lock_retry_delay_ms: u64,
    pub stale_lock_secs: u64,
    pub verify_downloads: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            object_name: STORE_FILE.to_string(),
            lock_object_name: None,
            local_path: None,
            lock_attempts: 50,
            lock_retry_delay_ms: 500,
            stale_lock_secs: STALE_LOCK_AFTER.as_secs(),
            verify_downloads: true,
        }
    }
}

impl StoreConfig {
    pub fn lock_name(&self) -> String {
        self.lock_object_name
            .clone()
            .unwrap_or_else(|| format!("{}.lock", self.object_name))
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            max_attempts: self.lock_attempts,
            retry_delay: Duration::from_millis(self.lock_retry_delay_ms),
            stale_after: Duration::from_secs(self.stale_lock_secs),
        }
    }

    /// Where the working copy lives on this machine
    pub fn resolved_local_path(&self) -> Result<PathBuf> {
        match &self.local_path {
            Some(path) => Ok(path.clone()),
            None => config::data_path(STORE_FILE).context("Could not determine data directory"),
        }
    }

    /// Build a coordinator for this store over `remote`
    pub fn shared_store(&self, remote: Arc<dyn ObjectStore>) -> Result<SharedStore> {
        Ok(
            SharedStore::new(remote, self.object_name.clone(), self.resolved_local_path()?)
                .with_lock_name(self.lock_name())
                .with_lock_settings(self.lock_settings())
                .with_verification(self.verify_downloads),
        )
    }
}

impl EngineConfig {
    /// Load configuration from the default location, then apply the environment
    pub fn load() -> Result<Self> {
        let mut cfg = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Load configuration from a specific JSON file, then apply the environment
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut cfg: Self = config::load_json_file(path)?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse engine config JSON")
    }

    /// Apply `IMAP_*`, `GCS_BUCKET_NAME` and `MAILSYNC_LOCAL_STORE` overrides
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("IMAP_HOST") {
            self.imap.host = host;
        }
        if let Some(port) = lookup("IMAP_PORT") {
            self.imap.port = port
                .parse()
                .with_context(|| format!("IMAP_PORT is not a port number: {}", port))?;
        }
        if let Some(username) = lookup("IMAP_USERNAME") {
            self.imap.username = Some(username);
        }
        if let Some(bucket) = lookup("GCS_BUCKET_NAME") {
            self.store.bucket = Some(bucket);
        }
        if let Some(path) = lookup("MAILSYNC_LOCAL_STORE") {
            self.store.local_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Get the default config file path (~/.config/mailsync/mailsync.json)
    pub fn default_config_path() -> Option<PathBuf> {
        config::config_path(CONFIG_FILE)
    }
}
