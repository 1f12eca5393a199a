//! In-memory object store
//!
//! This implementation is used for testing. It can be switched offline to
//! exercise the degraded paths of the shared store coordinator.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use super::ObjectStore;

/// In-memory implementation of ObjectStore
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
}

impl InMemoryObjectStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the remote were unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("object store unreachable");
        }
        Ok(())
    }

    /// Names of all stored objects, sorted
    pub fn names(&self) -> Vec<String> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = objects.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.get(name).cloned())
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.check_online()?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<bool> {
        self.check_online()?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        if objects.contains_key(name) {
            return Ok(false);
        }
        objects.insert(name.to_string(), data.to_vec());
        Ok(true)
    }

    fn delete(&self, name: &str) -> Result<bool> {
        self.check_online()?;
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.remove(name).is_some())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.check_online()?;
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects.contains_key(name))
    }
}
