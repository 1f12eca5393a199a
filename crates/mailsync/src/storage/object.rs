//! Remote object store abstraction

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Trait for the remote location the shared store is synchronized with
///
/// Object names are flat strings; implementations decide how they map to
/// paths or URLs.
pub trait ObjectStore: Send + Sync {
    /// Retrieve an object
    ///
    /// Returns None if the object doesn't exist.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Create or overwrite an object
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Create an object only if it does not exist yet
    ///
    /// Returns false when another writer got there first.
    fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<bool>;

    /// Delete an object, returning whether it existed
    fn delete(&self, name: &str) -> Result<bool>;

    /// Check if an object exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Write an object to a local file, returning false if it doesn't exist
    fn download_to(&self, name: &str, path: &Path) -> Result<bool> {
        match self.get(name)? {
            Some(data) => {
                fs::write(path, data)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Upload a local file as an object
    fn upload_from(&self, name: &str, path: &Path) -> Result<()> {
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        self.put(name, &data)
    }
}
