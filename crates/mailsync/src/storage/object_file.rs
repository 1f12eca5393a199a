//! Directory-backed object store
//!
//! Useful for a shared network mount or for local development. Object names
//! map to files below the root. Writes land in a temporary file first, so a
//! reader never sees a partially written object; conditional create publishes
//! the temporary file with a hard link, which fails if the name is taken.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};

use super::ObjectStore;

/// Object store rooted at a local directory
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Create a new file object store at the given path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create object store directory")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object name, refusing names that escape the root
    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !plain {
            anyhow::bail!("Invalid object name: {:?}", name);
        }
        Ok(self.root.join(relative))
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Write `data` to a temporary file next to `path`, unique per writer
    fn write_temp(path: &Path, data: &[u8]) -> Result<PathBuf> {
        static NEXT: AtomicU64 = AtomicU64::new(0);

        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(
            ".{}.{}.tmp",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let temp_path = path.with_file_name(name);
        fs::write(&temp_path, data)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        Ok(temp_path)
    }
}

impl ObjectStore for FileObjectStore {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read object {}", name)),
        }
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(name)?;
        Self::ensure_parent(&path)?;

        // Write atomically (write to temp, then rename)
        let temp_path = Self::write_temp(&path, data)?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e).with_context(|| format!("Failed to write object {}", name));
        }

        Ok(())
    }

    fn put_if_absent(&self, name: &str, data: &[u8]) -> Result<bool> {
        let path = self.object_path(name)?;
        Self::ensure_parent(&path)?;

        let temp_path = Self::write_temp(&path, data)?;
        let linked = fs::hard_link(&temp_path, &path);
        let _ = fs::remove_file(&temp_path);

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to create object {}", name)),
        }
    }

    fn delete(&self, name: &str) -> Result<bool> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete object {}", name)),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.object_path(name)?.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (FileObjectStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(temp_dir.path().join("objects")).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_put_and_get() {
        let (store, _temp) = create_test_store();

        store.put("mailsync.db", b"contents").unwrap();

        assert_eq!(store.get("mailsync.db").unwrap(), Some(b"contents".to_vec()));
        assert!(store.exists("mailsync.db").unwrap());
    }

    #[test]
    fn test_get_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.get("missing").unwrap().is_none());
        assert!(!store.delete("missing").unwrap());
    }

    #[test]
    fn test_put_if_absent_only_once() {
        let (store, _temp) = create_test_store();

        assert!(store.put_if_absent("db.lock", b"first").unwrap());
        assert!(!store.put_if_absent("db.lock", b"second").unwrap());
        assert_eq!(store.get("db.lock").unwrap(), Some(b"first".to_vec()));

        assert!(store.delete("db.lock").unwrap());
        assert!(store.put_if_absent("db.lock", b"third").unwrap());
        assert_eq!(fs::read_dir(store.root()).unwrap().count(), 1);
    }

    #[test]
    fn test_concurrent_create_has_one_winner_with_full_body() {
        let (store, _temp) = create_test_store();
        let store = std::sync::Arc::new(store);
        let body = vec![b'x'; 64 * 1024];

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let body = body.clone();
                std::thread::spawn(move || {
                    let won = store.put_if_absent("db.lock", &body).unwrap();
                    // Whoever lost must still read a complete object
                    let seen = store.get("db.lock").unwrap().unwrap();
                    (won, seen.len())
                })
            })
            .collect();
        let results: Vec<(bool, usize)> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(won, _)| *won).count(), 1);
        assert!(results.iter().all(|(_, len)| *len == body.len()));
    }

    #[test]
    fn test_rejects_escaping_names() {
        let (store, _temp) = create_test_store();
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.get("/etc/passwd").is_err());
        assert!(store.put("", b"x").is_err());
    }

    #[test]
    fn test_download_and_upload_files() {
        let (store, temp) = create_test_store();
        let local = temp.path().join("local.db");
        fs::write(&local, b"local state").unwrap();

        store.upload_from("shared/mailsync.db", &local).unwrap();
        let copy = temp.path().join("copy.db");
        assert!(store.download_to("shared/mailsync.db", &copy).unwrap());
        assert_eq!(fs::read(&copy).unwrap(), b"local state");

        assert!(!store.download_to("shared/missing.db", &copy).unwrap());
    }
}
