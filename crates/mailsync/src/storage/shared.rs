//! Shared store coordinator
//!
//! Several machines work against one SQLite store kept in a remote object
//! store. Each session takes the remote lock, downloads the latest copy,
//! does its work locally, uploads the result and releases the lock.
//!
//! The lock is advisory. Two processes can both observe a stale lock and
//! reclaim it; whichever conditional create lands first wins and the other
//! keeps waiting.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use rusqlite::{Connection, OpenFlags};

use super::ObjectStore;
use super::lock::{RemoteLock, STALE_LOCK_AFTER};
use crate::error::{LockError, StoreError};

/// How long and how often to wait for the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub stale_after: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            retry_delay: Duration::from_millis(500),
            stale_after: STALE_LOCK_AFTER,
        }
    }
}

/// Result of pulling the remote copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The local file now matches the remote copy
    Downloaded { bytes: u64 },
    /// No remote copy exists yet
    NotFound { created_placeholder: bool },
    /// The remote copy was unusable; the existing local file was kept
    KeptLocal { reason: String },
}

/// Result of pushing the local copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { bytes: u64 },
    /// Upload failed; the local copy is marked as pending and the next
    /// download keeps it instead of overwriting it with the remote copy
    Deferred { reason: String },
}

impl UploadOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }
}

/// What a locked session produced
#[derive(Debug)]
pub struct SessionReport<T> {
    pub value: T,
    pub download: DownloadOutcome,
    pub upload: UploadOutcome,
}

/// Coordinates access to the store shared through an [`ObjectStore`]
pub struct SharedStore {
    remote: Arc<dyn ObjectStore>,
    object_name: String,
    lock_name: String,
    local_path: PathBuf,
    settings: LockSettings,
    verify_downloads: bool,
    held: Mutex<Option<RemoteLock>>,
}

impl SharedStore {
    pub fn new(
        remote: Arc<dyn ObjectStore>,
        object_name: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        let object_name = object_name.into();
        Self {
            lock_name: format!("{}.lock", object_name),
            object_name,
            remote,
            local_path: local_path.into(),
            settings: LockSettings::default(),
            verify_downloads: true,
            held: Mutex::new(None),
        }
    }

    pub fn with_lock_name(mut self, lock_name: impl Into<String>) -> Self {
        self.lock_name = lock_name.into();
        self
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Check downloaded copies with `PRAGMA quick_check` before replacing the local file
    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_downloads = verify;
        self
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn holds_lock(&self) -> bool {
        self.held().is_some()
    }

    fn held(&self) -> MutexGuard<'_, Option<RemoteLock>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock using the configured settings
    pub fn acquire(&self) -> Result<(), LockError> {
        self.acquire_lock(self.settings.max_attempts, self.settings.retry_delay)
    }

    /// Take the remote lock, waiting `retry_delay` between attempts
    ///
    /// A lock older than the stale threshold is deleted and the create is
    /// retried immediately, without spending an attempt. A lock that cannot
    /// be parsed is re-read after `retry_delay` and only discarded if it is
    /// still unreadable and unchanged.
    pub fn acquire_lock(&self, max_attempts: u32, retry_delay: Duration) -> Result<(), LockError> {
        if self.holds_lock() {
            debug!("Lock {} already held by this store", self.lock_name);
            return Ok(());
        }

        let attempts = max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 1;
        let mut immediate_retries = 0;
        let mut unreadable: Option<Vec<u8>> = None;

        loop {
            let candidate = RemoteLock::for_current_process();
            let body = candidate.to_json().map_err(LockError::Store)?;

            if self
                .remote
                .put_if_absent(&self.lock_name, &body)
                .map_err(LockError::Store)?
            {
                info!(
                    "Acquired lock {} as {}:{} (attempt {})",
                    self.lock_name, candidate.holder_host, candidate.holder_pid, attempt
                );
                *self.held() = Some(candidate);
                return Ok(());
            }

            let retry_now = match self.remote.get(&self.lock_name).map_err(LockError::Store)? {
                None => {
                    debug!("Lock {} vanished, retrying", self.lock_name);
                    true
                }
                Some(raw) => match RemoteLock::parse(&raw) {
                    Ok(holder) if holder.is_stale(self.settings.stale_after, Utc::now()) => {
                        warn!(
                            "Reclaiming stale lock {} held by {}:{} since {}",
                            self.lock_name, holder.holder_host, holder.holder_pid, holder.acquired_at
                        );
                        self.delete_if_unchanged(&raw)?;
                        true
                    }
                    Ok(holder) => {
                        debug!(
                            "Lock {} held by {}:{} (attempt {}/{})",
                            self.lock_name, holder.holder_host, holder.holder_pid, attempt, attempts
                        );
                        unreadable = None;
                        false
                    }
                    Err(e) if unreadable.as_deref() == Some(raw.as_slice()) => {
                        warn!("Discarding unreadable lock {}: {:#}", self.lock_name, e);
                        self.delete_if_unchanged(&raw)?;
                        unreadable = None;
                        true
                    }
                    Err(e) => {
                        debug!("Lock {} unreadable ({:#}), checking again", self.lock_name, e);
                        unreadable = Some(raw);
                        false
                    }
                },
            };

            if retry_now && immediate_retries < attempts {
                immediate_retries += 1;
                continue;
            }
            if attempt >= attempts {
                break;
            }
            attempt += 1;
            thread::sleep(retry_delay);
        }

        let waited = started.elapsed();
        error!(
            "Gave up on lock {} after {} attempts ({:?})",
            self.lock_name, attempts, waited
        );
        Err(LockError::Timeout { attempts, waited })
    }

    /// Delete the lock only if it still holds `expected`
    ///
    /// Narrows, but does not close, the window in which two reclaimers
    /// could delete each other's fresh lock.
    fn delete_if_unchanged(&self, expected: &[u8]) -> Result<(), LockError> {
        let current = self.remote.get(&self.lock_name).map_err(LockError::Store)?;
        if current.as_deref() == Some(expected) {
            self.remote
                .delete(&self.lock_name)
                .map_err(LockError::Store)?;
        }
        Ok(())
    }

    /// Delete the lock if present
    ///
    /// Idempotent. A lock that names another holder is left in place.
    pub fn release_lock(&self) -> Result<(), LockError> {
        let mut held = self.held();

        let existing = self.remote.get(&self.lock_name).map_err(LockError::Store)?;
        if let Some(raw) = existing {
            match RemoteLock::parse(&raw) {
                Ok(holder) if !Self::owned_by(&held, &holder) => {
                    warn!(
                        "Not releasing lock {}: held by {}:{}",
                        self.lock_name, holder.holder_host, holder.holder_pid
                    );
                }
                _ => {
                    self.remote
                        .delete(&self.lock_name)
                        .map_err(LockError::Store)?;
                    info!("Released lock {}", self.lock_name);
                }
            }
        }

        *held = None;
        Ok(())
    }

    fn owned_by(held: &Option<RemoteLock>, holder: &RemoteLock) -> bool {
        match held {
            Some(ours) => ours == holder,
            None => holder.is_current_process(),
        }
    }

    /// Delete the lock regardless of who holds it
    pub fn force_unlock(&self) -> Result<bool, LockError> {
        let removed = self
            .remote
            .delete(&self.lock_name)
            .map_err(LockError::Store)?;
        if removed {
            warn!("Force-removed lock {}", self.lock_name);
        }
        *self.held() = None;
        Ok(removed)
    }

    /// Take the lock and release it when the guard drops
    pub fn lock(&self) -> Result<StoreLockGuard<'_>, LockError> {
        self.acquire()?;
        Ok(StoreLockGuard {
            store: self,
            released: false,
        })
    }

    /// Whether a previous upload was deferred and the local copy is ahead
    pub fn has_pending_upload(&self) -> bool {
        self.pending_marker().exists()
    }

    fn pending_marker(&self) -> PathBuf {
        sibling(&self.local_path, "pending")
    }

    /// Replace the local copy with the remote one
    ///
    /// Fails only when no usable local copy exists afterwards. A local copy
    /// with a deferred upload is kept as is.
    pub fn download_store(&self) -> Result<DownloadOutcome, StoreError> {
        let have_local = self.local_path.exists();
        if have_local && self.has_pending_upload() {
            let reason = "local changes not yet uploaded".to_string();
            warn!("Keeping local store {}: {}", self.local_path.display(), reason);
            return Ok(DownloadOutcome::KeptLocal { reason });
        }
        if let Some(parent) = self.local_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Fatal(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let temp_path = sibling(&self.local_path, "download");
        let fetched = self.remote.download_to(&self.object_name, &temp_path);

        let keep_local = |reason: String| {
            let _ = fs::remove_file(&temp_path);
            if have_local {
                warn!("Keeping local store {}: {}", self.local_path.display(), reason);
                Ok(DownloadOutcome::KeptLocal { reason })
            } else {
                error!("No usable store copy for {}: {}", self.object_name, reason);
                Err(StoreError::Fatal(reason))
            }
        };

        match fetched {
            Ok(true) => {
                if self.verify_downloads {
                    if let Err(reason) = verify_store(&temp_path) {
                        return keep_local(format!("downloaded copy failed integrity check: {}", reason));
                    }
                }
                if let Err(e) = fs::rename(&temp_path, &self.local_path) {
                    return keep_local(format!("cannot replace local copy: {}", e));
                }
                let bytes = fs::metadata(&self.local_path).map(|m| m.len()).unwrap_or(0);
                info!("Downloaded {} ({} bytes)", self.object_name, bytes);
                Ok(DownloadOutcome::Downloaded { bytes })
            }
            Ok(false) => {
                let _ = fs::remove_file(&temp_path);
                if have_local {
                    info!("No remote copy of {}, using local store", self.object_name);
                    return Ok(DownloadOutcome::NotFound {
                        created_placeholder: false,
                    });
                }
                File::create(&self.local_path).map_err(|e| {
                    StoreError::Fatal(format!(
                        "cannot create {}: {}",
                        self.local_path.display(),
                        e
                    ))
                })?;
                info!(
                    "No remote copy of {}, created empty store at {}",
                    self.object_name,
                    self.local_path.display()
                );
                Ok(DownloadOutcome::NotFound {
                    created_placeholder: true,
                })
            }
            Err(e) => keep_local(format!("download failed: {:#}", e)),
        }
    }

    /// Push the local copy to the remote store
    pub fn upload_store(&self) -> Result<UploadOutcome, StoreError> {
        let bytes = match fs::metadata(&self.local_path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                return Err(StoreError::Fatal(format!(
                    "no local store at {}: {}",
                    self.local_path.display(),
                    e
                )));
            }
        };

        match self.remote.upload_from(&self.object_name, &self.local_path) {
            Ok(()) => {
                info!("Uploaded {} ({} bytes)", self.object_name, bytes);
                let marker = self.pending_marker();
                if marker.exists() {
                    if let Err(e) = fs::remove_file(&marker) {
                        warn!("Failed to clear {}: {}", marker.display(), e);
                    }
                }
                Ok(UploadOutcome::Uploaded { bytes })
            }
            Err(e) => {
                warn!("Upload of {} deferred: {:#}", self.object_name, e);
                let marker = self.pending_marker();
                if let Err(e) = File::create(&marker) {
                    error!("Failed to mark {} as pending: {}", marker.display(), e);
                }
                Ok(UploadOutcome::Deferred {
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Lock, download, run `work` against the local file, upload, unlock
    ///
    /// The lock is released on every path. Nothing is uploaded when `work`
    /// fails.
    pub fn run_session<T>(
        &self,
        work: impl FnOnce(&Path) -> anyhow::Result<T>,
    ) -> Result<SessionReport<T>, StoreError> {
        let guard = self.lock()?;

        let download = self.download_store()?;
        let value = work(&self.local_path).map_err(StoreError::Session)?;
        let upload = self.upload_store()?;

        if let Err(e) = guard.release() {
            error!("Failed to release lock {}: {}", self.lock_name, e);
        }

        Ok(SessionReport {
            value,
            download,
            upload,
        })
    }

    /// Refresh the local copy and push it back under the lock
    pub fn sync_and_upload(&self) -> Result<SessionReport<()>, StoreError> {
        self.run_session(|_| Ok(()))
    }
}

/// Releases the store lock when dropped
pub struct StoreLockGuard<'a> {
    store: &'a SharedStore,
    released: bool,
}

impl StoreLockGuard<'_> {
    /// Release now and report failures instead of logging them
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.store.release_lock()
    }
}

impl Drop for StoreLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.store.release_lock() {
                error!("Failed to release lock {}: {}", self.store.lock_name, e);
            }
        }
    }
}

/// `path` with an extra extension, e.g. `store.db.download`
fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Run SQLite's quick integrity check against a file
fn verify_store(path: &Path) -> Result<(), String> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| e.to_string())?;
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if verdict == "ok" {
        Ok(())
    } else {
        Err(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    const OBJECT: &str = "mailsync.db";
    const LOCK: &str = "mailsync.db.lock";

    fn fast_settings() -> LockSettings {
        LockSettings {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
            stale_after: STALE_LOCK_AFTER,
        }
    }

    fn create_test_store() -> (SharedStore, Arc<InMemoryObjectStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let remote = Arc::new(InMemoryObjectStore::new());
        let store = SharedStore::new(remote.clone(), OBJECT, temp_dir.path().join("local.db"))
            .with_lock_settings(fast_settings());
        (store, remote, temp_dir)
    }

    fn foreign_lock(age_secs: i64) -> Vec<u8> {
        RemoteLock {
            holder_host: "other-host".into(),
            holder_pid: 99_999,
            acquired_at: Utc::now() - ChronoDuration::seconds(age_secs),
        }
        .to_json()
        .unwrap()
    }

    fn sqlite_file(path: &Path, value: i64) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE IF NOT EXISTS t(x INTEGER)").unwrap();
        conn.execute("INSERT INTO t VALUES (?1)", [value]).unwrap();
    }

    #[test]
    fn test_acquire_writes_lock_record() {
        let (store, remote, _temp) = create_test_store();

        store.acquire().unwrap();

        let holder = RemoteLock::parse(&remote.get(LOCK).unwrap().unwrap()).unwrap();
        assert!(holder.is_current_process());
        assert!(store.holds_lock());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let (store, remote, _temp) = create_test_store();
        remote.put(LOCK, &foreign_lock(301)).unwrap();

        store.acquire().unwrap();

        let holder = RemoteLock::parse(&remote.get(LOCK).unwrap().unwrap()).unwrap();
        assert!(holder.is_current_process());
    }

    #[test]
    fn test_fresh_lock_times_out() {
        let (store, remote, _temp) = create_test_store();
        let foreign = foreign_lock(10);
        remote.put(LOCK, &foreign).unwrap();

        let err = store.acquire().unwrap_err();

        assert!(matches!(err, LockError::Timeout { attempts: 3, .. }));
        assert_eq!(remote.get(LOCK).unwrap(), Some(foreign));
        assert!(!store.holds_lock());
    }

    #[test]
    fn test_unreadable_lock_is_discarded() {
        let (store, remote, _temp) = create_test_store();
        remote.put(LOCK, b"{ half a lock").unwrap();

        store.acquire().unwrap();
        assert!(store.holds_lock());
    }

    #[test]
    fn test_offsetless_old_lock_is_reclaimed() {
        let (store, remote, _temp) = create_test_store();
        let old = (chrono::Local::now() - ChronoDuration::hours(2))
            .naive_local()
            .format("%Y-%m-%dT%H:%M:%S%.f")
            .to_string();
        let raw = format!(r#"{{"hostname": "laptop", "pid": 12, "timestamp": "{}"}}"#, old);
        remote.put(LOCK, raw.as_bytes()).unwrap();

        store.acquire().unwrap();
        assert!(store.holds_lock());
    }

    #[test]
    fn test_release_is_idempotent() {
        let (store, remote, _temp) = create_test_store();
        store.acquire().unwrap();

        store.release_lock().unwrap();
        store.release_lock().unwrap();

        assert!(!remote.exists(LOCK).unwrap());
        assert!(!store.holds_lock());
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let (store, remote, _temp) = create_test_store();
        remote.put(LOCK, &foreign_lock(5)).unwrap();

        store.release_lock().unwrap();
        assert!(remote.exists(LOCK).unwrap());

        assert!(store.force_unlock().unwrap());
        assert!(!remote.exists(LOCK).unwrap());
        assert!(!store.force_unlock().unwrap());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (store, remote, _temp) = create_test_store();
        {
            let _guard = store.lock().unwrap();
            assert!(remote.exists(LOCK).unwrap());
        }
        assert!(!remote.exists(LOCK).unwrap());
    }

    #[test]
    fn test_download_absent_creates_placeholder() {
        let (store, _remote, _temp) = create_test_store();

        let outcome = store.download_store().unwrap();

        assert_eq!(outcome, DownloadOutcome::NotFound { created_placeholder: true });
        assert_eq!(fs::metadata(store.local_path()).unwrap().len(), 0);
    }

    #[test]
    fn test_download_absent_keeps_existing_local() {
        let (store, _remote, _temp) = create_test_store();
        sqlite_file(store.local_path(), 1);
        let before = fs::read(store.local_path()).unwrap();

        let outcome = store.download_store().unwrap();

        assert_eq!(outcome, DownloadOutcome::NotFound { created_placeholder: false });
        assert_eq!(fs::read(store.local_path()).unwrap(), before);
    }

    #[test]
    fn test_download_replaces_local_copy() {
        let (store, remote, temp) = create_test_store();
        let source = temp.path().join("remote.db");
        sqlite_file(&source, 7);
        remote.upload_from(OBJECT, &source).unwrap();

        let outcome = store.download_store().unwrap();

        assert!(matches!(outcome, DownloadOutcome::Downloaded { .. }));
        assert_eq!(fs::read(store.local_path()).unwrap(), fs::read(&source).unwrap());
        assert!(!sibling(store.local_path(), "download").exists());
    }

    #[test]
    fn test_corrupt_download_keeps_local() {
        let (store, remote, _temp) = create_test_store();
        sqlite_file(store.local_path(), 1);
        let before = fs::read(store.local_path()).unwrap();
        remote.put(OBJECT, b"definitely not a database file, just some bytes").unwrap();

        let outcome = store.download_store().unwrap();

        assert!(matches!(outcome, DownloadOutcome::KeptLocal { .. }));
        assert_eq!(fs::read(store.local_path()).unwrap(), before);
    }

    #[test]
    fn test_unreachable_remote() {
        let (store, remote, _temp) = create_test_store();
        remote.set_offline(true);

        // Nothing local to fall back on
        assert!(matches!(store.download_store(), Err(StoreError::Fatal(_))));

        sqlite_file(store.local_path(), 1);
        assert!(matches!(
            store.download_store().unwrap(),
            DownloadOutcome::KeptLocal { .. }
        ));
        assert!(matches!(
            store.upload_store().unwrap(),
            UploadOutcome::Deferred { .. }
        ));
    }

    #[test]
    fn test_upload_without_local_is_fatal() {
        let (store, _remote, _temp) = create_test_store();
        assert!(matches!(store.upload_store(), Err(StoreError::Fatal(_))));
    }

    #[test]
    fn test_run_session_round_trip() {
        let (store, remote, _temp) = create_test_store();

        let report = store
            .run_session(|path| {
                sqlite_file(path, 42);
                Ok("done")
            })
            .unwrap();

        assert_eq!(report.value, "done");
        assert_eq!(report.download, DownloadOutcome::NotFound { created_placeholder: true });
        assert!(report.upload.is_uploaded());
        assert_eq!(remote.get(OBJECT).unwrap().unwrap(), fs::read(store.local_path()).unwrap());
        assert!(!remote.exists(LOCK).unwrap());
    }

    #[test]
    fn test_failed_session_releases_without_upload() {
        let (store, remote, _temp) = create_test_store();

        let result: Result<SessionReport<()>, _> =
            store.run_session(|_| Err(anyhow::anyhow!("sync blew up")));

        assert!(matches!(result, Err(StoreError::Session(_))));
        assert!(!remote.exists(LOCK).unwrap());
        assert!(!remote.exists(OBJECT).unwrap());
    }

    #[test]
    fn test_session_blocked_by_live_lock() {
        let (store, remote, _temp) = create_test_store();
        remote.put(LOCK, &foreign_lock(10)).unwrap();
        let mut ran = false;

        let result = store.run_session(|_| {
            ran = true;
            Ok(())
        });

        assert!(matches!(result, Err(StoreError::Lock(LockError::Timeout { .. }))));
        assert!(!ran);
        assert!(remote.exists(LOCK).unwrap());
    }

    #[test]
    fn test_sync_and_upload_pushes_local_copy() {
        let (store, remote, _temp) = create_test_store();
        sqlite_file(store.local_path(), 3);

        let report = store.sync_and_upload().unwrap();

        assert!(report.upload.is_uploaded());
        assert!(remote.exists(OBJECT).unwrap());
    }

    #[test]
    fn test_deferred_upload_survives_next_download() {
        let (store, remote, temp) = create_test_store();
        let older = temp.path().join("older.db");
        sqlite_file(&older, 1);
        remote.upload_from(OBJECT, &older).unwrap();

        sqlite_file(store.local_path(), 2);
        remote.set_offline(true);
        assert!(matches!(store.upload_store().unwrap(), UploadOutcome::Deferred { .. }));
        assert!(store.has_pending_upload());
        remote.set_offline(false);

        let local = fs::read(store.local_path()).unwrap();
        assert!(matches!(
            store.download_store().unwrap(),
            DownloadOutcome::KeptLocal { .. }
        ));
        assert_eq!(fs::read(store.local_path()).unwrap(), local);

        assert!(store.upload_store().unwrap().is_uploaded());
        assert!(!store.has_pending_upload());
        assert_eq!(remote.get(OBJECT).unwrap(), Some(local));
    }

    #[test]
    fn test_stale_reclaim_does_not_spend_an_attempt() {
        let (store, remote, _temp) = create_test_store();
        remote.put(LOCK, &foreign_lock(301)).unwrap();

        store.acquire_lock(1, Duration::from_millis(1)).unwrap();

        assert!(store.holds_lock());
        let holder = RemoteLock::parse(&remote.get(LOCK).unwrap().unwrap()).unwrap();
        assert!(holder.is_current_process());
    }

    #[test]
    fn test_unreadable_lock_is_rechecked_before_discard() {
        let (store, remote, _temp) = create_test_store();
        remote.put(LOCK, b"").unwrap();

        // One attempt only sees the lock once, so it must not be deleted
        assert!(store.acquire_lock(1, Duration::from_millis(1)).is_err());
        assert_eq!(remote.get(LOCK).unwrap(), Some(Vec::new()));

        store.acquire_lock(2, Duration::from_millis(1)).unwrap();
        assert!(store.holds_lock());
    }

    #[test]
    fn test_file_lock_excludes_concurrent_holders() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let temp = TempDir::new().unwrap();
        let remote: Arc<dyn ObjectStore> =
            Arc::new(crate::storage::FileObjectStore::new(temp.path().join("bucket")).unwrap());
        let inside = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));
        let patient = LockSettings {
            max_attempts: 100_000,
            retry_delay: Duration::from_micros(50),
            stale_after: STALE_LOCK_AFTER,
        };

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let remote = remote.clone();
                let inside = inside.clone();
                let violations = violations.clone();
                let local = temp.path().join(format!("worker-{}.db", i));
                thread::spawn(move || {
                    let store = SharedStore::new(remote, OBJECT, local).with_lock_settings(patient);
                    for _ in 0..50 {
                        store.acquire().unwrap();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_micros(20));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        store.release_lock().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }
}
