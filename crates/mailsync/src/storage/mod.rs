//! Shared store coordination
//!
//! An [`ObjectStore`] holds the canonical copy of the store plus a lock
//! object. [`SharedStore`] serializes access to it across machines.

mod gcs;
mod lock;
mod memory;
mod object;
mod object_file;
mod shared;

pub use gcs::GcsObjectStore;
pub use lock::{RemoteLock, STALE_LOCK_AFTER, hostname};
pub use memory::InMemoryObjectStore;
pub use object::ObjectStore;
pub use object_file::FileObjectStore;
pub use shared::{
    DownloadOutcome, LockSettings, SessionReport, SharedStore, StoreLockGuard, UploadOutcome,
};
