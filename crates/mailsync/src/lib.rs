//! Mailsync - resilient IMAP retrieval and analysis
//!
//! This crate provides:
//! - A session wrapper over IMAP with typed search and fetch requests
//! - A resilience manager that reconnects and retries exactly once
//! - Batched, incremental and most-recent message retrieval
//! - Conversation reconstruction from Message-ID / References / In-Reply-To
//! - Content-fingerprint duplicate detection
//! - Message mutations (move, flag, delete)
//! - A lock-coordinated store shared through a remote object store
//!
//! Everything is synchronous. Callers bring their own threads.

pub mod actions;
pub mod config;
pub mod connection;
pub mod error;
pub mod imap;
pub mod models;
pub mod query;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod testing;

pub use actions::{ActionHandler, MoveOutcome};
pub use self::config::{EngineConfig, ImapConfig, StoreConfig, SyncConfig};
pub use connection::{Attempt, ConnectionState, ResilientConnection};
pub use error::{ConnectionError, FetchError, LockError, SessionError, StoreError};
pub use self::imap::{
    Credentials, FetchItems, FlagOp, HeaderField, ImapSession, ImapSessionFactory, MailSession,
    RawRecord, SearchCriteria, SessionFactory, StaticToken, TokenFile, TokenSource,
};
pub use models::{
    CanonicalMessage, ConversationThread, DuplicateGroup, EmailAddress, Fingerprint,
    FolderCheckpoint, FolderInfo, SelectedMailbox, Uid,
};
pub use query::{
    HeaderQuery, ImapCorpus, MessagePool, find_duplicates, group_threads, reconstruct_thread,
    scan_mailbox_duplicates,
};
pub use storage::{
    DownloadOutcome, FileObjectStore, GcsObjectStore, InMemoryObjectStore, LockSettings,
    ObjectStore, RemoteLock, SharedStore, UploadOutcome,
};
pub use sync::{
    Batch, BatchStream, DateRange, fetch_batches, fetch_incremental, fetch_message, fetch_most_recent,
    search_messages,
};
