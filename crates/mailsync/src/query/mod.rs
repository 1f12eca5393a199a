//! Conversation and duplicate analysis over fetched messages

mod duplicates;
mod threads;

pub use duplicates::{find_duplicates, fingerprint, normalize_body, scan_mailbox_duplicates};
pub use threads::{HeaderQuery, ImapCorpus, MessagePool, group_threads, reconstruct_thread};
