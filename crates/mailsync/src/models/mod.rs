//! Domain models for mailbox entities

mod duplicate;
mod folder;
mod message;
mod sync_state;
mod thread;

pub use duplicate::{DuplicateGroup, Fingerprint};
pub use folder::{FolderInfo, SelectedMailbox};
pub use message::{CanonicalMessage, EmailAddress, Uid};
pub use sync_state::FolderCheckpoint;
pub use thread::ConversationThread;
