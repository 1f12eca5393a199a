//! Per-folder checkpoint for incremental sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Uid;

/// Tracks how far a folder has been synced
///
/// Owned by the caller (typically persisted next to the shared store) and
/// handed back to [`crate::sync::fetch_incremental`] on the next run. UIDs
/// are only comparable while the mailbox's UIDVALIDITY is unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderCheckpoint {
    pub mailbox: String,
    /// UIDVALIDITY observed when `last_uid` was recorded
    pub uid_validity: Option<u32>,
    /// Highest UID processed so far
    pub last_uid: Option<Uid>,
    /// Message-ID of the most recently processed message
    pub last_message_id: Option<String>,
    /// Date of the most recently processed message
    pub last_processed_date: Option<DateTime<Utc>>,
    /// When the folder last synced without error
    pub last_success: Option<DateTime<Utc>>,
    /// Error recorded by the most recent failed run
    #[serde(default)]
    pub error_message: Option<String>,
}

impl FolderCheckpoint {
    /// Create an empty checkpoint; the next sync fetches the whole folder
    pub fn new(mailbox: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            uid_validity: None,
            last_uid: None,
            last_message_id: None,
            last_processed_date: None,
            last_success: None,
            error_message: None,
        }
    }

    /// Whether `last_uid` can be trusted against the server's current UIDVALIDITY
    pub fn is_valid_for(&self, uid_validity: Option<u32>) -> bool {
        self.last_uid.is_some() && self.uid_validity.is_some() && self.uid_validity == uid_validity
    }

    /// Record a successful run that processed messages up to `last_uid`
    pub fn advanced(
        mut self,
        uid_validity: Option<u32>,
        last_uid: Uid,
        last_message_id: Option<String>,
        last_processed_date: Option<DateTime<Utc>>,
    ) -> Self {
        if self.last_uid.is_none_or(|prev| last_uid > prev) || self.uid_validity != uid_validity {
            self.last_uid = Some(last_uid);
            self.last_message_id = last_message_id;
            self.last_processed_date = last_processed_date;
        }
        self.uid_validity = uid_validity;
        self.last_success = Some(Utc::now());
        self.error_message = None;
        self
    }

    /// Record a successful run that found nothing new
    pub fn touched(mut self, uid_validity: Option<u32>) -> Self {
        if self.uid_validity != uid_validity {
            self.last_uid = None;
        }
        self.uid_validity = uid_validity;
        self.last_success = Some(Utc::now());
        self.error_message = None;
        self
    }

    /// Record a failed run, keeping the last good position
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }
}
