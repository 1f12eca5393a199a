//! Canonical message metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stable per-mailbox message identifier (IMAP UID)
///
/// Only unique within one mailbox, and only until the server changes the
/// mailbox's UIDVALIDITY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    pub fn new(uid: u32) -> Self {
        Self(uid)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for Uid {
    fn from(uid: u32) -> Self {
        Self(uid)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Parse an address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: email.to_string(),
            };
        }

        Self::new(s)
    }

    /// Lowercased address used for participant sets
    pub fn normalized(&self) -> String {
        self.email.to_ascii_lowercase()
    }

    /// Format the address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Normalized, decoding-tolerant view of one message's headers and flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// UID, unique within `mailbox`
    pub identifier: Uid,
    pub mailbox: String,
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    /// Parsed `Date` header; `None` when absent or unparseable
    pub date: Option<DateTime<Utc>>,
    /// `Message-ID` header token, e.g. `<abc@example.com>`
    pub message_id: Option<String>,
    /// `References` tokens in header order
    pub references: Vec<String>,
    pub in_reply_to: Option<String>,
    pub flags: BTreeSet<String>,
    pub size_bytes: u64,
    pub raw_preview: String,
}

impl CanonicalMessage {
    /// Create a message with empty headers, mostly useful for tests and fixtures
    pub fn new(identifier: Uid, mailbox: impl Into<String>) -> Self {
        Self {
            identifier,
            mailbox: mailbox.into(),
            subject: String::new(),
            sender: String::new(),
            recipients: Vec::new(),
            date: None,
            message_id: None,
            references: Vec::new(),
            in_reply_to: None,
            flags: BTreeSet::new(),
            size_bytes: 0,
            raw_preview: String::new(),
        }
    }

    /// All header tokens that link this message into a conversation
    pub fn header_tokens(&self) -> impl Iterator<Item = &str> {
        self.message_id
            .iter()
            .chain(self.references.iter())
            .chain(self.in_reply_to.iter())
            .map(String::as_str)
    }

    /// Whether the message carries the `\Seen` flag
    pub fn is_seen(&self) -> bool {
        self.flags.contains("\\Seen")
    }

    /// Sender and recipients as lowercased addresses
    pub fn participants(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.sender.as_str())
            .chain(self.recipients.iter().map(String::as_str))
            .filter(|s| !s.trim().is_empty())
            .map(|s| EmailAddress::parse(s).normalized())
    }
}
