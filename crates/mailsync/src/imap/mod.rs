//! Protocol session wrapper
//!
//! [`MailSession`] is the uniform surface every other component talks to. One
//! session owns one transport connection and runs one operation at a time;
//! callers serialize access (`&mut self`). [`ImapSession`] implements it on
//! the `imap` crate and [`InMemoryServer`] provides an in-process stand-in.

mod auth;
pub mod memory;
pub mod normalize;
mod session;

pub use auth::{Credentials, StaticToken, TokenFile, TokenSource, XOAuth2};
pub use memory::{InMemoryServer, InMemorySession, InMemorySessionFactory, RawMessage};
pub use session::{ImapSession, ImapSessionFactory};

use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::SessionError;
use crate::models::{FolderInfo, SelectedMailbox, Uid};

/// Header fields that can be searched when following conversation chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderField {
    MessageId,
    References,
    InReplyTo,
}

impl HeaderField {
    pub const ALL: [HeaderField; 3] = [
        HeaderField::MessageId,
        HeaderField::References,
        HeaderField::InReplyTo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HeaderField::MessageId => "Message-ID",
            HeaderField::References => "References",
            HeaderField::InReplyTo => "In-Reply-To",
        }
    }
}

/// UID SEARCH criteria
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    All,
    /// `SINCE`/`BEFORE` bounds; both absent is equivalent to `All`
    DateRange {
        since: Option<NaiveDate>,
        before: Option<NaiveDate>,
    },
    /// Every message with a UID greater than the given one
    UidsAfter(Uid),
    /// Header-scoped search; servers match `value` as a substring
    Header { field: HeaderField, value: String },
}

impl SearchCriteria {
    /// Render the criteria as an IMAP search key
    pub fn to_query(&self) -> String {
        match self {
            SearchCriteria::All => "ALL".to_string(),
            SearchCriteria::DateRange { since, before } => {
                let mut keys = Vec::new();
                if let Some(since) = since {
                    keys.push(format!("SINCE {}", imap_date(*since)));
                }
                if let Some(before) = before {
                    keys.push(format!("BEFORE {}", imap_date(*before)));
                }
                if keys.is_empty() {
                    "ALL".to_string()
                } else {
                    keys.join(" ")
                }
            }
            SearchCriteria::UidsAfter(uid) => format!("UID {}:*", uid.get().saturating_add(1)),
            SearchCriteria::Header { field, value } => {
                format!("HEADER {} {}", field.as_str(), quote(value))
            }
        }
    }
}

impl fmt::Display for SearchCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

/// IMAP date format, e.g. `1-Feb-2024`
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// What to fetch for one message
///
/// Both variants use `BODY.PEEK` so fetching never marks a message as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchItems {
    /// Header block only
    Headers,
    /// The complete raw message
    Full,
}

impl FetchItems {
    pub fn as_query(self) -> &'static str {
        match self {
            FetchItems::Headers => "(UID FLAGS RFC822.SIZE BODY.PEEK[HEADER])",
            FetchItems::Full => "(UID FLAGS RFC822.SIZE BODY.PEEK[])",
        }
    }
}

/// How `uid_store` changes the flag list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Remove,
    Replace,
}

impl FlagOp {
    fn as_prefix(self) -> &'static str {
        match self {
            FlagOp::Add => "+FLAGS.SILENT",
            FlagOp::Remove => "-FLAGS.SILENT",
            FlagOp::Replace => "FLAGS.SILENT",
        }
    }

    /// Render a STORE query such as `+FLAGS.SILENT (\Seen)`
    pub fn store_query(self, flags: &[&str]) -> String {
        format!("{} ({})", self.as_prefix(), flags.join(" "))
    }
}

/// Raw content and flags of one fetched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub uid: Uid,
    pub flags: BTreeSet<String>,
    pub size: u64,
    /// Header block or full RFC 822 message, depending on [`FetchItems`]
    pub content: Vec<u8>,
}

/// A stateful session with a mailbox server
pub trait MailSession {
    fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox, SessionError>;

    /// UIDs matching the criteria in ascending order
    fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, SessionError>;

    fn uid_fetch(&mut self, uid: Uid, items: FetchItems) -> Result<RawRecord, SessionError>;

    fn uid_store(&mut self, uid: Uid, op: FlagOp, flags: &[&str]) -> Result<(), SessionError>;

    fn uid_copy(&mut self, uid: Uid, mailbox: &str) -> Result<(), SessionError>;

    fn expunge(&mut self) -> Result<(), SessionError>;

    fn list(&mut self) -> Result<Vec<FolderInfo>, SessionError>;

    /// Liveness check
    fn noop(&mut self) -> Result<(), SessionError>;

    fn logout(&mut self) -> Result<(), SessionError>;
}

/// Produces fresh sessions for the resilience manager
pub trait SessionFactory {
    type Session: MailSession;

    /// Connect and authenticate a new session against `host`
    fn open(&self, host: &str, credentials: &Credentials) -> Result<Self::Session, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_range_query() {
        let criteria = SearchCriteria::DateRange {
            since: NaiveDate::from_ymd_opt(2024, 2, 1),
            before: NaiveDate::from_ymd_opt(2024, 12, 25),
        };
        assert_eq!(criteria.to_query(), "SINCE 1-Feb-2024 BEFORE 25-Dec-2024");
    }

    #[test]
    fn test_unbounded_date_range_is_all() {
        let criteria = SearchCriteria::DateRange {
            since: None,
            before: None,
        };
        assert_eq!(criteria.to_query(), "ALL");
    }

    #[test]
    fn test_uids_after_query() {
        assert_eq!(SearchCriteria::UidsAfter(Uid(41)).to_query(), "UID 42:*");
    }

    #[test]
    fn test_header_query_is_quoted() {
        let criteria = SearchCriteria::Header {
            field: HeaderField::InReplyTo,
            value: "<a\"b@x>".to_string(),
        };
        assert_eq!(criteria.to_query(), "HEADER In-Reply-To \"<a\\\"b@x>\"");
    }

    #[test]
    fn test_store_query() {
        assert_eq!(
            FlagOp::Add.store_query(&["\\Deleted"]),
            "+FLAGS.SILENT (\\Deleted)"
        );
        assert_eq!(
            FlagOp::Remove.store_query(&["\\Seen", "\\Flagged"]),
            "-FLAGS.SILENT (\\Seen \\Flagged)"
        );
    }

    #[test]
    fn test_fetch_items_never_mark_seen() {
        assert!(FetchItems::Headers.as_query().contains("BODY.PEEK"));
        assert!(FetchItems::Full.as_query().contains("BODY.PEEK"));
    }
}
