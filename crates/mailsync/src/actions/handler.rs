//! Action handler for message mutations
//!
//! Every mutation runs through the resilience manager, so a dropped session
//! is repaired once before the failure is reported.

use log::{info, warn};

use crate::connection::ResilientConnection;
use crate::error::ConnectionError;
use crate::imap::{FlagOp, MailSession, SessionFactory};
use crate::models::{FolderInfo, Uid};

/// System flags used by mutations
pub mod flags {
    pub const SEEN: &str = "\\Seen";
    pub const DELETED: &str = "\\Deleted";
    pub const FLAGGED: &str = "\\Flagged";
}

/// Result of moving a message between mailboxes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Copied to the target and removed from the source
    Moved,
    /// Copied to the target, but the source copy could not be flagged for
    /// deletion and still exists
    CopiedOnly { reason: String },
}

impl MoveOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, MoveOutcome::Moved)
    }
}

/// Handler for flag changes, moves and deletes on one connection
pub struct ActionHandler<'c, F: SessionFactory> {
    conn: &'c mut ResilientConnection<F>,
}

impl<'c, F: SessionFactory> ActionHandler<'c, F> {
    pub fn new(conn: &'c mut ResilientConnection<F>) -> Self {
        Self { conn }
    }

    /// All mailboxes on the server
    pub fn list_folders(&mut self) -> Result<Vec<FolderInfo>, ConnectionError> {
        self.conn.execute(|s| s.list())
    }

    /// Move a message by copy, flag `\Deleted`, expunge
    ///
    /// A failure after the copy succeeded is reported as
    /// [`MoveOutcome::CopiedOnly`] rather than hidden. A failed expunge is
    /// only logged; the message is already flagged and leaves on the next one.
    pub fn move_message(&mut self, uid: Uid, from: &str, to: &str) -> Result<MoveOutcome, ConnectionError> {
        self.conn.select(from)?;
        self.conn.execute(|s| s.uid_copy(uid, to))?;

        if let Err(e) = self
            .conn
            .execute(|s| s.uid_store(uid, FlagOp::Add, &[flags::DELETED]))
        {
            warn!("UID {} copied to {} but not removed from {}: {}", uid, to, from, e);
            return Ok(MoveOutcome::CopiedOnly {
                reason: e.to_string(),
            });
        }

        if let Err(e) = self.conn.execute(|s| s.expunge()) {
            warn!("Expunge of {} after moving UID {} failed: {}", from, uid, e);
        }

        info!("Moved UID {} from {} to {}", uid, from, to);
        Ok(MoveOutcome::Moved)
    }

    /// Mark a message read or unread
    pub fn set_seen(&mut self, mailbox: &str, uid: Uid, seen: bool) -> Result<(), ConnectionError> {
        self.conn.select(mailbox)?;
        let op = if seen { FlagOp::Add } else { FlagOp::Remove };
        self.conn.execute(|s| s.uid_store(uid, op, &[flags::SEEN]))?;
        info!(
            "Marked UID {} in {} as {}",
            uid,
            mailbox,
            if seen { "read" } else { "unread" }
        );
        Ok(())
    }

    /// Flag or unflag a message
    pub fn set_flagged(&mut self, mailbox: &str, uid: Uid, flagged: bool) -> Result<(), ConnectionError> {
        self.conn.select(mailbox)?;
        let op = if flagged { FlagOp::Add } else { FlagOp::Remove };
        self.conn.execute(|s| s.uid_store(uid, op, &[flags::FLAGGED]))
    }

    /// Permanently delete a message
    pub fn delete_message(&mut self, mailbox: &str, uid: Uid) -> Result<(), ConnectionError> {
        self.conn.select(mailbox)?;
        self.conn
            .execute(|s| s.uid_store(uid, FlagOp::Add, &[flags::DELETED]))?;
        self.conn.execute(|s| s.expunge())?;
        info!("Deleted UID {} from {}", uid, mailbox);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::{InMemoryServer, RawMessage};
    use crate::testing::connect;

    fn server() -> InMemoryServer {
        let server = InMemoryServer::new();
        server.create("Archive");
        server.add("INBOX", 1, RawMessage::new().subject("hello").build());
        server
    }

    #[test]
    fn test_move_message() {
        let server = server();
        let mut conn = connect(&server);

        let outcome = ActionHandler::new(&mut conn)
            .move_message(Uid(1), "INBOX", "Archive")
            .unwrap();

        assert_eq!(outcome, MoveOutcome::Moved);
        assert!(server.uids("INBOX").is_empty());
        assert_eq!(server.uids("Archive").len(), 1);
    }

    #[test]
    fn test_move_reports_partial_success() {
        let server = server();
        server.fail_store(1);
        let mut conn = connect(&server);

        let outcome = ActionHandler::new(&mut conn)
            .move_message(Uid(1), "INBOX", "Archive")
            .unwrap();

        assert!(!outcome.is_complete());
        assert_eq!(server.uids("INBOX"), vec![Uid(1)]);
        assert_eq!(server.uids("Archive").len(), 1);
    }

    #[test]
    fn test_move_to_missing_mailbox_fails() {
        let server = server();
        let mut conn = connect(&server);

        let err = ActionHandler::new(&mut conn)
            .move_message(Uid(1), "INBOX", "Nowhere")
            .unwrap_err();

        assert!(err.is_recoverable());
        assert_eq!(server.uids("INBOX"), vec![Uid(1)]);
    }

    #[test]
    fn test_set_seen_roundtrip() {
        let server = server();
        let mut conn = connect(&server);
        let mut actions = ActionHandler::new(&mut conn);

        actions.set_seen("INBOX", Uid(1), true).unwrap();
        assert!(server.flags("INBOX", Uid(1)).contains(flags::SEEN));

        actions.set_seen("INBOX", Uid(1), false).unwrap();
        assert!(!server.flags("INBOX", Uid(1)).contains(flags::SEEN));
    }

    #[test]
    fn test_delete_message() {
        let server = server();
        let mut conn = connect(&server);

        ActionHandler::new(&mut conn).delete_message("INBOX", Uid(1)).unwrap();

        assert!(server.uids("INBOX").is_empty());
    }

    #[test]
    fn test_list_folders() {
        let server = server();
        let mut conn = connect(&server);

        let names: Vec<String> = ActionHandler::new(&mut conn)
            .list_folders()
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();

        assert_eq!(names, vec!["Archive", "INBOX"]);
    }
}
