//! Conversation thread reconstructed from header chains

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::CanonicalMessage;

/// A conversation: messages transitively linked by Message-ID, References
/// and In-Reply-To headers
///
/// Built on demand and never persisted by this crate. A thread with a single
/// member is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    /// Message-ID of the earliest member, else its first reference
    pub root_header_id: Option<String>,
    /// Members ordered by date ascending, undated members last
    pub members: Vec<CanonicalMessage>,
    /// Lowercased addresses of every sender and recipient
    pub participant_set: BTreeSet<String>,
}

impl ConversationThread {
    /// Build a thread from members that are already in chronological order
    pub fn from_ordered(members: Vec<CanonicalMessage>) -> Self {
        let root_header_id = members.first().and_then(|first| {
            first
                .message_id
                .clone()
                .or_else(|| first.references.first().cloned())
        });
        let participant_set = members
            .iter()
            .flat_map(CanonicalMessage::participants)
            .collect();

        Self {
            root_header_id,
            members,
            participant_set,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Subject of the earliest member
    pub fn subject(&self) -> &str {
        self.members
            .first()
            .map(|m| m.subject.as_str())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Uid;

    #[test]
    fn test_root_falls_back_to_first_reference() {
        let mut first = CanonicalMessage::new(Uid(2), "INBOX");
        first.references = vec!["<root@x>".into(), "<mid@x>".into()];
        first.sender = "a@example.com".into();

        let thread = ConversationThread::from_ordered(vec![first]);

        assert_eq!(thread.root_header_id.as_deref(), Some("<root@x>"));
        assert!(thread.participant_set.contains("a@example.com"));
    }

    #[test]
    fn test_root_absent_without_headers() {
        let thread = ConversationThread::from_ordered(vec![CanonicalMessage::new(Uid(1), "INBOX")]);
        assert_eq!(thread.root_header_id, None);
        assert_eq!(thread.len(), 1);
    }
}
