//! Thread reconstruction over header chains
//!
//! Breadth-first closure over header tokens (Message-ID, References,
//! In-Reply-To). Every token is looked up under all three headers and the
//! results are unioned. Matching is exact: servers search headers by
//! substring, so candidates are re-checked before they join a thread.

use log::{debug, warn};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::connection::ResilientConnection;
use crate::error::ConnectionError;
use crate::imap::normalize::normalize;
use crate::imap::{FetchItems, HeaderField, MailSession, SearchCriteria, SessionFactory};
use crate::models::{CanonicalMessage, ConversationThread, Uid};

/// A message corpus searchable by header token
pub trait HeaderQuery {
    /// Messages whose `field` header may contain `token`
    ///
    /// Implementations may over-approximate; callers filter for exact matches.
    fn find_by_header(
        &mut self,
        field: HeaderField,
        token: &str,
    ) -> Result<Vec<CanonicalMessage>, ConnectionError>;
}

/// Whether `message` carries `token` in `field`, compared as exact strings
fn header_matches(message: &CanonicalMessage, field: HeaderField, token: &str) -> bool {
    match field {
        HeaderField::MessageId => message.message_id.as_deref() == Some(token),
        HeaderField::References => message.references.iter().any(|r| r == token),
        HeaderField::InReplyTo => message.in_reply_to.as_deref() == Some(token),
    }
}

/// Date ascending; undated messages after dated ones, in input order
fn chronological(mut members: Vec<CanonicalMessage>) -> Vec<CanonicalMessage> {
    // `sort_by` is stable, which keeps discovery order among ties
    members.sort_by(|a, b| match (a.date, b.date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    members
}

fn message_key(message: &CanonicalMessage) -> (String, Uid) {
    (message.mailbox.clone(), message.identifier)
}

/// Reconstruct the conversation containing `seed`
///
/// The seed is always a member. A header lookup that fails on its own is
/// logged and skipped; connection failures that survive the resilience
/// manager's retry are returned.
pub fn reconstruct_thread<Q: HeaderQuery + ?Sized>(
    seed: &CanonicalMessage,
    corpus: &mut Q,
) -> Result<ConversationThread, ConnectionError> {
    let mut members = vec![seed.clone()];
    let mut known: HashSet<(String, Uid)> = HashSet::from([message_key(seed)]);
    let mut visited: HashSet<String> = HashSet::new();
    let mut worklist: VecDeque<String> = VecDeque::new();

    let mut enqueue = |message: &CanonicalMessage, worklist: &mut VecDeque<String>| {
        for token in message.header_tokens() {
            if visited.insert(token.to_string()) {
                worklist.push_back(token.to_string());
            }
        }
    };
    enqueue(seed, &mut worklist);

    while let Some(token) = worklist.pop_front() {
        for field in HeaderField::ALL {
            let found = match corpus.find_by_header(field, &token) {
                Ok(found) => found,
                Err(e) if e.is_recoverable() => {
                    warn!("Header search {} {} failed: {}", field.as_str(), token, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for message in found {
                if !header_matches(&message, field, &token) {
                    continue;
                }
                if known.insert(message_key(&message)) {
                    enqueue(&message, &mut worklist);
                    members.push(message);
                }
            }
        }
    }

    debug!(
        "Thread of UID {} has {} members after visiting {} tokens",
        seed.identifier,
        members.len(),
        visited.len()
    );
    Ok(ConversationThread::from_ordered(chronological(members)))
}

/// In-memory corpus indexed by header token
#[derive(Debug, Clone, Default)]
pub struct MessagePool {
    messages: Vec<CanonicalMessage>,
    by_message_id: HashMap<String, Vec<usize>>,
    by_reference: HashMap<String, Vec<usize>>,
    by_reply_to: HashMap<String, Vec<usize>>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, message: CanonicalMessage) {
        let idx = self.messages.len();
        if let Some(id) = &message.message_id {
            self.by_message_id.entry(id.clone()).or_default().push(idx);
        }
        for reference in &message.references {
            let entries = self.by_reference.entry(reference.clone()).or_default();
            if entries.last() != Some(&idx) {
                entries.push(idx);
            }
        }
        if let Some(reply) = &message.in_reply_to {
            self.by_reply_to.entry(reply.clone()).or_default().push(idx);
        }
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[CanonicalMessage] {
        &self.messages
    }

    fn lookup(&self, field: HeaderField, token: &str) -> Vec<CanonicalMessage> {
        let index = match field {
            HeaderField::MessageId => &self.by_message_id,
            HeaderField::References => &self.by_reference,
            HeaderField::InReplyTo => &self.by_reply_to,
        };
        index
            .get(token)
            .map(|idxs| idxs.iter().map(|&i| self.messages[i].clone()).collect())
            .unwrap_or_default()
    }
}

impl FromIterator<CanonicalMessage> for MessagePool {
    fn from_iter<I: IntoIterator<Item = CanonicalMessage>>(iter: I) -> Self {
        let mut pool = MessagePool::new();
        for message in iter {
            pool.insert(message);
        }
        pool
    }
}

impl HeaderQuery for MessagePool {
    fn find_by_header(
        &mut self,
        field: HeaderField,
        token: &str,
    ) -> Result<Vec<CanonicalMessage>, ConnectionError> {
        Ok(self.lookup(field, token))
    }
}

impl HeaderQuery for &MessagePool {
    fn find_by_header(
        &mut self,
        field: HeaderField,
        token: &str,
    ) -> Result<Vec<CanonicalMessage>, ConnectionError> {
        Ok(self.lookup(field, token))
    }
}

/// Partition a pool into threads, in order of each thread's first message
pub fn group_threads(pool: &MessagePool) -> Vec<ConversationThread> {
    let mut assigned: HashSet<(String, Uid)> = HashSet::new();
    let mut threads = Vec::new();

    for seed in pool.messages() {
        if assigned.contains(&message_key(seed)) {
            continue;
        }
        let mut query = pool;
        // The in-memory corpus never fails
        let Ok(thread) = reconstruct_thread(seed, &mut query) else {
            continue;
        };
        assigned.extend(thread.members.iter().map(message_key));
        threads.push(thread);
    }

    threads
}

/// Live mailbox corpus searched through the resilience manager
///
/// Fetched headers are cached per UID, so a message reached through several
/// tokens is downloaded once.
pub struct ImapCorpus<'c, F: SessionFactory> {
    conn: &'c mut ResilientConnection<F>,
    mailbox: String,
    cache: HashMap<Uid, CanonicalMessage>,
}

impl<'c, F: SessionFactory> ImapCorpus<'c, F> {
    pub fn new(conn: &'c mut ResilientConnection<F>, mailbox: impl Into<String>) -> Self {
        Self {
            conn,
            mailbox: mailbox.into(),
            cache: HashMap::new(),
        }
    }

    fn ensure_selected(&mut self) -> Result<(), ConnectionError> {
        if self.conn.selected_mailbox() != Some(self.mailbox.as_str()) {
            self.conn.select(&self.mailbox)?;
        }
        Ok(())
    }

    fn message(&mut self, uid: Uid) -> Result<Option<CanonicalMessage>, ConnectionError> {
        if let Some(cached) = self.cache.get(&uid) {
            return Ok(Some(cached.clone()));
        }
        match self.conn.execute(|s| s.uid_fetch(uid, FetchItems::Headers)) {
            Ok(record) => {
                let message = normalize(&self.mailbox, &record);
                self.cache.insert(uid, message.clone());
                Ok(Some(message))
            }
            Err(e) if e.is_recoverable() => {
                warn!("Skipping UID {} in {}: {}", uid, self.mailbox, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl<F: SessionFactory> HeaderQuery for ImapCorpus<'_, F> {
    fn find_by_header(
        &mut self,
        field: HeaderField,
        token: &str,
    ) -> Result<Vec<CanonicalMessage>, ConnectionError> {
        self.ensure_selected()?;
        let criteria = SearchCriteria::Header {
            field,
            value: token.to_string(),
        };
        let uids = self.conn.execute(|s| s.uid_search(&criteria))?;

        let mut found = Vec::with_capacity(uids.len());
        for uid in uids {
            if let Some(message) = self.message(uid)? {
                found.push(message);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::imap::{InMemoryServer, RawMessage};
    use crate::testing::connect;
    use chrono::{TimeZone, Utc};

    fn msg(uid: u32, id: Option<&str>, refs: &[&str], hour: Option<u32>) -> CanonicalMessage {
        let mut m = CanonicalMessage::new(Uid(uid), "INBOX");
        m.message_id = id.map(str::to_string);
        m.references = refs.iter().map(|s| s.to_string()).collect();
        m.date = hour.map(|h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap());
        m
    }

    fn uids(thread: &ConversationThread) -> Vec<u32> {
        thread.members.iter().map(|m| m.identifier.get()).collect()
    }

    #[test]
    fn test_chain_from_middle_seed() {
        let m1 = msg(1, Some("<a>"), &[], Some(8));
        let m2 = msg(2, Some("<b>"), &["<a>"], Some(9));
        let m3 = msg(3, Some("<c>"), &["<b>"], Some(10));
        let mut pool: MessagePool = vec![m3, m1, m2.clone()].into_iter().collect();

        let thread = reconstruct_thread(&m2, &mut pool).unwrap();

        assert_eq!(uids(&thread), vec![1, 2, 3]);
        assert_eq!(thread.root_header_id.as_deref(), Some("<a>"));
    }

    #[test]
    fn test_reconstruction_is_idempotent() {
        let m1 = msg(1, Some("<a>"), &[], None);
        let m2 = msg(2, Some("<b>"), &["<a>"], Some(9));
        let m3 = msg(3, Some("<c>"), &["<a>", "<b>"], None);
        let mut pool: MessagePool = vec![m1, m2.clone(), m3].into_iter().collect();

        let first = reconstruct_thread(&m2, &mut pool).unwrap();
        let second = reconstruct_thread(&m2, &mut pool).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_seed_without_headers_is_alone() {
        let lonely = msg(9, None, &[], None);
        let mut pool: MessagePool = vec![msg(1, Some("<a>"), &[], None), lonely.clone()]
            .into_iter()
            .collect();

        let thread = reconstruct_thread(&lonely, &mut pool).unwrap();

        assert_eq!(uids(&thread), vec![9]);
        assert_eq!(thread.root_header_id, None);
    }

    #[test]
    fn test_undated_members_sort_last_in_discovery_order() {
        let seed = msg(5, Some("<root>"), &[], Some(12));
        let undated_a = msg(3, Some("<x>"), &["<root>"], None);
        let early = msg(4, Some("<y>"), &["<root>"], Some(6));
        let undated_b = msg(2, Some("<z>"), &["<root>"], None);
        let mut pool: MessagePool = vec![undated_a, early, undated_b, seed.clone()]
            .into_iter()
            .collect();

        let thread = reconstruct_thread(&seed, &mut pool).unwrap();

        assert_eq!(uids(&thread), vec![4, 5, 3, 2]);
    }

    #[test]
    fn test_cyclic_references_terminate() {
        let a = msg(1, Some("<a>"), &["<b>"], Some(1));
        let b = msg(2, Some("<b>"), &["<a>"], Some(2));
        let mut pool: MessagePool = vec![a.clone(), b].into_iter().collect();

        let thread = reconstruct_thread(&a, &mut pool).unwrap();
        assert_eq!(uids(&thread), vec![1, 2]);
    }

    #[test]
    fn test_in_reply_to_links_messages() {
        let parent = msg(1, Some("<p>"), &[], Some(1));
        let mut reply = msg(2, Some("<r>"), &[], Some(2));
        reply.in_reply_to = Some("<p>".to_string());
        let mut pool: MessagePool = vec![parent.clone(), reply].into_iter().collect();

        let thread = reconstruct_thread(&parent, &mut pool).unwrap();
        assert_eq!(uids(&thread), vec![1, 2]);
    }

    #[test]
    fn test_group_threads_partitions_pool() {
        let pool: MessagePool = vec![
            msg(1, Some("<a>"), &[], Some(1)),
            msg(2, Some("<x>"), &[], Some(2)),
            msg(3, Some("<b>"), &["<a>"], Some(3)),
            msg(4, None, &[], None),
        ]
        .into_iter()
        .collect();

        let threads = group_threads(&pool);

        assert_eq!(threads.len(), 3);
        assert_eq!(uids(&threads[0]), vec![1, 3]);
        assert_eq!(uids(&threads[1]), vec![2]);
        assert_eq!(uids(&threads[2]), vec![4]);
    }

    struct FailingOnce {
        pool: MessagePool,
        failed: bool,
    }

    impl HeaderQuery for FailingOnce {
        fn find_by_header(
            &mut self,
            field: HeaderField,
            token: &str,
        ) -> Result<Vec<CanonicalMessage>, ConnectionError> {
            if !self.failed && field == HeaderField::MessageId {
                self.failed = true;
                return Err(ConnectionError::Session(SessionError::ProtocolError(
                    "BAD search".to_string(),
                )));
            }
            self.pool.find_by_header(field, token)
        }
    }

    #[test]
    fn test_failed_header_search_is_skipped() {
        let m1 = msg(1, Some("<a>"), &[], Some(1));
        let m2 = msg(2, Some("<b>"), &["<a>"], Some(2));
        let mut corpus = FailingOnce {
            pool: vec![m1.clone(), m2].into_iter().collect(),
            failed: false,
        };

        let thread = reconstruct_thread(&m1, &mut corpus).unwrap();
        assert_eq!(uids(&thread), vec![1, 2]);
    }

    #[test]
    fn test_imap_corpus_requires_exact_match() {
        let server = InMemoryServer::new();
        let m1 = RawMessage::new()
            .message_id("a1")
            .date("Wed, 1 May 2024 08:00:00 +0000")
            .build();
        let m2 = RawMessage::new()
            .message_id("b1")
            .references(&["a1"])
            .date("Wed, 1 May 2024 09:00:00 +0000")
            .build();
        // The server's substring search returns this for both "a1" and "b1"
        let decoy = RawMessage::new().message_id("a12").references(&["zb1"]).build();
        server.add("INBOX", 1, m1);
        server.add("INBOX", 2, m2);
        server.add("INBOX", 3, decoy);
        let mut conn = connect(&server);

        let seed = msg(2, Some("b1"), &["a1"], Some(9));
        let mut corpus = ImapCorpus::new(&mut conn, "INBOX");
        let thread = reconstruct_thread(&seed, &mut corpus).unwrap();

        assert_eq!(uids(&thread), vec![1, 2]);
    }

    #[test]
    fn test_reply_with_garbage_date_sorts_last() {
        let server = InMemoryServer::new();
        server.add(
            "INBOX",
            1,
            RawMessage::new()
                .message_id("<root@x>")
                .date("Wed, 1 May 2024 08:00:00 +0000")
                .build(),
        );
        server.add(
            "INBOX",
            2,
            RawMessage::new()
                .message_id("<reply@x>")
                .in_reply_to("<root@x>")
                .date("garbage")
                .build(),
        );
        let mut conn = connect(&server);

        let seed = msg(1, Some("<root@x>"), &[], Some(8));
        let mut corpus = ImapCorpus::new(&mut conn, "INBOX");
        let thread = reconstruct_thread(&seed, &mut corpus).unwrap();

        assert_eq!(uids(&thread), vec![1, 2]);
        assert_eq!(thread.members[1].date, None);
    }
}
