//! Batch fetch engine
//!
//! One UID search, then lazy per-batch fetching in the order the server
//! returned the identifiers. A message that fails to fetch is logged and
//! skipped; a connection failure that survives the single retry ends the
//! stream.

use chrono::NaiveDate;
use log::{debug, info, warn};

use crate::connection::ResilientConnection;
use crate::error::FetchError;
use crate::imap::normalize::normalize;
use crate::imap::{FetchItems, MailSession, RawRecord, SearchCriteria, SessionFactory};
use crate::models::{CanonicalMessage, FolderCheckpoint, SelectedMailbox, Uid};

/// Optional `SINCE`/`BEFORE` bounds for a batch fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    /// Inclusive lower bound
    pub since: Option<NaiveDate>,
    /// Exclusive upper bound
    pub before: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(since: Option<NaiveDate>, before: Option<NaiveDate>) -> Self {
        Self { since, before }
    }

    pub fn criteria(&self) -> SearchCriteria {
        SearchCriteria::DateRange {
            since: self.since,
            before: self.before,
        }
    }
}

/// One bounded group of normalized messages
#[derive(Debug, Clone)]
pub struct Batch {
    /// Zero-based position in the stream
    pub index: usize,
    pub mailbox: String,
    pub messages: Vec<CanonicalMessage>,
    /// UIDs whose fetch failed and were left out
    pub skipped: Vec<Uid>,
}

impl Batch {
    /// Highest UID attempted in this batch, fetched or skipped
    pub fn last_uid(&self) -> Option<Uid> {
        self.messages
            .iter()
            .map(|m| m.identifier)
            .chain(self.skipped.iter().copied())
            .max()
    }
}

/// One batch of raw fetch results, before normalization
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub index: usize,
    pub records: Vec<RawRecord>,
    pub skipped: Vec<Uid>,
}

/// Lazy sequence of batches over one search result
///
/// Yields `ceil(n / batch_size)` batches. When every message failed to
/// fetch, one extra `Err(FetchError::NothingFetched)` follows the last
/// batch, so callers counting items see one more than the batch count.
///
/// Not restartable: start a new fetch to run the search again. The stream
/// borrows the connection for its whole lifetime, so no other command can
/// interleave with it.
pub struct BatchStream<'c, F: SessionFactory> {
    conn: &'c mut ResilientConnection<F>,
    selected: SelectedMailbox,
    uids: Vec<Uid>,
    batch_size: usize,
    items: FetchItems,
    position: usize,
    next_index: usize,
    fetched: usize,
    failures: usize,
    done: bool,
}

impl<'c, F: SessionFactory> BatchStream<'c, F> {
    pub(crate) fn new(
        conn: &'c mut ResilientConnection<F>,
        selected: SelectedMailbox,
        uids: Vec<Uid>,
        batch_size: usize,
    ) -> Self {
        Self {
            conn,
            selected,
            uids,
            batch_size: batch_size.max(1),
            items: FetchItems::Headers,
            position: 0,
            next_index: 0,
            fetched: 0,
            failures: 0,
            done: false,
        }
    }

    /// Fetch full messages instead of header blocks
    pub fn with_items(mut self, items: FetchItems) -> Self {
        self.items = items;
        self
    }

    pub fn mailbox(&self) -> &str {
        &self.selected.name
    }

    pub fn uid_validity(&self) -> Option<u32> {
        self.selected.uid_validity
    }

    /// Number of identifiers the search returned
    pub fn total_messages(&self) -> usize {
        self.uids.len()
    }

    /// Number of batches the stream yields when every batch completes
    pub fn total_batches(&self) -> usize {
        self.uids.len().div_ceil(self.batch_size)
    }

    /// Messages fetched successfully so far
    pub fn fetched(&self) -> usize {
        self.fetched
    }

    /// Messages skipped so far
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Fetch the next batch without normalizing it
    pub fn next_raw(&mut self) -> Option<Result<RawBatch, FetchError>> {
        if self.done {
            return None;
        }

        if self.position >= self.uids.len() {
            self.done = true;
            if self.fetched == 0 && self.failures > 0 {
                warn!("Every message in {} failed to fetch", self.selected.name);
                return Some(Err(FetchError::NothingFetched {
                    mailbox: self.selected.name.clone(),
                    failures: self.failures,
                }));
            }
            return None;
        }

        let end = (self.position + self.batch_size).min(self.uids.len());
        let chunk: Vec<Uid> = self.uids[self.position..end].to_vec();
        self.position = end;
        let index = self.next_index;
        self.next_index += 1;

        debug!(
            "Fetching batch {} of {} from {} ({} messages)",
            index + 1,
            self.total_batches(),
            self.selected.name,
            chunk.len()
        );

        let items = self.items;
        let mut records = Vec::with_capacity(chunk.len());
        let mut skipped = Vec::new();
        for uid in chunk {
            match self.conn.execute(|s| s.uid_fetch(uid, items)) {
                Ok(record) => records.push(record),
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping UID {} in {}: {}", uid, self.selected.name, e);
                    skipped.push(uid);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(FetchError::Connection(e)));
                }
            }
        }

        self.fetched += records.len();
        self.failures += skipped.len();
        Some(Ok(RawBatch {
            index,
            records,
            skipped,
        }))
    }

    /// Advance `checkpoint` past everything `batch` attempted
    pub fn checkpoint_after(&self, checkpoint: FolderCheckpoint, batch: &Batch) -> FolderCheckpoint {
        let Some(last_uid) = batch.last_uid() else {
            return checkpoint.touched(self.uid_validity());
        };
        let newest = batch.messages.iter().max_by_key(|m| m.identifier);
        checkpoint.advanced(
            self.uid_validity(),
            last_uid,
            newest.and_then(|m| m.message_id.clone()),
            newest.and_then(|m| m.date),
        )
    }
}

impl<F: SessionFactory> Iterator for BatchStream<'_, F> {
    type Item = Result<Batch, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.next_raw()? {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };
        let mailbox = self.selected.name.clone();
        let messages = raw
            .records
            .iter()
            .map(|record| normalize(&mailbox, record))
            .collect();
        Some(Ok(Batch {
            index: raw.index,
            mailbox,
            messages,
            skipped: raw.skipped,
        }))
    }
}

/// Search `mailbox` and return a lazy stream of batches of at most `batch_size`
///
/// With no date bounds every message in the mailbox is returned. An empty
/// search result yields an empty stream, not an error.
pub fn fetch_batches<'c, F: SessionFactory>(
    conn: &'c mut ResilientConnection<F>,
    mailbox: &str,
    batch_size: usize,
    range: Option<DateRange>,
) -> Result<BatchStream<'c, F>, FetchError> {
    let selected = conn.select(mailbox)?;
    let criteria = range.map(|r| r.criteria()).unwrap_or(SearchCriteria::All);
    let uids = conn.execute(|s| s.uid_search(&criteria))?;
    info!(
        "Found {} messages in {} matching {}",
        uids.len(),
        mailbox,
        criteria
    );
    Ok(BatchStream::new(conn, selected, uids, batch_size))
}

/// Fetch the `limit` most recent messages, newest first
pub fn fetch_most_recent<F: SessionFactory>(
    conn: &mut ResilientConnection<F>,
    mailbox: &str,
    limit: usize,
) -> Result<Vec<CanonicalMessage>, FetchError> {
    search_messages(conn, mailbox, &SearchCriteria::All, limit)
}

/// Search `mailbox` and fetch the headers of the newest `limit` matches
///
/// Results are newest first. Messages that fail to fetch are skipped; if
/// every match fails the call returns [`FetchError::NothingFetched`].
pub fn search_messages<F: SessionFactory>(
    conn: &mut ResilientConnection<F>,
    mailbox: &str,
    criteria: &SearchCriteria,
    limit: usize,
) -> Result<Vec<CanonicalMessage>, FetchError> {
    conn.select(mailbox)?;
    let uids = conn.execute(|s| s.uid_search(criteria))?;
    debug!("{} matches for {} in {}", uids.len(), criteria, mailbox);
    let newest: Vec<Uid> = uids.iter().rev().take(limit).copied().collect();

    let mut messages = Vec::with_capacity(newest.len());
    let mut failures = 0;
    for uid in newest {
        match conn.execute(|s| s.uid_fetch(uid, FetchItems::Headers)) {
            Ok(record) => messages.push(normalize(mailbox, &record)),
            Err(e) if e.is_recoverable() => {
                warn!("Skipping UID {} in {}: {}", uid, mailbox, e);
                failures += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if messages.is_empty() && failures > 0 {
        return Err(FetchError::NothingFetched {
            mailbox: mailbox.to_string(),
            failures,
        });
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::{InMemoryServer, RawMessage};
    use crate::testing::connect as fake_connection;

    fn mailbox_with(n: u32) -> InMemoryServer {
        let mailbox = InMemoryServer::new();
        mailbox.create("INBOX");
        for uid in 1..=n {
            let raw = RawMessage::new()
                .message_id(&format!("<m{}@x>", uid))
                .subject(&format!("Subject {}", uid))
                .build();
            mailbox.add("INBOX", uid, raw);
        }
        mailbox
    }

    #[test]
    fn test_batch_count_and_sizes() {
        for (n, b) in [(0u32, 3usize), (1, 3), (7, 3), (9, 3), (10, 1), (5, 100)] {
            let mailbox = mailbox_with(n);
            let mut conn = fake_connection(&mailbox);

            let stream = fetch_batches(&mut conn, "INBOX", b, None).unwrap();
            let expected = (n as usize).div_ceil(b);
            assert_eq!(stream.total_batches(), expected);

            let batches: Vec<Batch> = stream.map(|b| b.unwrap()).collect();
            assert_eq!(batches.len(), expected);
            assert!(batches.iter().all(|batch| batch.messages.len() <= b));
            let total: usize = batches.iter().map(|batch| batch.messages.len()).sum();
            assert_eq!(total, n as usize);
        }
    }

    #[test]
    fn test_batches_follow_server_order() {
        let mailbox = mailbox_with(5);
        let mut conn = fake_connection(&mailbox);

        let uids: Vec<u32> = fetch_batches(&mut conn, "INBOX", 2, None)
            .unwrap()
            .flat_map(|b| b.unwrap().messages)
            .map(|m| m.identifier.get())
            .collect();

        assert_eq!(uids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_failed_message_is_skipped() {
        let mailbox = mailbox_with(4);
        mailbox.fail_fetch(3);
        let mut conn = fake_connection(&mailbox);

        let batches: Vec<Batch> = fetch_batches(&mut conn, "INBOX", 2, None)
            .unwrap()
            .map(|b| b.unwrap())
            .collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].messages.len(), 1);
        assert_eq!(batches[1].skipped, vec![Uid(3)]);
        assert_eq!(batches[1].last_uid(), Some(Uid(4)));
    }

    #[test]
    fn test_all_failures_is_an_error() {
        let mailbox = mailbox_with(2);
        mailbox.fail_fetch(1);
        mailbox.fail_fetch(2);
        let mut conn = fake_connection(&mailbox);

        let results: Vec<_> = fetch_batches(&mut conn, "INBOX", 5, None).unwrap().collect();

        assert_eq!(results.len(), 2);
        assert!(results[0].as_ref().is_ok_and(|b| b.messages.is_empty()));
        assert!(matches!(
            results[1],
            Err(FetchError::NothingFetched { failures: 2, .. })
        ));
    }

    #[test]
    fn test_connection_failure_ends_stream() {
        let mailbox = mailbox_with(4);
        let mut conn = fake_connection(&mailbox);
        let mut stream = fetch_batches(&mut conn, "INBOX", 2, None).unwrap();
        mailbox.drop_connections(2);

        assert!(matches!(stream.next(), Some(Err(FetchError::Connection(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_fetch_most_recent_newest_first() {
        let mailbox = mailbox_with(6);
        let mut conn = fake_connection(&mailbox);

        let recent = fetch_most_recent(&mut conn, "INBOX", 3).unwrap();
        let uids: Vec<u32> = recent.iter().map(|m| m.identifier.get()).collect();

        assert_eq!(uids, vec![6, 5, 4]);
        assert_eq!(recent[0].subject, "Subject 6");
    }

    #[test]
    fn test_fetch_most_recent_empty_mailbox() {
        let mailbox = InMemoryServer::new();
        mailbox.create("INBOX");
        let mut conn = fake_connection(&mailbox);

        assert!(fetch_most_recent(&mut conn, "INBOX", 10).unwrap().is_empty());
    }

    #[test]
    fn test_search_messages_newest_first_with_limit() {
        let server = mailbox_with(6);
        server.add(
            "INBOX",
            7,
            RawMessage::new().message_id("<other@x>").subject("Invoice").build(),
        );
        let mut conn = fake_connection(&server);
        let criteria = SearchCriteria::Header {
            field: crate::imap::HeaderField::MessageId,
            value: "@x".to_string(),
        };

        let found = search_messages(&mut conn, "INBOX", &criteria, 3).unwrap();

        let uids: Vec<Uid> = found.iter().map(|m| m.identifier).collect();
        assert_eq!(uids, vec![Uid(7), Uid(6), Uid(5)]);
    }

    #[test]
    fn test_search_messages_skips_failures() {
        let server = mailbox_with(3);
        server.fail_fetch(3);
        let mut conn = fake_connection(&server);

        let found = search_messages(&mut conn, "INBOX", &SearchCriteria::All, 2).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier, Uid(2));

        server.fail_fetch(2);
        let err = search_messages(&mut conn, "INBOX", &SearchCriteria::All, 2).unwrap_err();
        assert!(matches!(err, FetchError::NothingFetched { failures: 2, .. }));
    }

    #[test]
    fn test_search_messages_empty_result() {
        let server = mailbox_with(0);
        let mut conn = fake_connection(&server);
        let criteria = SearchCriteria::Header {
            field: crate::imap::HeaderField::MessageId,
            value: "<missing@x>".to_string(),
        };

        assert!(search_messages(&mut conn, "INBOX", &criteria, 10).unwrap().is_empty());
    }
}
