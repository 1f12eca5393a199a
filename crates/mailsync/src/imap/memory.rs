//! In-memory mailbox server
//!
//! Implements [`MailSession`] over shared in-process state with the same
//! search semantics a real server has (substring `HEADER` matches, `UID n:*`
//! always including the newest message). Used for tests and offline
//! development; failure injection covers per-message errors, dropped
//! connections and rejected logins.

use chrono::{DateTime, NaiveDate, Utc};
use mailparse::MailHeaderMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::normalize::parse_date;
use super::{
    Credentials, FetchItems, FlagOp, MailSession, RawRecord, SearchCriteria, SessionFactory,
};
use crate::error::SessionError;
use crate::models::{FolderInfo, SelectedMailbox, Uid};

#[derive(Debug, Clone)]
struct StoredMessage {
    raw: Vec<u8>,
    flags: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Folder {
    uid_validity: u32,
    next_uid: u32,
    messages: BTreeMap<Uid, StoredMessage>,
}

#[derive(Debug, Default)]
struct ServerState {
    folders: BTreeMap<String, Folder>,
    failing_fetches: HashSet<Uid>,
    failing_stores: HashSet<Uid>,
    /// Upcoming operations that fail as if the connection dropped
    drops_pending: u32,
    reject_logins: bool,
}

/// Shared state behind every session opened from this server
#[derive(Debug, Clone, Default)]
pub struct InMemoryServer {
    state: Arc<Mutex<ServerState>>,
    connections: Arc<AtomicU32>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty mailbox if it does not exist
    pub fn create(&self, mailbox: &str) {
        self.state()
            .folders
            .entry(mailbox.to_string())
            .or_insert_with(|| Folder {
                uid_validity: 1,
                next_uid: 1,
                messages: BTreeMap::new(),
            });
    }

    /// Store a raw message under an explicit UID
    pub fn add(&self, mailbox: &str, uid: u32, raw: impl Into<Vec<u8>>) {
        self.create(mailbox);
        let mut state = self.state();
        if let Some(folder) = state.folders.get_mut(mailbox) {
            folder.messages.insert(
                Uid(uid),
                StoredMessage {
                    raw: raw.into(),
                    flags: BTreeSet::new(),
                },
            );
            folder.next_uid = folder.next_uid.max(uid + 1);
        }
    }

    /// Store a raw message under the next free UID
    pub fn append(&self, mailbox: &str, raw: impl Into<Vec<u8>>) -> Uid {
        self.create(mailbox);
        let uid = self
            .state()
            .folders
            .get(mailbox)
            .map(|f| f.next_uid)
            .unwrap_or(1);
        self.add(mailbox, uid, raw);
        Uid(uid)
    }

    /// UIDs currently stored in `mailbox`, ascending
    pub fn uids(&self, mailbox: &str) -> Vec<Uid> {
        self.state()
            .folders
            .get(mailbox)
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn flags(&self, mailbox: &str, uid: Uid) -> BTreeSet<String> {
        self.state()
            .folders
            .get(mailbox)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.flags.clone())
            .unwrap_or_default()
    }

    /// Simulate the server re-indexing a mailbox
    pub fn set_uid_validity(&self, mailbox: &str, uid_validity: u32) {
        self.create(mailbox);
        if let Some(folder) = self.state().folders.get_mut(mailbox) {
            folder.uid_validity = uid_validity;
        }
    }

    /// Make every fetch of `uid` fail with a protocol error
    pub fn fail_fetch(&self, uid: u32) {
        self.state().failing_fetches.insert(Uid(uid));
    }

    /// Make every flag update of `uid` fail with a protocol error
    pub fn fail_store(&self, uid: u32) {
        self.state().failing_stores.insert(Uid(uid));
    }

    /// Fail the next `count` operations as if the connection dropped
    pub fn drop_connections(&self, count: u32) {
        self.state().drops_pending = count;
    }

    /// Reject every subsequent login
    pub fn reject_logins(&self, reject: bool) {
        self.state().reject_logins = reject;
    }

    /// Number of sessions opened so far
    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn factory(&self) -> InMemorySessionFactory {
        InMemorySessionFactory {
            server: self.clone(),
        }
    }
}

/// Opens sessions against an [`InMemoryServer`]
#[derive(Debug, Clone)]
pub struct InMemorySessionFactory {
    server: InMemoryServer,
}

impl SessionFactory for InMemorySessionFactory {
    type Session = InMemorySession;

    fn open(&self, _host: &str, credentials: &Credentials) -> Result<InMemorySession, SessionError> {
        self.server.connections.fetch_add(1, Ordering::SeqCst);
        if self.server.state().reject_logins {
            return Err(SessionError::AuthFailure(format!(
                "[AUTHENTICATIONFAILED] invalid credentials for {}",
                credentials.username()
            )));
        }
        Ok(InMemorySession {
            server: self.server.clone(),
            selected: None,
        })
    }
}

/// One session against an [`InMemoryServer`]
#[derive(Debug)]
pub struct InMemorySession {
    server: InMemoryServer,
    selected: Option<String>,
}

impl InMemorySession {
    /// Lock the server state, consuming a pending connection drop if any
    fn state(&self) -> Result<MutexGuard<'_, ServerState>, SessionError> {
        let mut state = self.server.state();
        if state.drops_pending > 0 {
            state.drops_pending -= 1;
            return Err(SessionError::Transient("connection reset by peer".to_string()));
        }
        Ok(state)
    }

    fn selected(&self) -> Result<&str, SessionError> {
        self.selected
            .as_deref()
            .ok_or_else(|| SessionError::ProtocolError("no mailbox selected".to_string()))
    }
}

fn folder_mut<'a>(state: &'a mut ServerState, name: &str) -> Result<&'a mut Folder, SessionError> {
    state
        .folders
        .get_mut(name)
        .ok_or_else(|| SessionError::ProtocolError(format!("NO mailbox {} does not exist", name)))
}

fn header_block(raw: &[u8]) -> &[u8] {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| &raw[..pos + 4])
        .or_else(|| {
            raw.windows(2)
                .position(|w| w == b"\n\n")
                .map(|pos| &raw[..pos + 2])
        })
        .unwrap_or(raw)
}

fn message_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    headers.get_first_value("Date").as_deref().and_then(parse_date)
}

fn header_contains(raw: &[u8], field: &str, needle: &str) -> bool {
    let Ok((headers, _)) = mailparse::parse_headers(raw) else {
        return false;
    };
    let needle = needle.to_ascii_lowercase();
    headers
        .get_all_values(field)
        .iter()
        .any(|v| v.to_ascii_lowercase().contains(&needle))
}

fn matches(criteria: &SearchCriteria, uid: Uid, message: &StoredMessage) -> bool {
    match criteria {
        SearchCriteria::All => true,
        SearchCriteria::DateRange { since, before } => {
            let day: Option<NaiveDate> = message_date(&message.raw).map(|d| d.date_naive());
            match day {
                Some(day) => {
                    since.is_none_or(|since| day >= since) && before.is_none_or(|before| day < before)
                }
                None => since.is_none() && before.is_none(),
            }
        }
        SearchCriteria::UidsAfter(after) => uid > *after,
        SearchCriteria::Header { field, value } => header_contains(&message.raw, field.as_str(), value),
    }
}

impl MailSession for InMemorySession {
    fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox, SessionError> {
        let mut state = self.state()?;
        let folder = folder_mut(&mut state, mailbox)?;
        let selected = SelectedMailbox {
            name: mailbox.to_string(),
            exists: folder.messages.len() as u32,
            uid_validity: Some(folder.uid_validity),
        };
        drop(state);
        self.selected = Some(mailbox.to_string());
        Ok(selected)
    }

    fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, SessionError> {
        let name = self.selected()?.to_string();
        let mut state = self.state()?;
        let folder = folder_mut(&mut state, &name)?;
        let mut uids: Vec<Uid> = folder
            .messages
            .iter()
            .filter(|(uid, message)| matches(criteria, **uid, message))
            .map(|(uid, _)| *uid)
            .collect();
        // `UID n:*` always matches the highest UID, even when it is below n
        if let SearchCriteria::UidsAfter(_) = criteria
            && uids.is_empty()
            && let Some(last) = folder.messages.keys().next_back()
        {
            uids.push(*last);
        }
        Ok(uids)
    }

    fn uid_fetch(&mut self, uid: Uid, items: FetchItems) -> Result<RawRecord, SessionError> {
        let name = self.selected()?.to_string();
        let mut state = self.state()?;
        if state.failing_fetches.contains(&uid) {
            return Err(SessionError::ProtocolError(format!("unparseable FETCH response for UID {}", uid)));
        }
        let folder = folder_mut(&mut state, &name)?;
        let message = folder
            .messages
            .get(&uid)
            .ok_or_else(|| SessionError::ProtocolError(format!("no FETCH data for UID {}", uid)))?;
        let content = match items {
            FetchItems::Headers => header_block(&message.raw).to_vec(),
            FetchItems::Full => message.raw.clone(),
        };
        Ok(RawRecord {
            uid,
            flags: message.flags.clone(),
            size: message.raw.len() as u64,
            content,
        })
    }

    fn uid_store(&mut self, uid: Uid, op: FlagOp, flags: &[&str]) -> Result<(), SessionError> {
        let name = self.selected()?.to_string();
        let mut state = self.state()?;
        if state.failing_stores.contains(&uid) {
            return Err(SessionError::ProtocolError(format!("STORE failed for UID {}", uid)));
        }
        let folder = folder_mut(&mut state, &name)?;
        if let Some(message) = folder.messages.get_mut(&uid) {
            match op {
                FlagOp::Add => message.flags.extend(flags.iter().map(|f| f.to_string())),
                FlagOp::Remove => message.flags.retain(|f| !flags.contains(&f.as_str())),
                FlagOp::Replace => message.flags = flags.iter().map(|f| f.to_string()).collect(),
            }
        }
        Ok(())
    }

    fn uid_copy(&mut self, uid: Uid, mailbox: &str) -> Result<(), SessionError> {
        let name = self.selected()?.to_string();
        let mut state = self.state()?;
        let message = folder_mut(&mut state, &name)?
            .messages
            .get(&uid)
            .cloned()
            .ok_or_else(|| SessionError::ProtocolError(format!("no message with UID {}", uid)))?;
        let target = folder_mut(&mut state, mailbox)?;
        let new_uid = Uid(target.next_uid);
        target.next_uid += 1;
        target.messages.insert(
            new_uid,
            StoredMessage {
                raw: message.raw,
                flags: message.flags.into_iter().filter(|f| f != "\\Deleted").collect(),
            },
        );
        Ok(())
    }

    fn expunge(&mut self) -> Result<(), SessionError> {
        let name = self.selected()?.to_string();
        let mut state = self.state()?;
        folder_mut(&mut state, &name)?
            .messages
            .retain(|_, m| !m.flags.contains("\\Deleted"));
        Ok(())
    }

    fn list(&mut self) -> Result<Vec<FolderInfo>, SessionError> {
        let state = self.state()?;
        Ok(state
            .folders
            .keys()
            .map(|name| FolderInfo {
                name: name.clone(),
                delimiter: Some("/".to_string()),
                attributes: Vec::new(),
                selectable: true,
            })
            .collect())
    }

    fn noop(&mut self) -> Result<(), SessionError> {
        self.state().map(|_| ())
    }

    fn logout(&mut self) -> Result<(), SessionError> {
        self.selected = None;
        Ok(())
    }
}

/// Builder for RFC 822 test messages
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    headers: Vec<(String, String)>,
    body: String,
}

impl RawMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing an earlier value of the same name
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
        self
    }

    pub fn message_id(self, id: &str) -> Self {
        self.header("Message-ID", id)
    }

    pub fn subject(self, subject: &str) -> Self {
        self.header("Subject", subject)
    }

    pub fn from(self, from: &str) -> Self {
        self.header("From", from)
    }

    pub fn to(self, to: &str) -> Self {
        self.header("To", to)
    }

    pub fn date(self, date: &str) -> Self {
        self.header("Date", date)
    }

    pub fn references(self, refs: &[&str]) -> Self {
        if refs.is_empty() {
            return self;
        }
        self.header("References", refs.join(" "))
    }

    pub fn in_reply_to(self, id: &str) -> Self {
        self.header("In-Reply-To", id)
    }

    pub fn body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out.into_bytes()
    }
}
