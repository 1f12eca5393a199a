//! `MailSession` over the `imap` crate
//!
//! Blocking I/O, so the wrapper stays executor-agnostic like the rest of the
//! engine. Callers that run on an async runtime should move sessions onto a
//! blocking thread.

use imap::types::Flag;
use imap::{ClientBuilder, ConnectionMode};
use imap_proto::NameAttribute;
use log::{debug, info};
use std::collections::BTreeSet;
use std::io::ErrorKind;

use super::{
    Credentials, FetchItems, FlagOp, MailSession, RawRecord, SearchCriteria, SessionFactory,
    XOAuth2,
};
use crate::error::SessionError;
use crate::models::{FolderInfo, SelectedMailbox, Uid};

/// One authenticated IMAP connection
pub struct ImapSession {
    inner: imap::Session<imap::Connection>,
}

/// Opens TLS sessions against the configured port
#[derive(Debug, Clone)]
pub struct ImapSessionFactory {
    pub port: u16,
    pub skip_tls_verify: bool,
}

impl Default for ImapSessionFactory {
    fn default() -> Self {
        Self {
            port: 993,
            skip_tls_verify: false,
        }
    }
}

impl SessionFactory for ImapSessionFactory {
    type Session = ImapSession;

    fn open(&self, host: &str, credentials: &Credentials) -> Result<ImapSession, SessionError> {
        debug!("IMAP connect host={} port={}", host, self.port);
        let client = ClientBuilder::new(host, self.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .danger_skip_tls_verify(self.skip_tls_verify)
            .connect()
            .map_err(map_error)?;

        let inner = match credentials {
            Credentials::Password { username, password } => client
                .login(username, password)
                .map_err(|(e, _)| map_login_error(e))?,
            Credentials::OAuth2 { username, tokens } => {
                let token = tokens
                    .bearer_token()
                    .map_err(|e| SessionError::AuthFailure(format!("{:#}", e)))?;
                client
                    .authenticate("XOAUTH2", &XOAuth2::new(username.as_str(), token))
                    .map_err(|(e, _)| map_login_error(e))?
            }
        };

        info!("IMAP session established for {} on {}", credentials.username(), host);
        Ok(ImapSession { inner })
    }
}

/// Classify a transport or protocol failure
fn map_error(err: imap::Error) -> SessionError {
    let message = err.to_string();
    match &err {
        imap::Error::Io(io) if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            SessionError::Timeout(message)
        }
        imap::Error::Io(_) | imap::Error::ConnectionLost | imap::Error::Bye(_) => {
            SessionError::Transient(message)
        }
        _ => SessionError::ProtocolError(message),
    }
}

/// During login a negative response means the credential was rejected
fn map_login_error(err: imap::Error) -> SessionError {
    match err {
        imap::Error::No(_) | imap::Error::Bad(_) => SessionError::AuthFailure(err.to_string()),
        other => map_error(other),
    }
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
        #[allow(unreachable_patterns)]
        other => format!("{:?}", other),
    }
}

fn attribute_name(attr: &NameAttribute<'_>) -> String {
    match attr {
        NameAttribute::Extension(name) => name.to_string(),
        other => format!("{:?}", other),
    }
}

impl MailSession for ImapSession {
    fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox, SessionError> {
        let selected = self.inner.select(mailbox).map_err(map_error)?;
        debug!("Selected {} exists={}", mailbox, selected.exists);
        Ok(SelectedMailbox {
            name: mailbox.to_string(),
            exists: selected.exists,
            uid_validity: selected.uid_validity,
        })
    }

    fn uid_search(&mut self, criteria: &SearchCriteria) -> Result<Vec<Uid>, SessionError> {
        let query = criteria.to_query();
        debug!("UID SEARCH {}", query);
        let found = self.inner.uid_search(&query).map_err(map_error)?;
        // The client hands back an unordered set; restore ascending UID order
        let mut uids: Vec<Uid> = found.into_iter().map(Uid).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn uid_fetch(&mut self, uid: Uid, items: FetchItems) -> Result<RawRecord, SessionError> {
        let fetches = self
            .inner
            .uid_fetch(uid.to_string(), items.as_query())
            .map_err(map_error)?;
        let fetch = fetches
            .iter()
            .find(|f| f.uid == Some(uid.get()))
            .ok_or_else(|| SessionError::ProtocolError(format!("no FETCH data for UID {}", uid)))?;

        let content = match items {
            FetchItems::Headers => fetch.header(),
            FetchItems::Full => fetch.body(),
        }
        .ok_or_else(|| SessionError::ProtocolError(format!("empty FETCH body for UID {}", uid)))?;

        let flags: BTreeSet<String> = fetch.flags().iter().map(flag_name).collect();

        Ok(RawRecord {
            uid,
            flags,
            size: fetch.size.map(u64::from).unwrap_or(content.len() as u64),
            content: content.to_vec(),
        })
    }

    fn uid_store(&mut self, uid: Uid, op: FlagOp, flags: &[&str]) -> Result<(), SessionError> {
        self.inner
            .uid_store(uid.to_string(), op.store_query(flags))
            .map_err(map_error)?;
        Ok(())
    }

    fn uid_copy(&mut self, uid: Uid, mailbox: &str) -> Result<(), SessionError> {
        self.inner
            .uid_copy(uid.to_string(), mailbox)
            .map_err(map_error)
    }

    fn expunge(&mut self) -> Result<(), SessionError> {
        self.inner.expunge().map_err(map_error)?;
        Ok(())
    }

    fn list(&mut self) -> Result<Vec<FolderInfo>, SessionError> {
        let names = self.inner.list(None, Some("*")).map_err(map_error)?;
        Ok(names
            .iter()
            .map(|name| {
                let selectable = !name
                    .attributes()
                    .iter()
                    .any(|attr| matches!(attr, NameAttribute::NoSelect));
                FolderInfo {
                    name: name.name().to_string(),
                    delimiter: name.delimiter().map(str::to_string),
                    attributes: name.attributes().iter().map(attribute_name).collect(),
                    selectable,
                }
            })
            .collect())
    }

    fn noop(&mut self) -> Result<(), SessionError> {
        self.inner.noop().map_err(map_error)
    }

    fn logout(&mut self) -> Result<(), SessionError> {
        self.inner.logout().map_err(map_error)
    }
}
