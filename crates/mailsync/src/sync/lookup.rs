//! Single-message retrieval

use log::debug;

use crate::connection::ResilientConnection;
use crate::error::FetchError;
use crate::imap::normalize::{body_text, normalize};
use crate::imap::{FetchItems, MailSession, SessionFactory};
use crate::models::{CanonicalMessage, Uid};

/// Fetch one message with its decoded body text
///
/// The body is the first `text/plain` part, else the first decodable part;
/// it is empty when nothing decodes. Fetching uses
/// `BODY.PEEK[]`, so the message is not marked as seen.
pub fn fetch_message<F: SessionFactory>(
    conn: &mut ResilientConnection<F>,
    mailbox: &str,
    uid: Uid,
) -> Result<(CanonicalMessage, String), FetchError> {
    conn.select(mailbox)?;
    let record = conn.execute(|s| s.uid_fetch(uid, FetchItems::Full))?;
    let message = normalize(mailbox, &record);

    let body = match mailparse::parse_mail(&record.content) {
        Ok(parsed) => body_text(&parsed).unwrap_or_default(),
        Err(e) => {
            debug!("Could not parse body of UID {} in {}: {}", uid, mailbox, e);
            String::new()
        }
    };
    Ok((message, body))
}
