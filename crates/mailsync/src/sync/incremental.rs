//! Incremental fetch from a folder checkpoint

use log::info;

use super::batch::BatchStream;
use crate::connection::ResilientConnection;
use crate::error::FetchError;
use crate::imap::{MailSession, SearchCriteria, SessionFactory};
use crate::models::FolderCheckpoint;

/// Stream only the messages that arrived after `checkpoint`
///
/// Falls back to the whole folder when the server's UIDVALIDITY no longer
/// matches the checkpoint, since the stored UID then means nothing. Use
/// [`BatchStream::checkpoint_after`] to advance the checkpoint per batch.
pub fn fetch_incremental<'c, F: SessionFactory>(
    conn: &'c mut ResilientConnection<F>,
    checkpoint: &FolderCheckpoint,
    batch_size: usize,
) -> Result<BatchStream<'c, F>, FetchError> {
    let selected = conn.select(&checkpoint.mailbox)?;

    let uids = match checkpoint.last_uid {
        Some(last_uid) if checkpoint.is_valid_for(selected.uid_validity) => {
            let found = conn.execute(|s| s.uid_search(&SearchCriteria::UidsAfter(last_uid)))?;
            // `UID n:*` also returns the newest message when nothing is newer
            found.into_iter().filter(|uid| *uid > last_uid).collect()
        }
        _ => {
            if checkpoint.last_uid.is_some() {
                info!(
                    "UIDVALIDITY of {} changed ({:?} -> {:?}); resyncing whole folder",
                    checkpoint.mailbox, checkpoint.uid_validity, selected.uid_validity
                );
            }
            conn.execute(|s| s.uid_search(&SearchCriteria::All))?
        }
    };

    info!(
        "{} new messages in {} since UID {:?}",
        uids.len(),
        checkpoint.mailbox,
        checkpoint.last_uid
    );
    Ok(BatchStream::new(conn, selected, uids, batch_size))
}
