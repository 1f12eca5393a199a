//! Duplicate detection by content fingerprint
//!
//! The fingerprint is SHA-256 over `(subject, sender, Date header as
//! received, normalized body)`. It is a heuristic: two genuinely different
//! messages with identical values for all four fields are reported as
//! duplicates. Compare Message-IDs ([`DuplicateGroup::shares_message_id`])
//! before acting on a group destructively.

use log::{debug, info};
use mailparse::MailHeaderMap;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::connection::ResilientConnection;
use crate::error::FetchError;
use crate::imap::normalize::{body_text, id_tokens};
use crate::imap::{FetchItems, RawRecord, SessionFactory};
use crate::models::{DuplicateGroup, Fingerprint, Uid};
use crate::sync::fetch_batches;

/// Canonical body form: LF line endings, no trailing whitespace, trimmed
pub fn normalize_body(body: &str) -> String {
    body.replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Hash the four identifying fields, length-prefixed so field boundaries
/// cannot shift between messages
pub fn fingerprint(subject: &str, sender: &str, raw_date: &str, body: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    for field in [subject, sender, raw_date, body] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    Fingerprint(format!("{:x}", hasher.finalize()))
}

struct Candidate {
    uid: Uid,
    fingerprint: Fingerprint,
    message_id: Option<String>,
}

fn candidate(record: &RawRecord) -> Candidate {
    let Ok(parsed) = mailparse::parse_mail(&record.content) else {
        let body = String::from_utf8_lossy(&record.content);
        return Candidate {
            uid: record.uid,
            fingerprint: fingerprint("", "", "", &normalize_body(&body)),
            message_id: None,
        };
    };

    let header = |name: &str| parsed.headers.get_first_value(name).unwrap_or_default();
    let body = body_text(&parsed).unwrap_or_default();
    Candidate {
        uid: record.uid,
        fingerprint: fingerprint(
            header("Subject").trim(),
            header("From").trim(),
            header("Date").trim(),
            &normalize_body(&body),
        ),
        message_id: parsed
            .headers
            .get_first_value("Message-ID")
            .and_then(|v| id_tokens(&v).into_iter().next()),
    }
}

fn group(mailbox: &str, candidates: Vec<Candidate>) -> BTreeMap<Fingerprint, DuplicateGroup> {
    let mut groups: BTreeMap<Fingerprint, DuplicateGroup> = BTreeMap::new();
    for c in candidates {
        let entry = groups
            .entry(c.fingerprint.clone())
            .or_insert_with(|| DuplicateGroup {
                fingerprint: c.fingerprint,
                mailbox: mailbox.to_string(),
                members: BTreeSet::new(),
                message_ids: BTreeSet::new(),
                missing_message_ids: 0,
            });
        entry.members.insert(c.uid);
        match c.message_id {
            Some(id) => {
                entry.message_ids.insert(id);
            }
            None => entry.missing_message_ids += 1,
        }
    }
    groups.retain(|_, g| g.members.len() >= 2);
    groups
}

/// Group full messages of one mailbox by fingerprint, keeping only collisions
pub fn find_duplicates(mailbox: &str, corpus: &[RawRecord]) -> BTreeMap<Fingerprint, DuplicateGroup> {
    let candidates: Vec<Candidate> = corpus.par_iter().map(candidate).collect();
    group(mailbox, candidates)
}

/// Fetch every message in `mailbox` and report duplicate groups
///
/// Messages are fingerprinted batch by batch, so only one batch of full
/// content is held in memory at a time.
pub fn scan_mailbox_duplicates<F: SessionFactory>(
    conn: &mut ResilientConnection<F>,
    mailbox: &str,
    batch_size: usize,
) -> Result<BTreeMap<Fingerprint, DuplicateGroup>, FetchError> {
    let mut stream = fetch_batches(conn, mailbox, batch_size, None)?.with_items(FetchItems::Full);
    let mut candidates = Vec::with_capacity(stream.total_messages());

    while let Some(batch) = stream.next_raw() {
        let batch = batch?;
        debug!("Fingerprinting {} messages from {}", batch.records.len(), mailbox);
        candidates.extend(batch.records.par_iter().map(candidate).collect::<Vec<_>>());
    }

    let groups = group(mailbox, candidates);
    info!("Found {} duplicate groups in {}", groups.len(), mailbox);
    Ok(groups)
}
