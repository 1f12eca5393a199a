//! Duplicate group model

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::Uid;

/// Hex-encoded SHA-256 content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages in one mailbox whose content fingerprints collide
///
/// The fingerprint is a heuristic: two distinct messages with the same
/// subject, sender, Date header and body land in the same group. Use
/// [`DuplicateGroup::shares_message_id`] when certainty is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub fingerprint: Fingerprint,
    pub mailbox: String,
    /// Always holds at least two identifiers
    pub members: BTreeSet<Uid>,
    /// Distinct Message-ID headers seen across the members
    pub message_ids: BTreeSet<String>,
    /// Number of members that carried no Message-ID at all
    pub missing_message_ids: usize,
}

impl DuplicateGroup {
    /// Whether every member carries the same Message-ID
    pub fn shares_message_id(&self) -> bool {
        self.message_ids.len() == 1 && self.missing_message_ids == 0
    }
}
