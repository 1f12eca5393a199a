//! Mailbox (folder) descriptors returned by the server

use serde::{Deserialize, Serialize};

/// One entry of a LIST response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub name: String,
    pub delimiter: Option<String>,
    /// Raw name attributes such as `NoSelect`, `Sent`, `Trash`
    pub attributes: Vec<String>,
    pub selectable: bool,
}

impl FolderInfo {
    /// Gmail system folders live under the `[Gmail]` namespace
    pub fn is_system(&self) -> bool {
        self.name.starts_with("[Gmail]")
    }
}

/// State of a mailbox right after SELECT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedMailbox {
    pub name: String,
    pub exists: u32,
    pub uid_validity: Option<u32>,
}
