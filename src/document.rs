//! Document synchronization tracking
//!
//! Tracks which documents are "open" in the LSP sense, so the facade knows
//! when to send didOpen/didChange/didClose.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// State of an open document
#[derive(Debug, Clone)]
struct DocumentState {
    /// Version number for incremental updates
    version: i32,
    /// Hash of content for change detection
    content_hash: u64,
}

/// Tracks open documents for one server session
#[derive(Debug, Default)]
pub struct DocumentTracker {
    /// Open documents: uri -> state
    open_docs: HashMap<String, DocumentState>,
}

impl DocumentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a document is currently open
    pub fn is_open(&self, uri: &str) -> bool {
        self.open_docs.contains_key(uri)
    }

    /// Mark a document as open
    pub fn mark_open(&mut self, uri: &str, content: &str) {
        self.open_docs.insert(
            uri.to_string(),
            DocumentState {
                version: 1,
                content_hash: Self::hash_content(content),
            },
        );
    }

    /// Mark a document as closed
    pub fn mark_closed(&mut self, uri: &str) {
        self.open_docs.remove(uri);
    }

    /// Check if the on-disk content differs from what the server saw
    pub fn needs_sync(&self, uri: &str, content: &str) -> bool {
        match self.open_docs.get(uri) {
            Some(state) => state.content_hash != Self::hash_content(content),
            None => true,
        }
    }

    /// Bump the version after a change, returning the new version
    pub fn update_version(&mut self, uri: &str, content: &str) -> Option<i32> {
        let state = self.open_docs.get_mut(uri)?;
        state.version += 1;
        state.content_hash = Self::hash_content(content);
        Some(state.version)
    }

    /// Clear all tracked documents
    pub fn clear(&mut self) {
        self.open_docs.clear();
    }

    fn hash_content(content: &str) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        content.hash(&mut hasher);
        hasher.finish()
    }
}

/// Convert an absolute file path to a file:// URI
pub fn path_to_uri(path: &std::path::Path) -> String {
    format!("file://{}", path.display())
}

/// Extract the file path from a file:// URI
pub fn uri_to_path(uri: &str) -> &str {
    uri.strip_prefix("file://").unwrap_or(uri)
}
