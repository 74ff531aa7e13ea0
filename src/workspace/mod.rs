//! Document workspace
//!
//! The workspace owns the set of open documents and the edits made to them
//! since the server last heard about them. The client core drives it through
//! the [`Workspace`] trait:
//! - `sync_files` hands over pending edit batches and marks them synced
//! - `open_file` / `close_file` track holders per uri
//! - `get_file` / `files` give read-only snapshots
//!
//! Documents are owned here by uri; everything else refers to them by uri
//! (and [`DocumentId`] to notice a close followed by a reopen).

pub mod changes;
pub mod history;
pub mod mapping;
pub mod memory;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use changes::{ChangeDesc, ChangeError, ChangedRange, MapMode};
pub use history::EditHistory;
pub use mapping::WorkspaceMapping;
pub use memory::{HolderPolicy, MemoryWorkspace};

use crate::error::WorkspaceError;
use crate::models::TextChange;

/// Identity of one open/close lifetime of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub u64);

/// Read-only snapshot of an open document
#[derive(Debug, Clone)]
pub struct OpenDocument {
    pub id: DocumentId,
    pub uri: String,
    pub language_id: String,
    /// Version the server was last given; bumped by every non-empty sync batch
    pub version: u64,
    /// Current text, including edits not yet synced
    pub text: Arc<str>,
    /// Text as of `version`
    pub synced_text: Arc<str>,
    /// Sequential edits applied to `synced_text` since the last sync
    pub pending: Vec<TextChange>,
    pub holders: usize,
}

impl OpenDocument {
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// One edit batch handed over by [`Workspace::sync_files`]
#[derive(Debug, Clone)]
pub struct SyncedFile {
    pub id: DocumentId,
    pub uri: String,
    pub previous_version: u64,
    pub version: u64,
    pub previous_text: Arc<str>,
    pub text: Arc<str>,
    pub changes: Vec<TextChange>,
}

#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// First holder: the server must be told with `didOpen`
    Opened(OpenDocument),
    /// Another holder of an already open document
    Joined { holders: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Last holder gone: the server must be told with `didClose`
    Closed,
    Released { remaining: usize },
}

/// Document store consumed by the client core.
///
/// Implementations must keep one linear edit history per uri: however many
/// holders edit a document, their edits reach `sync_files` as a single
/// ordered batch.
pub trait Workspace: Send + Sync {
    fn get_file(&self, uri: &str) -> Option<OpenDocument>;

    fn files(&self) -> Vec<OpenDocument>;

    /// Take every pending edit batch, bump the affected versions and mark
    /// the documents synced, atomically.
    fn sync_files(&self) -> Vec<SyncedFile>;

    fn open_file(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<OpenOutcome, WorkspaceError>;

    fn close_file(&self, uri: &str) -> Result<CloseOutcome, WorkspaceError>;

    /// Record a sequential batch of local edits
    fn update_file(&self, uri: &str, changes: &[TextChange]) -> Result<(), WorkspaceError>;

    /// Ask the host to show a document. Only used by features outside the
    /// core; returns whether the host could do it.
    fn display_file(&self, _uri: &str) -> bool {
        false
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
