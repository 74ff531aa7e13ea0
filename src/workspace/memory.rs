//! In-memory workspace

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    CloseOutcome, DocumentId, OpenDocument, OpenOutcome, SyncedFile, Workspace, lock,
};
use crate::error::WorkspaceError;
use crate::models::TextChange;
use crate::models::text::apply_change;

type DisplayHook = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// How many holders a document may have at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HolderPolicy {
    /// A second `open_file` for the same uri is an error
    #[default]
    Exclusive,
    /// Holders are reference counted; the document closes with the last one
    Shared,
}

#[derive(Debug)]
struct DocumentState {
    id: DocumentId,
    language_id: String,
    version: u64,
    text: Arc<str>,
    synced_text: Arc<str>,
    pending: Vec<TextChange>,
    holders: usize,
}

impl DocumentState {
    fn new(id: DocumentId, language_id: &str, text: &str) -> Self {
        let text: Arc<str> = Arc::from(text);
        Self {
            id,
            language_id: language_id.to_string(),
            version: 0,
            synced_text: Arc::clone(&text),
            text,
            pending: Vec::new(),
            holders: 1,
        }
    }

    fn snapshot(&self, uri: &str) -> OpenDocument {
        OpenDocument {
            id: self.id,
            uri: uri.to_string(),
            language_id: self.language_id.clone(),
            version: self.version,
            text: Arc::clone(&self.text),
            synced_text: Arc::clone(&self.synced_text),
            pending: self.pending.clone(),
            holders: self.holders,
        }
    }

    fn acquire(&mut self) {
        self.holders += 1;
    }

    fn release(&mut self) -> bool {
        self.holders = self.holders.saturating_sub(1);
        self.holders == 0
    }
}

/// Workspace keeping documents in a flat map keyed by uri.
///
/// All edits go through one lock, so concurrent holders are serialized into
/// a single ordered batch per document.
pub struct MemoryWorkspace {
    policy: HolderPolicy,
    docs: Mutex<HashMap<String, DocumentState>>,
    next_id: AtomicU64,
    display: Option<DisplayHook>,
}

impl Default for MemoryWorkspace {
    fn default() -> Self {
        Self::new(HolderPolicy::default())
    }
}

impl MemoryWorkspace {
    pub fn new(policy: HolderPolicy) -> Self {
        Self {
            policy,
            docs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            display: None,
        }
    }

    /// Route `display_file` to the host
    pub fn with_display_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.display = Some(Box::new(hook));
        self
    }

    pub fn policy(&self) -> HolderPolicy {
        self.policy
    }

    /// Replace the whole text of a document
    pub fn replace_text(&self, uri: &str, text: &str) -> Result<(), WorkspaceError> {
        let len = self
            .get_file(uri)
            .map(|doc| doc.text.len())
            .ok_or_else(|| WorkspaceError::NotOpen(uri.to_string()))?;
        self.update_file(uri, &[TextChange::new(0, len, text)])
    }
}

impl Workspace for MemoryWorkspace {
    fn get_file(&self, uri: &str) -> Option<OpenDocument> {
        lock(&self.docs).get(uri).map(|state| state.snapshot(uri))
    }

    fn files(&self) -> Vec<OpenDocument> {
        let docs = lock(&self.docs);
        let mut files: Vec<_> = docs.iter().map(|(uri, s)| s.snapshot(uri)).collect();
        files.sort_by(|a, b| a.uri.cmp(&b.uri));
        files
    }

    fn sync_files(&self) -> Vec<SyncedFile> {
        let mut docs = lock(&self.docs);
        let mut synced: Vec<_> = docs
            .iter_mut()
            .filter(|(_, state)| !state.pending.is_empty())
            .map(|(uri, state)| {
                let previous_version = state.version;
                let previous_text = std::mem::replace(&mut state.synced_text, Arc::clone(&state.text));
                state.version += 1;
                SyncedFile {
                    id: state.id,
                    uri: uri.clone(),
                    previous_version,
                    version: state.version,
                    previous_text,
                    text: Arc::clone(&state.text),
                    changes: std::mem::take(&mut state.pending),
                }
            })
            .collect();
        synced.sort_by(|a, b| a.uri.cmp(&b.uri));
        synced
    }

    fn open_file(
        &self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<OpenOutcome, WorkspaceError> {
        let mut docs = lock(&self.docs);
        if let Some(state) = docs.get_mut(uri) {
            return match self.policy {
                HolderPolicy::Exclusive => Err(WorkspaceError::AlreadyOpen(uri.to_string())),
                HolderPolicy::Shared => {
                    state.acquire();
                    Ok(OpenOutcome::Joined {
                        holders: state.holders,
                    })
                }
            };
        }

        let id = DocumentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = DocumentState::new(id, language_id, text);
        let snapshot = state.snapshot(uri);
        docs.insert(uri.to_string(), state);
        tracing::debug!("Opened {} as {:?}", uri, id);
        Ok(OpenOutcome::Opened(snapshot))
    }

    fn close_file(&self, uri: &str) -> Result<CloseOutcome, WorkspaceError> {
        let mut docs = lock(&self.docs);
        let state = docs
            .get_mut(uri)
            .ok_or_else(|| WorkspaceError::NotOpen(uri.to_string()))?;
        if state.release() {
            docs.remove(uri);
            tracing::debug!("Closed {}", uri);
            Ok(CloseOutcome::Closed)
        } else {
            Ok(CloseOutcome::Released {
                remaining: state.holders,
            })
        }
    }

    fn update_file(&self, uri: &str, changes: &[TextChange]) -> Result<(), WorkspaceError> {
        let mut docs = lock(&self.docs);
        let state = docs
            .get_mut(uri)
            .ok_or_else(|| WorkspaceError::NotOpen(uri.to_string()))?;

        let mut text = state.text.to_string();
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes.iter().filter(|c| !c.is_empty()) {
            apply_change(&mut text, change)
                .map_err(|reason| WorkspaceError::invalid_edit(uri, reason))?;
            applied.push(change.clone());
        }

        if !applied.is_empty() {
            state.text = Arc::from(text);
            state.pending.extend(applied);
        }
        Ok(())
    }

    fn display_file(&self, uri: &str) -> bool {
        match &self.display {
            Some(hook) => hook(uri),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(ws: &MemoryWorkspace, uri: &str, text: &str) {
        ws.open_file(uri, "plaintext", text).unwrap();
    }

    #[test]
    fn test_exclusive_policy_rejects_second_holder() {
        let ws = MemoryWorkspace::default();
        open(&ws, "file:///a.txt", "a");
        let err = ws.open_file("file:///a.txt", "plaintext", "a").unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyOpen(_)));
    }

    #[test]
    fn test_shared_policy_closes_with_last_holder() {
        let ws = MemoryWorkspace::new(HolderPolicy::Shared);
        open(&ws, "file:///a.txt", "a");
        let joined = ws.open_file("file:///a.txt", "plaintext", "ignored").unwrap();
        assert!(matches!(joined, OpenOutcome::Joined { holders: 2 }));

        assert_eq!(
            ws.close_file("file:///a.txt").unwrap(),
            CloseOutcome::Released { remaining: 1 }
        );
        assert_eq!(ws.close_file("file:///a.txt").unwrap(), CloseOutcome::Closed);
        assert!(ws.get_file("file:///a.txt").is_none());
        assert!(ws.close_file("file:///a.txt").is_err());
    }

    #[test]
    fn test_sync_files_takes_pending_and_bumps_version() {
        let ws = MemoryWorkspace::default();
        open(&ws, "file:///a.txt", "hello");
        open(&ws, "file:///b.txt", "untouched");

        ws.update_file("file:///a.txt", &[TextChange::insert(5, " world")])
            .unwrap();
        ws.update_file("file:///a.txt", &[TextChange::delete(0, 1)])
            .unwrap();

        let synced = ws.sync_files();
        assert_eq!(synced.len(), 1);
        let file = &synced[0];
        assert_eq!(file.uri, "file:///a.txt");
        assert_eq!(file.previous_version, 0);
        assert_eq!(file.version, 1);
        assert_eq!(&*file.previous_text, "hello");
        assert_eq!(&*file.text, "ello world");
        assert_eq!(file.changes.len(), 2);

        let doc = ws.get_file("file:///a.txt").unwrap();
        assert!(!doc.has_pending());
        assert_eq!(&*doc.synced_text, "ello world");

        assert!(ws.sync_files().is_empty());
        assert_eq!(ws.get_file("file:///a.txt").unwrap().version, 1);
    }

    #[test]
    fn test_invalid_batch_is_rejected_whole() {
        let ws = MemoryWorkspace::default();
        open(&ws, "file:///a.txt", "abc");
        let err = ws
            .update_file(
                "file:///a.txt",
                &[TextChange::insert(0, "x"), TextChange::delete(2, 10)],
            )
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidEdit { .. }));

        let doc = ws.get_file("file:///a.txt").unwrap();
        assert_eq!(&*doc.text, "abc");
        assert!(!doc.has_pending());
    }

    #[test]
    fn test_empty_changes_are_not_pending() {
        let ws = MemoryWorkspace::default();
        open(&ws, "file:///a.txt", "abc");
        ws.update_file("file:///a.txt", &[TextChange::insert(1, "")])
            .unwrap();
        assert!(ws.sync_files().is_empty());
    }

    #[test]
    fn test_reopen_gets_new_id() {
        let ws = MemoryWorkspace::default();
        open(&ws, "file:///a.txt", "abc");
        let first = ws.get_file("file:///a.txt").unwrap().id;
        ws.close_file("file:///a.txt").unwrap();
        open(&ws, "file:///a.txt", "abc");
        assert_ne!(ws.get_file("file:///a.txt").unwrap().id, first);
    }

    #[test]
    fn test_replace_text_and_display_hook() {
        let ws = MemoryWorkspace::default().with_display_hook(|uri| uri.ends_with(".txt"));
        open(&ws, "file:///a.txt", "old");
        ws.replace_text("file:///a.txt", "new text").unwrap();
        assert_eq!(&*ws.get_file("file:///a.txt").unwrap().text, "new text");
        assert!(ws.display_file("file:///a.txt"));
        assert!(!ws.display_file("file:///a.rs"));
        assert!(!MemoryWorkspace::default().display_file("file:///a.txt"));
    }
}
