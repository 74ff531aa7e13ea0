//! Per-document history of synced edit batches
//!
//! Every batch pushed to the server by a sync is kept here, keyed by the
//! version it applied to, for as long as some live mapping scope may need to
//! replay it. Scopes register a baseline version per uri; the lowest live
//! baseline of a uri is its watermark, and entries older than the watermark
//! are trimmed whenever a scope is released.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::SyncedFile;
use super::changes::ChangeDesc;
use crate::error::WorkspaceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

#[derive(Debug, Clone)]
struct HistoryEntry {
    /// Version the batch applied to; the batch produced `version + 1`
    version: u64,
    changes: ChangeDesc,
}

#[derive(Debug, Default)]
pub struct EditHistory {
    entries: HashMap<String, VecDeque<HistoryEntry>>,
    scopes: HashMap<ScopeId, HashMap<String, u64>>,
    /// uri -> baseline version -> number of live scopes holding it
    watermarks: HashMap<String, BTreeMap<u64, usize>>,
    next_scope: u64,
}

impl EditHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start retaining history from the given baseline versions
    pub fn open_scope<I>(&mut self, baseline: I) -> ScopeId
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let id = ScopeId(self.next_scope);
        self.next_scope += 1;

        let baseline: HashMap<String, u64> = baseline.into_iter().collect();
        for (uri, version) in &baseline {
            *self
                .watermarks
                .entry(uri.clone())
                .or_default()
                .entry(*version)
                .or_insert(0) += 1;
        }
        tracing::trace!("Opened mapping scope {:?} over {} documents", id, baseline.len());
        self.scopes.insert(id, baseline);
        id
    }

    /// Drop a scope and trim whatever no remaining scope needs
    pub fn release_scope(&mut self, id: ScopeId) {
        let Some(baseline) = self.scopes.remove(&id) else {
            return;
        };
        for (uri, version) in baseline {
            if let Some(marks) = self.watermarks.get_mut(&uri) {
                if let Some(count) = marks.get_mut(&version) {
                    *count -= 1;
                    if *count == 0 {
                        marks.remove(&version);
                    }
                }
                if marks.is_empty() {
                    self.watermarks.remove(&uri);
                }
            }
            self.trim(&uri);
        }
        tracing::trace!("Released mapping scope {:?}", id);
    }

    /// Record a synced batch. Kept only while a live scope needs it.
    pub fn record(&mut self, uri: &str, version: u64, changes: ChangeDesc) {
        if !self.watermark(uri).is_some_and(|min| min <= version) {
            return;
        }
        self.entries
            .entry(uri.to_string())
            .or_default()
            .push_back(HistoryEntry { version, changes });
    }

    /// Record the batch a sync pushed, if a live scope needs it
    pub fn record_synced(&mut self, file: &SyncedFile) -> Result<(), WorkspaceError> {
        if self.watermark(&file.uri).is_none() {
            return Ok(());
        }
        let changes = ChangeDesc::from_changes(file.previous_text.len(), &file.changes)?;
        self.record(&file.uri, file.previous_version, changes);
        Ok(())
    }

    /// Drop everything about a uri; called when the document closes
    pub fn forget(&mut self, uri: &str) {
        self.entries.remove(uri);
    }

    /// Lowest baseline version any live scope holds for `uri`
    pub fn watermark(&self, uri: &str) -> Option<u64> {
        self.watermarks
            .get(uri)
            .and_then(|marks| marks.keys().next().copied())
    }

    pub fn live_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Number of batches retained for `uri`
    pub fn retained(&self, uri: &str) -> usize {
        self.entries.get(uri).map_or(0, VecDeque::len)
    }

    /// Compose the batches taking `uri` from version `from` to `to`.
    ///
    /// `base_len` is the document length at `from`.
    pub fn chain(
        &self,
        uri: &str,
        from: u64,
        to: u64,
        base_len: usize,
    ) -> Result<ChangeDesc, WorkspaceError> {
        let unavailable = || WorkspaceError::MappingUnavailable {
            uri: uri.to_string(),
            version: from,
        };
        if from > to {
            return Err(unavailable());
        }

        let mut acc = ChangeDesc::identity(base_len);
        if from == to {
            return Ok(acc);
        }

        let entries = self.entries.get(uri).ok_or_else(unavailable)?;
        let mut expected = from;
        for entry in entries.iter().skip_while(|e| e.version < from) {
            if entry.version != expected {
                break;
            }
            acc = acc.compose(&entry.changes)?;
            expected += 1;
            if expected == to {
                return Ok(acc);
            }
        }
        Err(unavailable())
    }

    fn trim(&mut self, uri: &str) {
        match self.watermark(uri) {
            Some(min) => {
                if let Some(entries) = self.entries.get_mut(uri) {
                    while entries.front().is_some_and(|e| e.version < min) {
                        entries.pop_front();
                    }
                }
            }
            None => {
                self.entries.remove(uri);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextChange;
    use crate::workspace::MapMode;

    const URI: &str = "file:///a.txt";

    fn batch(len: usize, change: TextChange) -> ChangeDesc {
        ChangeDesc::from_change(len, &change).unwrap()
    }

    fn scope(history: &mut EditHistory, version: u64) -> ScopeId {
        history.open_scope([(URI.to_string(), version)])
    }

    #[test]
    fn test_nothing_recorded_without_scope() {
        let mut history = EditHistory::new();
        history.record(URI, 0, batch(3, TextChange::insert(0, "x")));
        assert_eq!(history.retained(URI), 0);
    }

    #[test]
    fn test_chain_composes_consecutive_batches() {
        let mut history = EditHistory::new();
        let id = scope(&mut history, 0);
        history.record(URI, 0, batch(3, TextChange::insert(0, "xx")));
        history.record(URI, 1, batch(5, TextChange::delete(4, 5)));

        let desc = history.chain(URI, 0, 2, 3).unwrap();
        assert_eq!(desc.len(), 3);
        assert_eq!(desc.new_len(), 4);
        assert_eq!(desc.map_pos(1, MapMode::Strict), Some(3));

        assert!(history.chain(URI, 0, 0, 3).unwrap().is_identity());
        assert!(history.chain(URI, 0, 3, 3).is_err());

        history.release_scope(id);
        assert_eq!(history.retained(URI), 0);
        assert!(matches!(
            history.chain(URI, 0, 2, 3),
            Err(WorkspaceError::MappingUnavailable { version: 0, .. })
        ));
    }

    #[test]
    fn test_overlapping_scopes_trim_to_lowest_baseline() {
        let mut history = EditHistory::new();
        let older = scope(&mut history, 0);
        history.record(URI, 0, batch(1, TextChange::insert(1, "a")));
        history.record(URI, 1, batch(2, TextChange::insert(2, "b")));
        let newer = scope(&mut history, 2);
        history.record(URI, 2, batch(3, TextChange::insert(3, "c")));

        assert_eq!(history.watermark(URI), Some(0));
        assert_eq!(history.retained(URI), 3);

        history.release_scope(older);
        assert_eq!(history.watermark(URI), Some(2));
        assert_eq!(history.retained(URI), 1);
        assert!(history.chain(URI, 2, 3, 3).is_ok());
        assert!(history.chain(URI, 0, 3, 1).is_err());

        history.release_scope(newer);
        assert_eq!(history.watermark(URI), None);
        assert_eq!(history.retained(URI), 0);
        assert_eq!(history.live_scopes(), 0);
    }

    #[test]
    fn test_shared_baseline_is_refcounted() {
        let mut history = EditHistory::new();
        let first = scope(&mut history, 0);
        let second = scope(&mut history, 0);
        history.record(URI, 0, batch(1, TextChange::insert(0, "a")));

        history.release_scope(first);
        assert_eq!(history.retained(URI), 1);
        history.release_scope(second);
        assert_eq!(history.retained(URI), 0);

        // Releasing twice is harmless
        history.release_scope(second);
    }

    #[test]
    fn test_forget_breaks_the_chain() {
        let mut history = EditHistory::new();
        let _id = scope(&mut history, 0);
        history.record(URI, 0, batch(1, TextChange::insert(0, "a")));
        history.forget(URI);
        assert!(history.chain(URI, 0, 1, 1).is_err());
    }
}
