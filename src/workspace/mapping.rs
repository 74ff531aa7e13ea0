//! Position mapping across edits
//!
//! A [`WorkspaceMapping`] remembers the synced version of every open document
//! at the moment it was created. Any time later it can translate offsets from
//! that baseline into the current text, including edits that were synced
//! since and edits still pending. Queries are computed lazily from the edit
//! history; dropping the mapping lets the history be trimmed.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use super::changes::{ChangeDesc, MapMode};
use super::history::{EditHistory, ScopeId};
use super::{DocumentId, SyncedFile, Workspace, lock};
use crate::error::WorkspaceError;
use crate::models::text::offset_at;
use crate::models::{Position, TextChange, TextEdit};

#[derive(Debug, Clone)]
struct Baseline {
    id: DocumentId,
    version: u64,
    text: Arc<str>,
}

pub struct WorkspaceMapping {
    scope: Option<ScopeId>,
    baseline: HashMap<String, Baseline>,
    history: Arc<Mutex<EditHistory>>,
    workspace: Arc<dyn Workspace>,
}

impl WorkspaceMapping {
    /// Capture the synced version of every open document
    pub fn new(history: Arc<Mutex<EditHistory>>, workspace: Arc<dyn Workspace>) -> Self {
        let mut guard = lock(&history);
        let baseline: HashMap<String, Baseline> = workspace
            .files()
            .into_iter()
            .map(|doc| {
                let base = Baseline {
                    id: doc.id,
                    version: doc.version,
                    text: doc.synced_text,
                };
                (doc.uri, base)
            })
            .collect();
        let scope = guard.open_scope(
            baseline
                .iter()
                .map(|(uri, base)| (uri.clone(), base.version)),
        );
        drop(guard);

        Self {
            scope: Some(scope),
            baseline,
            history,
            workspace,
        }
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.baseline.keys().map(String::as_str)
    }

    pub fn baseline_version(&self, uri: &str) -> Option<u64> {
        self.baseline.get(uri).map(|b| b.version)
    }

    /// Text of `uri` as of the baseline version
    pub fn baseline_text(&self, uri: &str) -> Option<&str> {
        self.baseline.get(uri).map(|b| &*b.text)
    }

    /// Every change made to `uri` since the baseline, synced or not
    pub fn changes(&self, uri: &str) -> Result<ChangeDesc, WorkspaceError> {
        let base = self.base(uri)?;

        let history = lock(&self.history);
        let doc = self
            .workspace
            .get_file(uri)
            .filter(|doc| doc.id == base.id)
            .ok_or_else(|| WorkspaceError::DocumentClosed(uri.to_string()))?;
        let synced = history.chain(uri, base.version, doc.version, base.text.len())?;
        drop(history);

        let live = ChangeDesc::from_changes(doc.synced_text.len(), &doc.pending)?;
        Ok(synced.compose(&live)?)
    }

    /// Map a baseline byte offset into the current text.
    ///
    /// `None` means the offset was deleted and `mode` is [`MapMode::Strict`].
    pub fn map_pos(
        &self,
        uri: &str,
        offset: usize,
        mode: MapMode,
    ) -> Result<Option<usize>, WorkspaceError> {
        let len = self.base(uri)?.text.len();
        if offset > len {
            return Err(WorkspaceError::PositionOutOfRange {
                uri: uri.to_string(),
                offset,
                len,
            });
        }
        Ok(self.changes(uri)?.map_pos(offset, mode))
    }

    /// Map an LSP position expressed against the baseline text
    pub fn map_position(
        &self,
        uri: &str,
        pos: Position,
        mode: MapMode,
    ) -> Result<Option<usize>, WorkspaceError> {
        let offset = offset_at(&self.base(uri)?.text, pos);
        self.map_pos(uri, offset, mode)
    }

    /// Whether any change since the baseline overlaps `from..to`
    pub fn touches_range(&self, uri: &str, from: usize, to: usize) -> Result<bool, WorkspaceError> {
        Ok(self.changes(uri)?.touches_range(from, to))
    }

    /// Map a baseline range whose content must still be intact.
    ///
    /// Returns `None` when a change since the baseline overlaps the range.
    pub fn map_range(
        &self,
        uri: &str,
        from: usize,
        to: usize,
    ) -> Result<Option<Range<usize>>, WorkspaceError> {
        let len = self.base(uri)?.text.len();
        if from > to || to > len {
            return Err(WorkspaceError::PositionOutOfRange {
                uri: uri.to_string(),
                offset: from.max(to),
                len,
            });
        }
        let desc = self.changes(uri)?;
        Ok(map_untouched(&desc, from, to))
    }

    /// Translate server edits computed against the baseline into local
    /// changes against the current text.
    ///
    /// Edits whose range was changed locally since are dropped. The result is
    /// ordered back to front so it can be applied as one sequential batch.
    pub fn map_edits(&self, uri: &str, edits: &[TextEdit]) -> Result<Vec<TextChange>, WorkspaceError> {
        let text = Arc::clone(&self.base(uri)?.text);
        let desc = self.changes(uri)?;

        let mut changes = Vec::with_capacity(edits.len());
        for edit in edits {
            let from = offset_at(&text, edit.range.start);
            let to = offset_at(&text, edit.range.end);
            if from > to {
                return Err(WorkspaceError::invalid_edit(
                    uri,
                    format!("inverted range {}..{}", from, to),
                ));
            }
            match map_untouched(&desc, from, to) {
                Some(range) => changes.push(TextChange::new(range.start, range.end, edit.new_text.clone())),
                None => tracing::debug!("Skipping edit at {}..{} in {}: changed locally", from, to, uri),
            }
        }
        changes.sort_by(|a, b| b.from.cmp(&a.from).then(b.to.cmp(&a.to)));
        Ok(changes)
    }

    /// Give up the baseline; same as dropping the mapping
    pub fn release(self) {}

    fn base(&self, uri: &str) -> Result<&Baseline, WorkspaceError> {
        self.baseline
            .get(uri)
            .ok_or_else(|| WorkspaceError::UnknownDocument(uri.to_string()))
    }
}

fn map_untouched(desc: &ChangeDesc, from: usize, to: usize) -> Option<Range<usize>> {
    if desc.touches_range(from, to) {
        return None;
    }
    let start = desc.map_pos(from, MapMode::After)?;
    let end = desc.map_pos(to, MapMode::Before)?;
    Some(start..end.max(start))
}

impl Drop for WorkspaceMapping {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            lock(&self.history).release_scope(scope);
        }
    }
}

impl fmt::Debug for WorkspaceMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceMapping")
            .field("scope", &self.scope)
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}

/// Take the workspace's pending batches and record them for live mappings.
///
/// The history lock is held across the workspace sync so a mapping created
/// concurrently sees either the old version with no entry or the new version
/// with its entry.
pub(crate) fn sync_recorded(history: &Mutex<EditHistory>, workspace: &dyn Workspace) -> Vec<SyncedFile> {
    let mut history = lock(history);
    let synced = workspace.sync_files();
    for file in &synced {
        if let Err(e) = history.record_synced(file) {
            tracing::warn!("Dropping edit history for {}: {}", file.uri, e);
            history.forget(&file.uri);
        }
    }
    synced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::text::apply_change;
    use crate::models::{Position, Range as LspRange};
    use crate::workspace::MemoryWorkspace;

    const URI: &str = "file:///doc.txt";

    struct Fixture {
        workspace: Arc<MemoryWorkspace>,
        history: Arc<Mutex<EditHistory>>,
    }

    impl Fixture {
        fn new(text: &str) -> Self {
            let workspace = Arc::new(MemoryWorkspace::default());
            workspace.open_file(URI, "plaintext", text).unwrap();
            Self {
                workspace,
                history: Arc::new(Mutex::new(EditHistory::new())),
            }
        }

        fn mapping(&self) -> WorkspaceMapping {
            let workspace: Arc<dyn Workspace> = self.workspace.clone();
            WorkspaceMapping::new(Arc::clone(&self.history), workspace)
        }

        fn edit(&self, change: TextChange) {
            self.workspace.update_file(URI, &[change]).unwrap();
        }

        fn sync(&self) {
            sync_recorded(&self.history, self.workspace.as_ref());
        }

        fn retained(&self) -> usize {
            lock(&self.history).retained(URI)
        }
    }

    #[test]
    fn test_pending_edits_are_mapped_without_sync() {
        let fx = Fixture::new("hello world");
        let mapping = fx.mapping();
        fx.edit(TextChange::insert(0, ">> "));

        assert_eq!(mapping.map_pos(URI, 6, MapMode::After).unwrap(), Some(9));
        assert_eq!(mapping.baseline_version(URI), Some(0));
        assert_eq!(mapping.baseline_text(URI), Some("hello world"));
    }

    #[test]
    fn test_mapping_spans_syncs_and_releases_history() {
        let fx = Fixture::new("abcdef");
        let mapping = fx.mapping();

        fx.edit(TextChange::delete(0, 2)); // "cdef"
        fx.sync();
        fx.edit(TextChange::insert(4, "gh")); // "cdefgh"
        fx.sync();
        fx.edit(TextChange::insert(0, "_")); // "_cdefgh", pending

        assert_eq!(fx.retained(), 2);
        assert_eq!(mapping.map_pos(URI, 3, MapMode::Before).unwrap(), Some(2));
        assert_eq!(mapping.map_pos(URI, 1, MapMode::Strict).unwrap(), None);
        assert_eq!(mapping.map_pos(URI, 6, MapMode::Before).unwrap(), Some(5));
        assert_eq!(mapping.map_pos(URI, 6, MapMode::After).unwrap(), Some(7));
        assert!(mapping.touches_range(URI, 0, 3).unwrap());
        assert!(!mapping.touches_range(URI, 2, 5).unwrap());

        mapping.release();
        assert_eq!(fx.retained(), 0);
        fx.sync();
        assert_eq!(fx.retained(), 0);
    }

    #[test]
    fn test_overlapping_mappings_keep_what_the_other_needs() {
        let fx = Fixture::new("0123456789");
        let first = fx.mapping();
        fx.edit(TextChange::insert(0, "ab"));
        fx.sync();
        let second = fx.mapping();
        fx.edit(TextChange::delete(0, 1));
        fx.sync();

        drop(first);
        assert_eq!(fx.retained(), 1);
        assert_eq!(second.baseline_version(URI), Some(1));
        assert_eq!(second.map_pos(URI, 2, MapMode::Before).unwrap(), Some(1));

        drop(second);
        assert_eq!(fx.retained(), 0);
    }

    #[test]
    fn test_closed_unknown_and_lost_documents() {
        let fx = Fixture::new("text");
        let mapping = fx.mapping();

        fx.workspace.open_file("file:///later.txt", "plaintext", "x").unwrap();
        assert!(matches!(
            mapping.map_pos("file:///later.txt", 0, MapMode::Before),
            Err(WorkspaceError::UnknownDocument(_))
        ));
        assert!(matches!(
            mapping.map_pos(URI, 5, MapMode::Before),
            Err(WorkspaceError::PositionOutOfRange { len: 4, .. })
        ));

        fx.edit(TextChange::insert(0, "x"));
        fx.sync();
        lock(&fx.history).forget(URI);
        assert!(matches!(
            mapping.changes(URI),
            Err(WorkspaceError::MappingUnavailable { version: 0, .. })
        ));

        fx.workspace.close_file(URI).unwrap();
        fx.workspace.open_file(URI, "plaintext", "text").unwrap();
        assert!(matches!(
            mapping.changes(URI),
            Err(WorkspaceError::DocumentClosed(_))
        ));
    }

    #[test]
    fn test_map_edits_drops_locally_changed_ranges() {
        let fx = Fixture::new("1\n2\n3");
        let mapping = fx.mapping();
        fx.edit(TextChange::insert(0, "0\n")); // "0\n1\n2\n3"
        fx.edit(TextChange::new(4, 5, "two")); // "0\n1\ntwo\n3"

        let edit = |line, text: &str| TextEdit {
            range: LspRange::new(Position::new(line, 0), Position::new(line, 1)),
            new_text: text.to_string(),
        };
        let changes = mapping
            .map_edits(URI, &[edit(0, "one"), edit(1, "deux"), edit(2, "three")])
            .unwrap();
        assert_eq!(
            changes,
            vec![TextChange::new(8, 9, "three"), TextChange::new(2, 3, "one")]
        );

        let mut text = fx.workspace.get_file(URI).unwrap().text.to_string();
        for change in &changes {
            apply_change(&mut text, change).unwrap();
        }
        assert_eq!(text, "0\none\ntwo\nthree");
    }

    #[test]
    fn test_map_range_boundaries() {
        let fx = Fixture::new("abcdef");
        let mapping = fx.mapping();
        fx.edit(TextChange::insert(2, "XX")); // "abXXcdef"

        assert_eq!(mapping.map_range(URI, 2, 4).unwrap(), Some(4..6));
        assert_eq!(mapping.map_range(URI, 0, 2).unwrap(), Some(0..2));
        assert_eq!(mapping.map_range(URI, 1, 3).unwrap(), None);
        assert!(mapping.map_range(URI, 4, 2).is_err());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Insert { at: usize, text: String },
            Delete { at: usize, len: usize },
            Sync,
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..64, "[a-z]{1,6}").prop_map(|(at, text)| Op::Insert { at, text }),
                (0usize..64, 1usize..6).prop_map(|(at, len)| Op::Delete { at, len }),
                Just(Op::Sync),
            ]
        }

        proptest! {
            #[test]
            fn prop_surviving_bytes_map_across_syncs(
                initial in "[0-9]{1,24}",
                ops in prop::collection::vec(op_strategy(), 0..24),
            ) {
                let fx = Fixture::new(&initial);
                let mapping = fx.mapping();
                let mut text = initial.clone();
                // Current offset of every original byte, None once deleted
                let mut tracked: Vec<Option<usize>> = (0..initial.len()).map(Some).collect();

                for op in &ops {
                    let change = match op {
                        Op::Sync => {
                            fx.sync();
                            continue;
                        }
                        Op::Insert { at, text: ins } => TextChange::insert((*at).min(text.len()), ins.clone()),
                        Op::Delete { at, len } => {
                            let from = (*at).min(text.len());
                            TextChange::delete(from, (from + len).min(text.len()))
                        }
                    };
                    apply_change(&mut text, &change).unwrap();
                    fx.edit(change.clone());
                    let delta = change.insert.len() as isize - (change.to - change.from) as isize;
                    for slot in tracked.iter_mut() {
                        if let Some(pos) = *slot {
                            if pos >= change.from && pos < change.to {
                                *slot = None;
                            } else if pos >= change.to {
                                *slot = Some((pos as isize + delta) as usize);
                            }
                        }
                    }
                }

                prop_assert_eq!(&*fx.workspace.get_file(URI).unwrap().text, text.as_str());
                for (original, current) in tracked.iter().enumerate() {
                    if let Some(expected) = current {
                        prop_assert_eq!(
                            mapping.map_pos(URI, original, MapMode::After).unwrap(),
                            Some(*expected)
                        );
                    }
                }
                prop_assert_eq!(
                    mapping.map_pos(URI, initial.len(), MapMode::After).unwrap(),
                    Some(text.len())
                );
            }
        }
    }
}
