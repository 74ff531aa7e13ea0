//! Composable positional transforms
//!
//! A [`ChangeDesc`] describes how a document of one length becomes a document
//! of another, without the inserted text. It is a run of sections covering the
//! whole old document: each section either keeps `n` bytes or replaces `del`
//! bytes with `ins` new ones. Two descriptions compose into one, which is how
//! a chain of sync batches collapses into a single old-offset -> new-offset map.

use thiserror::Error;

use crate::models::TextChange;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeError {
    #[error("change {from}..{to} is outside a document of length {len}")]
    OutOfBounds { from: usize, to: usize, len: usize },

    #[error("cannot compose a change producing {produced} bytes with one expecting {expected}")]
    LengthMismatch { produced: usize, expected: usize },
}

/// How [`ChangeDesc::map_pos`] treats a position touched by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapMode {
    /// Inside a replaced range, snap to its start. An insertion exactly at
    /// the position ends up after it.
    #[default]
    Before,
    /// Inside a replaced range, snap to the end of the replacement. An
    /// insertion exactly at the position ends up before it.
    After,
    /// Inside a replaced range the position has no counterpart: `None`.
    /// Insertions exactly at the position behave as in `Before`.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Keep(usize),
    Replace { del: usize, ins: usize },
}

/// One replaced region: `from_a..to_a` in the old document became
/// `from_b..to_b` in the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedRange {
    pub from_a: usize,
    pub to_a: usize,
    pub from_b: usize,
    pub to_b: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeDesc {
    sections: Vec<Section>,
}

impl ChangeDesc {
    /// The transform that changes nothing in a document of `len` bytes
    pub fn identity(len: usize) -> Self {
        let mut desc = Self::default();
        desc.push(Section::Keep(len));
        desc
    }

    /// Describe a single change applied to a document of `doc_len` bytes
    pub fn from_change(doc_len: usize, change: &TextChange) -> Result<Self, ChangeError> {
        if change.from > change.to || change.to > doc_len {
            return Err(ChangeError::OutOfBounds {
                from: change.from,
                to: change.to,
                len: doc_len,
            });
        }
        let mut desc = Self::default();
        desc.push(Section::Keep(change.from));
        desc.push(Section::Replace {
            del: change.to - change.from,
            ins: change.insert.len(),
        });
        desc.push(Section::Keep(doc_len - change.to));
        Ok(desc)
    }

    /// Describe a sequential batch of changes applied to a document of `doc_len` bytes
    pub fn from_changes(doc_len: usize, changes: &[TextChange]) -> Result<Self, ChangeError> {
        changes
            .iter()
            .try_fold(Self::identity(doc_len), |acc, change| {
                let step = Self::from_change(acc.new_len(), change)?;
                acc.compose(&step)
            })
    }

    /// Length of the document this applies to
    pub fn len(&self) -> usize {
        self.sections
            .iter()
            .map(|s| match *s {
                Section::Keep(n) => n,
                Section::Replace { del, .. } => del,
            })
            .sum()
    }

    /// Length of the document this produces
    pub fn new_len(&self) -> usize {
        self.sections
            .iter()
            .map(|s| match *s {
                Section::Keep(n) => n,
                Section::Replace { ins, .. } => ins,
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_identity(&self) -> bool {
        self.sections
            .iter()
            .all(|s| matches!(s, Section::Keep(_)))
    }

    /// `self` followed by `other`. `other` must apply to the document `self`
    /// produces.
    pub fn compose(&self, other: &ChangeDesc) -> Result<ChangeDesc, ChangeError> {
        if self.new_len() != other.len() {
            return Err(ChangeError::LengthMismatch {
                produced: self.new_len(),
                expected: other.len(),
            });
        }

        let mut out = ChangeDesc::default();
        let mut a = Cursor::new(&self.sections);
        let mut b = Cursor::new(&other.sections);

        loop {
            match (a.current, b.current) {
                (None, None) => break,
                // Deleted by `self`, never seen by `other`
                (Some(Section::Replace { del, ins: 0 }), _) => {
                    out.push(Section::Replace {
                        del: if a.partial { 0 } else { del },
                        ins: 0,
                    });
                    a.advance();
                }
                // Inserted by `other`, no counterpart in the old document
                (_, Some(Section::Replace { del: 0, ins })) => {
                    out.push(Section::Replace {
                        del: 0,
                        ins: if b.partial { 0 } else { ins },
                    });
                    b.advance();
                }
                (Some(sa), Some(sb)) => {
                    let a_out = match sa {
                        Section::Keep(n) => n,
                        Section::Replace { ins, .. } => ins,
                    };
                    let b_in = match sb {
                        Section::Keep(n) => n,
                        Section::Replace { del, .. } => del,
                    };
                    let len = a_out.min(b_in);

                    let section = match (sa, sb) {
                        (Section::Keep(_), Section::Keep(_)) => Section::Keep(len),
                        (Section::Keep(_), Section::Replace { ins, .. }) => Section::Replace {
                            del: len,
                            ins: if b.partial { 0 } else { ins },
                        },
                        (Section::Replace { del, .. }, Section::Keep(_)) => Section::Replace {
                            del: if a.partial { 0 } else { del },
                            ins: len,
                        },
                        (Section::Replace { del, .. }, Section::Replace { ins, .. }) => {
                            Section::Replace {
                                del: if a.partial { 0 } else { del },
                                ins: if b.partial { 0 } else { ins },
                            }
                        }
                    };
                    out.push(section);
                    a.consume_output(len);
                    b.consume_input(len);
                }
                // Lengths were checked above, so one side cannot run out early
                _ => {
                    return Err(ChangeError::LengthMismatch {
                        produced: self.new_len(),
                        expected: other.len(),
                    });
                }
            }
        }

        Ok(out)
    }

    /// Map an offset in the old document to the new one.
    ///
    /// Returns `None` for offsets past the end of the old document, and for
    /// offsets strictly inside a replaced range under [`MapMode::Strict`].
    pub fn map_pos(&self, pos: usize, mode: MapMode) -> Option<usize> {
        let mut pos_a = 0;
        let mut pos_b = 0;

        for section in &self.sections {
            match *section {
                Section::Keep(len) => {
                    if pos < pos_a + len {
                        return Some(pos_b + (pos - pos_a));
                    }
                    pos_a += len;
                    pos_b += len;
                }
                Section::Replace { del, ins } => {
                    let end_a = pos_a + del;
                    if pos == pos_a {
                        return Some(if del == 0 && mode == MapMode::After {
                            pos_b + ins
                        } else {
                            pos_b
                        });
                    }
                    if pos < end_a {
                        return match mode {
                            MapMode::Before => Some(pos_b),
                            MapMode::After => Some(pos_b + ins),
                            MapMode::Strict => None,
                        };
                    }
                    pos_a = end_a;
                    pos_b += ins;
                }
            }
        }

        (pos == pos_a).then_some(pos_b)
    }

    /// Whether any change overlaps the half-open range `from..to` of the old
    /// document. A replaced range `p..e` touches it iff `p < to && from < e`,
    /// so changes that merely abut the range do not count.
    pub fn touches_range(&self, from: usize, to: usize) -> bool {
        self.changed_ranges()
            .take_while(|r| r.from_a < to)
            .any(|r| from < r.to_a)
    }

    /// Replaced regions in document order
    pub fn changed_ranges(&self) -> impl Iterator<Item = ChangedRange> + '_ {
        let mut pos_a = 0;
        let mut pos_b = 0;
        self.sections.iter().filter_map(move |section| match *section {
            Section::Keep(len) => {
                pos_a += len;
                pos_b += len;
                None
            }
            Section::Replace { del, ins } => {
                let range = ChangedRange {
                    from_a: pos_a,
                    to_a: pos_a + del,
                    from_b: pos_b,
                    to_b: pos_b + ins,
                };
                pos_a += del;
                pos_b += ins;
                Some(range)
            }
        })
    }

    fn push(&mut self, section: Section) {
        if matches!(
            section,
            Section::Keep(0) | Section::Replace { del: 0, ins: 0 }
        ) {
            return;
        }
        match (self.sections.last_mut(), section) {
            (Some(Section::Keep(len)), Section::Keep(more)) => *len += more,
            (Some(Section::Replace { del, ins }), Section::Replace { del: d, ins: i }) => {
                *del += d;
                *ins += i;
            }
            _ => self.sections.push(section),
        }
    }
}

/// Walks the sections of one side of a composition. `partial` is set once
/// part of a replacement has been emitted, so its other side is not
/// counted twice.
struct Cursor<'a> {
    sections: &'a [Section],
    index: usize,
    current: Option<Section>,
    partial: bool,
}

impl<'a> Cursor<'a> {
    fn new(sections: &'a [Section]) -> Self {
        let mut cursor = Self {
            sections,
            index: 0,
            current: None,
            partial: false,
        };
        cursor.advance();
        cursor
    }

    fn advance(&mut self) {
        self.current = self.sections.get(self.index).copied();
        self.index += 1;
        self.partial = false;
    }

    /// Consume `len` bytes of what this section produces
    fn consume_output(&mut self, len: usize) {
        match self.current {
            Some(Section::Keep(n)) if n > len => self.current = Some(Section::Keep(n - len)),
            Some(Section::Replace { del, ins }) if ins > len => {
                self.current = Some(Section::Replace {
                    del,
                    ins: ins - len,
                });
                self.partial = true;
            }
            _ => self.advance(),
        }
    }

    /// Consume `len` bytes of what this section applies to
    fn consume_input(&mut self, len: usize) {
        match self.current {
            Some(Section::Keep(n)) if n > len => self.current = Some(Section::Keep(n - len)),
            Some(Section::Replace { del, ins }) if del > len => {
                self.current = Some(Section::Replace {
                    del: del - len,
                    ins,
                });
                self.partial = true;
            }
            _ => self.advance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::text::apply_change;

    fn desc(doc_len: usize, changes: &[TextChange]) -> ChangeDesc {
        ChangeDesc::from_changes(doc_len, changes).unwrap()
    }

    #[test]
    fn test_identity_maps_every_offset() {
        let id = ChangeDesc::identity(5);
        assert!(id.is_identity());
        for pos in 0..=5 {
            assert_eq!(id.map_pos(pos, MapMode::Strict), Some(pos));
        }
        assert_eq!(id.map_pos(6, MapMode::Before), None);
    }

    #[test]
    fn test_empty_document_identity() {
        let id = ChangeDesc::identity(0);
        assert!(id.is_empty());
        assert_eq!(id.map_pos(0, MapMode::Before), Some(0));
    }

    #[test]
    fn test_deletion_shifts_following_offsets() {
        // "1\n2\n3" -> "1\n3"
        let d = desc(5, &[TextChange::delete(1, 3)]);
        assert_eq!(d.len(), 5);
        assert_eq!(d.new_len(), 3);
        assert_eq!(d.map_pos(0, MapMode::Strict), Some(0));
        assert_eq!(d.map_pos(4, MapMode::Strict), Some(2));
        assert_eq!(d.map_pos(5, MapMode::Strict), Some(3));
        // Start and end of a deleted range are outside it
        assert_eq!(d.map_pos(1, MapMode::Strict), Some(1));
        assert_eq!(d.map_pos(3, MapMode::Strict), Some(1));
    }

    #[test]
    fn test_map_modes_inside_replacement() {
        // "abcdef" -> "aXYZef"
        let d = desc(6, &[TextChange::new(1, 4, "XYZ")]);
        assert_eq!(d.map_pos(2, MapMode::Before), Some(1));
        assert_eq!(d.map_pos(2, MapMode::After), Some(4));
        assert_eq!(d.map_pos(2, MapMode::Strict), None);
    }

    #[test]
    fn test_insertion_at_position_respects_bias() {
        let d = desc(4, &[TextChange::insert(2, "++")]);
        assert_eq!(d.map_pos(2, MapMode::Before), Some(2));
        assert_eq!(d.map_pos(2, MapMode::Strict), Some(2));
        assert_eq!(d.map_pos(2, MapMode::After), Some(4));
        assert_eq!(d.map_pos(3, MapMode::Before), Some(5));
    }

    #[test]
    fn test_compose_is_sequential_not_additive() {
        // "hello world": delete "hello " then insert "big " at offset 0 of the result
        let first = desc(11, &[TextChange::delete(0, 6)]);
        let second = desc(5, &[TextChange::insert(0, "big ")]);
        let composed = first.compose(&second).unwrap();
        assert_eq!(composed.len(), 11);
        assert_eq!(composed.new_len(), 9);
        // 'w' at 6 survives and lands after "big "
        assert_eq!(composed.map_pos(6, MapMode::After), Some(4));
        assert_eq!(composed.map_pos(10, MapMode::Strict), Some(8));
    }

    #[test]
    fn test_compose_edit_inside_inserted_text() {
        let first = desc(4, &[TextChange::insert(2, "abcdef")]);
        let second = desc(10, &[TextChange::delete(3, 5)]);
        let composed = first.compose(&second).unwrap();
        assert_eq!(composed.new_len(), 8);
        let ranges: Vec<_> = composed.changed_ranges().collect();
        assert_eq!(
            ranges,
            vec![ChangedRange {
                from_a: 2,
                to_a: 2,
                from_b: 2,
                to_b: 6
            }]
        );
        assert_eq!(composed.map_pos(3, MapMode::Strict), Some(7));
    }

    #[test]
    fn test_compose_rejects_length_mismatch() {
        let first = desc(4, &[TextChange::insert(0, "x")]);
        let second = ChangeDesc::identity(4);
        assert_eq!(
            first.compose(&second),
            Err(ChangeError::LengthMismatch {
                produced: 5,
                expected: 4
            })
        );
    }

    #[test]
    fn test_from_change_rejects_out_of_bounds() {
        assert!(ChangeDesc::from_change(3, &TextChange::delete(2, 4)).is_err());
        assert!(ChangeDesc::from_change(3, &TextChange::new(2, 1, "")).is_err());
    }

    #[test]
    fn test_touches_range_half_open() {
        // Replace 4..6
        let d = desc(10, &[TextChange::new(4, 6, "zz")]);
        assert!(d.touches_range(5, 8));
        assert!(d.touches_range(0, 5));
        assert!(d.touches_range(3, 7));
        assert!(d.touches_range(5, 5));
        // Adjacent on either side
        assert!(!d.touches_range(0, 4));
        assert!(!d.touches_range(6, 9));
        assert!(!d.touches_range(4, 4));
        assert!(!d.touches_range(8, 10));
    }

    #[test]
    fn test_touches_range_insertion() {
        let d = desc(10, &[TextChange::insert(5, "x")]);
        assert!(d.touches_range(3, 7));
        assert!(!d.touches_range(5, 7));
        assert!(!d.touches_range(3, 5));
        assert!(!d.touches_range(5, 5));
    }

    #[test]
    fn test_untouched_document_reports_no_touch() {
        assert!(!ChangeDesc::identity(10).touches_range(0, 10));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum EditOp {
            Insert { position: usize, text: String },
            Delete { position: usize, length: usize },
            Replace { position: usize, length: usize, text: String },
        }

        fn arb_edit_op() -> impl Strategy<Value = EditOp> {
            prop_oneof![
                (0..200usize, "[a-z]{1,8}")
                    .prop_map(|(position, text)| EditOp::Insert { position, text }),
                (0..200usize, 1..20usize)
                    .prop_map(|(position, length)| EditOp::Delete { position, length }),
                (0..200usize, 1..20usize, "[A-Z]{0,8}").prop_map(|(position, length, text)| {
                    EditOp::Replace {
                        position,
                        length,
                        text,
                    }
                }),
            ]
        }

        fn to_change(op: &EditOp, len: usize) -> TextChange {
            match op {
                EditOp::Insert { position, text } => TextChange::insert((*position).min(len), text.clone()),
                EditOp::Delete { position, length } => {
                    let from = (*position).min(len);
                    TextChange::delete(from, (from + length).min(len))
                }
                EditOp::Replace {
                    position,
                    length,
                    text,
                } => {
                    let from = (*position).min(len);
                    TextChange::new(from, (from + length).min(len), text.clone())
                }
            }
        }

        proptest! {
            /// Every byte that survives the edits is found where the mapping says
            #[test]
            fn prop_surviving_bytes_map_exactly(
                initial in "[0-9]{0,120}",
                ops in prop::collection::vec(arb_edit_op(), 0..15)
            ) {
                let mut text = initial.clone();
                let mut tracked: Vec<Option<usize>> = (0..initial.len()).map(Some).collect();
                let mut changes = Vec::new();

                for op in &ops {
                    let change = to_change(op, text.len());
                    let delta = change.insert.len() as isize - (change.to - change.from) as isize;
                    for slot in tracked.iter_mut() {
                        if let Some(at) = *slot {
                            if at >= change.to {
                                *slot = Some((at as isize + delta) as usize);
                            } else if at >= change.from {
                                *slot = None;
                            }
                        }
                    }
                    apply_change(&mut text, &change).unwrap();
                    changes.push(change);
                }

                let d = ChangeDesc::from_changes(initial.len(), &changes).unwrap();
                prop_assert_eq!(d.len(), initial.len());
                prop_assert_eq!(d.new_len(), text.len());

                for (original, slot) in tracked.iter().enumerate() {
                    if let Some(expected) = *slot {
                        prop_assert_eq!(d.map_pos(original, MapMode::After), Some(expected));
                        prop_assert_eq!(&text[expected..expected + 1], &initial[original..original + 1]);
                    }
                }
                prop_assert_eq!(d.map_pos(initial.len(), MapMode::After), Some(text.len()));
            }
        }
    }
}
