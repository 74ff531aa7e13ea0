//! Offset conversion between UTF-8 byte offsets and LSP positions
//!
//! LSP columns count UTF-16 code units. Out-of-range input is clamped the
//! way the protocol asks: a column past the end of its line means the end of
//! the line, a line past the end of the document means the end of the text.

use super::lsp::{Position, TextChange};

/// Byte offset of `pos` in `text`
pub fn offset_at(text: &str, pos: Position) -> usize {
    let Some(line_start) = line_start(text, pos.line) else {
        return text.len();
    };

    let rest = &text[line_start..];
    let line = match rest.find('\n') {
        Some(end) => rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]),
        None => rest,
    };

    let mut units = 0u32;
    for (idx, ch) in line.char_indices() {
        let width = ch.len_utf16() as u32;
        if units + width > pos.character {
            return line_start + idx;
        }
        units += width;
    }
    line_start + line.len()
}

/// LSP position of byte offset `offset` in `text`
pub fn position_at(text: &str, offset: usize) -> Position {
    let offset = floor_char_boundary(text, offset);
    let before = &text[..offset];
    let line = before.matches('\n').count() as u32;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let character = before[line_start..]
        .chars()
        .map(|c| c.len_utf16() as u32)
        .sum();
    Position { line, character }
}

/// Apply one change, validating bounds and char boundaries
pub fn apply_change(text: &mut String, change: &TextChange) -> Result<(), String> {
    if change.from > change.to {
        return Err(format!("inverted range {}..{}", change.from, change.to));
    }
    if change.to > text.len() {
        return Err(format!(
            "range {}..{} exceeds document length {}",
            change.from,
            change.to,
            text.len()
        ));
    }
    if !text.is_char_boundary(change.from) || !text.is_char_boundary(change.to) {
        return Err(format!(
            "range {}..{} splits a character",
            change.from, change.to
        ));
    }
    text.replace_range(change.from..change.to, &change.insert);
    Ok(())
}

fn line_start(text: &str, line: u32) -> Option<usize> {
    if line == 0 {
        return Some(0);
    }
    text.match_indices('\n')
        .nth(line as usize - 1)
        .map(|(idx, _)| idx + 1)
}

fn floor_char_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_and_position_agree() {
        let text = "1\n2\n3";
        assert_eq!(offset_at(text, Position::new(2, 0)), 4);
        assert_eq!(position_at(text, 4), Position::new(2, 0));
        assert_eq!(position_at(text, 1), Position::new(0, 1));
        assert_eq!(position_at(text, 2), Position::new(1, 0));
    }

    #[test]
    fn test_out_of_range_positions_clamp() {
        let text = "ab\ncd";
        assert_eq!(offset_at(text, Position::new(0, 10)), 2);
        assert_eq!(offset_at(text, Position::new(5, 0)), text.len());
        assert_eq!(position_at(text, 99), Position::new(1, 2));
    }

    #[test]
    fn test_crlf_line_end_excluded() {
        let text = "ab\r\ncd";
        assert_eq!(offset_at(text, Position::new(0, 5)), 2);
        assert_eq!(offset_at(text, Position::new(1, 1)), 5);
    }

    #[test]
    fn test_utf16_columns() {
        // 'é' is 2 bytes / 1 unit, '😀' is 4 bytes / 2 units
        let text = "é😀x";
        assert_eq!(offset_at(text, Position::new(0, 1)), 2);
        assert_eq!(offset_at(text, Position::new(0, 3)), 6);
        assert_eq!(position_at(text, 6), Position::new(0, 3));
        // A column inside a surrogate pair lands on the character start
        assert_eq!(offset_at(text, Position::new(0, 2)), 2);
    }

    #[test]
    fn test_apply_change_validates() {
        let mut text = String::from("héllo");
        assert!(apply_change(&mut text, &TextChange::delete(1, 2)).is_err());
        assert!(apply_change(&mut text, &TextChange::delete(3, 9)).is_err());
        assert!(apply_change(&mut text, &TextChange::new(3, 1, "")).is_err());
        apply_change(&mut text, &TextChange::new(1, 3, "e")).unwrap();
        assert_eq!(text, "hello");
    }
}
