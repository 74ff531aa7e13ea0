//! LSP Common Types
//!
//! Wire-level coordinates plus the local edit type the workspace records.

use std::path::Path;

use serde::{Deserialize, Serialize};

// ============================================================================
// Core LSP Types
// ============================================================================

/// Position within a document (0-indexed, LSP standard, UTF-16 columns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Range within a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Convert a single position to a range
    pub fn point(pos: Position) -> Self {
        Self {
            start: pos,
            end: pos,
        }
    }
}

/// Text edit as sent by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

// ============================================================================
// Local Edit Types
// ============================================================================

/// A local replacement of `from..to` with `insert`.
///
/// Offsets are UTF-8 byte offsets into the document as it stands when the
/// change is applied. A batch of changes is sequential: each one is expressed
/// against the text produced by the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChange {
    pub from: usize,
    pub to: usize,
    pub insert: String,
}

impl TextChange {
    pub fn new(from: usize, to: usize, insert: impl Into<String>) -> Self {
        Self {
            from,
            to,
            insert: insert.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::new(at, at, text)
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Self::new(from, to, String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to && self.insert.is_empty()
    }
}

// ============================================================================
// URI Helpers
// ============================================================================

/// `file://` URI for `path`, resolved against the current directory
pub fn path_to_uri(path: &Path) -> String {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    let encoded: String = abs_path
        .to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '.' | '-' | '_' | '~' => c.to_string(),
            c if c.is_ascii_alphanumeric() => c.to_string(),
            c => {
                let mut buf = [0u8; 4];
                c.encode_utf8(&mut buf)
                    .bytes()
                    .map(|b| format!("%{:02X}", b))
                    .collect()
            }
        })
        .collect();

    format!("file://{encoded}")
}
