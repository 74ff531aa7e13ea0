//! Data models for Tether
//!
//! Coordinate and edit types shared by the protocol layer and the workspace.

pub mod lsp;
pub mod text;

pub use lsp::{Position, Range, TextChange, TextEdit, path_to_uri};
