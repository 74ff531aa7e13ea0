//! Infrastructure layer for Tether
//!
//! Contains the language server plumbing and shared async helpers.

pub mod lsp;
pub mod retry;
