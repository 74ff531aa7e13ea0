//! Tether - LSP client multiplexer with document sync and workspace mapping
//!
//! Keeps one language server connection honest: requests are matched to
//! responses by id, time out from the moment they are sent, and can be
//! cancelled. Document edits are synced as `didOpen`/`didChange` and every
//! request can carry a mapping from the server's view of the workspace to
//! the current one.

pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod models;
pub mod workspace;

pub use config::ClientConfig;
pub use error::{LspError, TetherError, TetherResult};
pub use infra::lsp::{ConnectionState, LspClient, Mapped, RequestKey};
pub use workspace::{HolderPolicy, MemoryWorkspace, Workspace, WorkspaceMapping};
