//! Command implementations for Tether
//!
//! Each command is implemented in its own module; both drive a language
//! server child process through a [`Session`].

pub mod probe;
pub mod request;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use crate::config::ClientConfig;
use crate::infra::lsp::protocol::InitializeResult;
use crate::infra::lsp::{LspClient, StdioTransport};
use crate::models::path_to_uri;
use crate::workspace::{HolderPolicy, MemoryWorkspace};

/// How to start the language server
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Language server executable (e.g. rust-analyzer)
    #[arg(long, short = 's')]
    pub server: String,

    /// Workspace root (default: current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Request timeout in milliseconds (overrides the config file)
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Arguments passed to the server, after `--`
    #[arg(last = true)]
    pub server_args: Vec<String>,
}

/// Load `path`, or the global config when none is given
pub async fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = match path {
        Some(path) => ClientConfig::load(path).await,
        None => ClientConfig::load_default().await,
    };
    config.context("Failed to load config")
}

/// A connected client plus the server process behind it
pub struct Session {
    pub client: Arc<LspClient>,
    pub init: InitializeResult,
    process: Arc<StdioTransport>,
    root: PathBuf,
}

impl Session {
    /// Spawn the server in the workspace root and complete the handshake
    pub async fn start(args: &ServerArgs, mut config: ClientConfig) -> Result<Self> {
        let root = match &args.root {
            Some(root) => root.clone(),
            None => std::env::current_dir()?,
        };
        let root = root
            .canonicalize()
            .with_context(|| format!("Workspace root not found: {}", root.display()))?;

        if config.root_uri.is_none() {
            config.root_uri = Some(path_to_uri(&root));
        }
        if let Some(timeout_ms) = args.timeout_ms {
            config.timeout_ms = timeout_ms;
            config.validate()?;
        }

        let process = Arc::new(
            StdioTransport::spawn(&args.server, &args.server_args, Some(&root))
                .with_context(|| format!("Failed to start '{}'", args.server))?,
        );
        let workspace = Arc::new(MemoryWorkspace::new(HolderPolicy::Exclusive));
        let client = LspClient::new(config, workspace);

        let init = match client.connect(process.clone()).await {
            Ok(init) => init,
            Err(e) => {
                if let Err(kill_err) = process.kill().await {
                    tracing::debug!("Failed to kill '{}': {}", args.server, kill_err);
                }
                return Err(e).with_context(|| format!("'{}' failed to initialize", args.server));
            }
        };

        Ok(Self {
            client,
            init,
            process,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staged shutdown; the process is killed if it ignores `exit`
    pub async fn finish(self) {
        if let Err(e) = self.client.shutdown().await {
            tracing::debug!("Shutdown failed: {}", e);
        }
        if self.process.is_running().await
            && let Err(e) = self.process.kill().await
        {
            tracing::debug!("Failed to kill language server: {}", e);
        }
    }
}
