//! CLI module for Tether
//!
//! Provides command-line interface using clap derive macros.

pub mod commands;
pub mod output;
pub mod response;

pub use output::OutputContext;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::{probe::ProbeArgs, request::RequestArgs};

const LONG_ABOUT: &str = r#"
Tether - drive a language server from the command line

Tether starts a language server over stdio, performs the initialize
handshake and talks to it through the same client core a host editor would
use: request ids, timeouts, document sync and position mapping included.

EXAMPLES:
  tether probe --server rust-analyzer
  tether probe --server typescript-language-server -- --stdio
  tether request --server clangd --file src/main.c --method textDocument/hover --line 9 --character 4
  tether request --server rust-analyzer --file src/lib.rs --method textDocument/formatting

Positions are zero-based, as on the wire. Output is JSON.
"#;

/// Tether - LSP client multiplexer
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = LONG_ABOUT)]
#[command(propagate_version = true)]
#[command(after_help = "Use 'tether <COMMAND> --help' for more information about a command.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to <config_dir>/tether/config.toml)
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose output (show debug info)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a server and report what it supports
    Probe(ProbeArgs),

    /// Open a file and send one request about it
    Request(RequestArgs),
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_request_with_server_args() {
        let cli = Cli::try_parse_from([
            "tether",
            "request",
            "--server",
            "typescript-language-server",
            "--file",
            "src/app.ts",
            "--method",
            "textDocument/hover",
            "--line",
            "3",
            "--character",
            "7",
            "--",
            "--stdio",
        ])
        .unwrap();

        let Commands::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.server.server, "typescript-language-server");
        assert_eq!(args.server.server_args, vec!["--stdio".to_string()]);
        assert_eq!(args.line, Some(3));
        assert_eq!(args.character, Some(7));
    }

    #[test]
    fn test_line_requires_character() {
        let result = Cli::try_parse_from([
            "tether",
            "request",
            "--server",
            "clangd",
            "--file",
            "a.c",
            "--method",
            "textDocument/hover",
            "--line",
            "1",
        ]);
        assert!(result.is_err());
    }
}
