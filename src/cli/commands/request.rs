//! Request command implementation
//!
//! Open one file, send a mapped request about it and print the result.
//! Text edits in the result are also reported mapped onto the current text.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use serde_json::{Value, json};

use super::{ServerArgs, Session};
use crate::cli::OutputContext;
use crate::cli::response::RequestResponse;
use crate::config::ClientConfig;
use crate::infra::lsp::LspClient;
use crate::models::{TextChange, TextEdit, path_to_uri};

#[derive(Args, Debug)]
pub struct RequestArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    /// Document the request is about
    #[arg(long, short)]
    pub file: PathBuf,

    /// LSP method (e.g. textDocument/hover)
    #[arg(long, short)]
    pub method: String,

    /// Zero-based line of the position
    #[arg(long, requires = "character")]
    pub line: Option<u32>,

    /// Zero-based UTF-16 column of the position
    #[arg(long, requires = "line")]
    pub character: Option<u32>,

    /// Extra params as a JSON object, merged over the generated ones
    #[arg(long)]
    pub params: Option<String>,

    /// Language id for didOpen (guessed from the extension otherwise)
    #[arg(long)]
    pub language_id: Option<String>,
}

pub async fn execute(args: RequestArgs, config: ClientConfig) -> Result<()> {
    let file = args
        .file
        .canonicalize()
        .with_context(|| format!("File not found: {}", args.file.display()))?;
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let uri = path_to_uri(&file);
    let params = build_params(&uri, &args)?;
    let language_id = args
        .language_id
        .clone()
        .unwrap_or_else(|| language_id_for(&file).to_string());

    let session = Session::start(&args.server, config).await?;
    let ctx = OutputContext::new(session.root().to_path_buf());

    let outcome = send(&session.client, &uri, &language_id, &text, &args.method, params).await;
    session.finish().await;

    match outcome {
        Ok((result, edits)) => ctx.print_success_flat(RequestResponse {
            file: ctx.relative_path(&file),
            method: args.method,
            result,
            edits,
        }),
        Err(e) => ctx.print_error(&e.to_string()),
    }
    Ok(())
}

async fn send(
    client: &LspClient,
    uri: &str,
    language_id: &str,
    text: &str,
    method: &str,
    params: Value,
) -> Result<(Value, Option<Vec<TextChange>>)> {
    client.open_file(uri, language_id, text)?;
    let mapped = client.mapped_request::<Value>(method, Some(params)).await?;

    let edits = match serde_json::from_value::<Vec<TextEdit>>(mapped.value.clone()) {
        Ok(edits) if !edits.is_empty() => Some(mapped.mapping.map_edits(uri, &edits)?),
        _ => None,
    };
    Ok((mapped.value, edits))
}

/// `textDocument` plus the optional position, overlaid with `--params`
fn build_params(uri: &str, args: &RequestArgs) -> Result<Value> {
    let mut params = json!({ "textDocument": { "uri": uri } });
    if let (Some(line), Some(character)) = (args.line, args.character) {
        params["position"] = json!({ "line": line, "character": character });
    }
    if matches!(
        args.method.as_str(),
        "textDocument/formatting" | "textDocument/rangeFormatting" | "textDocument/onTypeFormatting"
    ) {
        params["options"] = json!({ "tabSize": 4, "insertSpaces": true });
    }

    if let Some(extra) = &args.params {
        let extra: Value = serde_json::from_str(extra).context("--params is not valid JSON")?;
        let Value::Object(extra) = extra else {
            bail!("--params must be a JSON object");
        };
        if let Some(target) = params.as_object_mut() {
            target.extend(extra);
        }
    }
    Ok(params)
}

fn language_id_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    match ext.as_str() {
        "rs" => "rust",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hxx" => "cpp",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "py" | "pyi" => "python",
        "rb" => "ruby",
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "lua" => "lua",
        "zig" => "zig",
        "sh" | "bash" => "shellscript",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "md" => "markdown",
        _ => "plaintext",
    }
}
