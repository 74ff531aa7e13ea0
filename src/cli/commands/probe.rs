//! Probe command implementation
//!
//! Start a server, complete the handshake and report its capabilities.

use anyhow::Result;
use clap::Args;

use super::{ServerArgs, Session};
use crate::cli::OutputContext;
use crate::cli::response::{FeatureSupport, ProbeResponse};
use crate::config::ClientConfig;
use crate::infra::lsp::LspFeature;
use crate::infra::lsp::capabilities::CapabilityGate;
use crate::infra::lsp::protocol::TextDocumentSyncKind;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub server: ServerArgs,
}

pub async fn execute(args: ProbeArgs, config: ClientConfig) -> Result<()> {
    let session = Session::start(&args.server, config).await?;
    let ctx = OutputContext::new(session.root().to_path_buf());

    let response = probe_response(&session);
    session.finish().await;

    ctx.print_success_flat(response);
    Ok(())
}

fn probe_response(session: &Session) -> ProbeResponse {
    let info = session.init.server_info.as_ref();
    ProbeResponse {
        server: info.map(|i| i.name.clone()),
        version: info.and_then(|i| i.version.clone()),
        sync: sync_name(session.client.capabilities().sync_kind()),
        features: feature_support(session.client.capabilities()),
        capabilities: serde_json::Value::Object(session.init.capabilities.0.clone()),
    }
}

fn feature_support(gate: &CapabilityGate) -> Vec<FeatureSupport> {
    LspFeature::ALL
        .into_iter()
        .map(|feature| FeatureSupport {
            feature: feature.display_name(),
            method: feature.method(),
            supported: gate.supports(feature).unwrap_or(false),
        })
        .collect()
}

fn sync_name(kind: Option<TextDocumentSyncKind>) -> &'static str {
    match kind {
        Some(TextDocumentSyncKind::Full) => "full",
        Some(TextDocumentSyncKind::Incremental) => "incremental",
        Some(TextDocumentSyncKind::None) | None => "none",
    }
}
