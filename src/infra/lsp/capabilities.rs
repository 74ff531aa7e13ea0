//! Server capability gate
//!
//! Caches what the server advertised in its `initialize` response plus any
//! dynamic registrations, and answers "does the server support X". Answers
//! are tri-state: `None` until the handshake completes and again after a
//! disconnect.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use super::protocol::{Registration, ServerCapabilities, TextDocumentSyncKind, Unregistration};

/// LSP features the gate knows how to look up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LspFeature {
    /// textDocument/completion
    Completion,
    /// textDocument/hover
    Hover,
    /// textDocument/signatureHelp
    SignatureHelp,
    /// textDocument/definition
    Definition,
    /// textDocument/typeDefinition
    TypeDefinition,
    /// textDocument/implementation
    Implementation,
    /// textDocument/references
    References,
    /// textDocument/documentSymbol
    DocumentSymbol,
    /// workspace/symbol
    WorkspaceSymbol,
    /// textDocument/codeAction
    CodeAction,
    /// textDocument/formatting
    Formatting,
    /// textDocument/rangeFormatting
    RangeFormatting,
    /// textDocument/rename
    Rename,
    /// textDocument/inlayHint
    InlayHints,
}

impl LspFeature {
    pub const ALL: [LspFeature; 14] = [
        Self::Completion,
        Self::Hover,
        Self::SignatureHelp,
        Self::Definition,
        Self::TypeDefinition,
        Self::Implementation,
        Self::References,
        Self::DocumentSymbol,
        Self::WorkspaceSymbol,
        Self::CodeAction,
        Self::Formatting,
        Self::RangeFormatting,
        Self::Rename,
        Self::InlayHints,
    ];

    /// Request method that uses this feature
    pub fn method(&self) -> &'static str {
        match self {
            Self::Completion => "textDocument/completion",
            Self::Hover => "textDocument/hover",
            Self::SignatureHelp => "textDocument/signatureHelp",
            Self::Definition => "textDocument/definition",
            Self::TypeDefinition => "textDocument/typeDefinition",
            Self::Implementation => "textDocument/implementation",
            Self::References => "textDocument/references",
            Self::DocumentSymbol => "textDocument/documentSymbol",
            Self::WorkspaceSymbol => "workspace/symbol",
            Self::CodeAction => "textDocument/codeAction",
            Self::Formatting => "textDocument/formatting",
            Self::RangeFormatting => "textDocument/rangeFormatting",
            Self::Rename => "textDocument/rename",
            Self::InlayHints => "textDocument/inlayHint",
        }
    }

    /// Key in `ServerCapabilities` that advertises the feature
    pub fn capability(&self) -> &'static str {
        match self {
            Self::Completion => "completionProvider",
            Self::Hover => "hoverProvider",
            Self::SignatureHelp => "signatureHelpProvider",
            Self::Definition => "definitionProvider",
            Self::TypeDefinition => "typeDefinitionProvider",
            Self::Implementation => "implementationProvider",
            Self::References => "referencesProvider",
            Self::DocumentSymbol => "documentSymbolProvider",
            Self::WorkspaceSymbol => "workspaceSymbolProvider",
            Self::CodeAction => "codeActionProvider",
            Self::Formatting => "documentFormattingProvider",
            Self::RangeFormatting => "documentRangeFormattingProvider",
            Self::Rename => "renameProvider",
            Self::InlayHints => "inlayHintProvider",
        }
    }

    /// Human-readable name for messages
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Hover => "hover",
            Self::SignatureHelp => "signature help",
            Self::Definition => "go to definition",
            Self::TypeDefinition => "go to type definition",
            Self::Implementation => "find implementations",
            Self::References => "find references",
            Self::DocumentSymbol => "document symbols",
            Self::WorkspaceSymbol => "workspace symbols",
            Self::CodeAction => "code actions",
            Self::Formatting => "formatting",
            Self::RangeFormatting => "range formatting",
            Self::Rename => "rename",
            Self::InlayHints => "inlay hints",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.method() == method)
    }
}

#[derive(Debug, Default)]
struct GateState {
    capabilities: Option<ServerCapabilities>,
    /// registration id -> registration
    dynamic: HashMap<String, Registration>,
}

impl GateState {
    fn is_registered(&self, feature: LspFeature) -> bool {
        self.dynamic.values().any(|r| r.method == feature.method())
    }
}

#[derive(Debug, Default)]
pub struct CapabilityGate {
    state: RwLock<GateState>,
}

impl CapabilityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the capabilities from the `initialize` response
    pub fn set(&self, capabilities: ServerCapabilities) {
        let mut state = self.write();
        state.capabilities = Some(capabilities);
        state.dynamic.clear();
    }

    /// Back to unknown
    pub fn clear(&self) {
        let mut state = self.write();
        state.capabilities = None;
        state.dynamic.clear();
    }

    pub fn is_known(&self) -> bool {
        self.read().capabilities.is_some()
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.read().capabilities.clone()
    }

    /// Whether the server advertised `name` (a dotted path such as
    /// `completionProvider.resolveProvider`) or dynamically registered the
    /// feature behind a top-level key. `None` while unknown.
    pub fn has_capability(&self, name: &str) -> Option<bool> {
        let state = self.read();
        let capabilities = state.capabilities.as_ref()?;
        let advertised = capabilities.get(name).is_some_and(is_enabled);
        let registered = LspFeature::ALL
            .into_iter()
            .find(|feature| feature.capability() == name)
            .is_some_and(|feature| state.is_registered(feature));
        Some(advertised || registered)
    }

    pub fn supports(&self, feature: LspFeature) -> Option<bool> {
        let state = self.read();
        let capabilities = state.capabilities.as_ref()?;
        let advertised = capabilities.get(feature.capability()).is_some_and(is_enabled);
        Some(advertised || state.is_registered(feature))
    }

    /// Gate lookup by request method. Methods without a known capability
    /// are never refused.
    pub fn supports_method(&self, method: &str) -> Option<bool> {
        match LspFeature::from_method(method) {
            Some(feature) => self.supports(feature),
            None => self.is_known().then_some(true),
        }
    }

    /// How `didChange` should be sent; `None` while unknown
    pub fn sync_kind(&self) -> Option<TextDocumentSyncKind> {
        let state = self.read();
        let capabilities = state.capabilities.as_ref()?;
        let registered = state
            .dynamic
            .values()
            .filter(|r| r.method == "textDocument/didChange")
            .find_map(|r| {
                let kind = r.register_options.as_ref()?.get("syncKind")?;
                serde_json::from_value(kind.clone()).ok()
            });
        Some(registered.unwrap_or_else(|| capabilities.text_document_sync()))
    }

    /// Apply `client/registerCapability`
    pub fn register(&self, registrations: Vec<Registration>) {
        let mut state = self.write();
        for registration in registrations {
            tracing::debug!(
                "Server registered {} ({})",
                registration.method,
                registration.id
            );
            state.dynamic.insert(registration.id.clone(), registration);
        }
    }

    /// Apply `client/unregisterCapability`
    pub fn unregister(&self, unregistrations: &[Unregistration]) {
        let mut state = self.write();
        for unregistration in unregistrations {
            if state.dynamic.remove(&unregistration.id).is_none() {
                tracing::warn!(
                    "Server unregistered unknown registration {} ({})",
                    unregistration.id,
                    unregistration.method
                );
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, GateState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GateState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `false` and `null` mean absent; options objects mean present
fn is_enabled(value: &Value) -> bool {
    match value {
        Value::Bool(enabled) => *enabled,
        Value::Null => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn capabilities(value: Value) -> ServerCapabilities {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_unknown_until_set_and_after_clear() {
        let gate = CapabilityGate::new();
        assert_eq!(gate.has_capability("hoverProvider"), None);
        assert_eq!(gate.supports(LspFeature::Hover), None);
        assert_eq!(gate.supports_method("custom/method"), None);

        gate.set(capabilities(json!({"hoverProvider": true})));
        assert_eq!(gate.has_capability("hoverProvider"), Some(true));
        assert_eq!(gate.has_capability("renameProvider"), Some(false));

        gate.clear();
        assert_eq!(gate.has_capability("hoverProvider"), None);
        assert!(!gate.is_known());
    }

    #[test]
    fn test_option_objects_and_false_values() {
        let gate = CapabilityGate::new();
        gate.set(capabilities(json!({
            "completionProvider": {"resolveProvider": false, "triggerCharacters": ["."]},
            "renameProvider": false,
            "definitionProvider": null
        })));
        assert_eq!(gate.supports(LspFeature::Completion), Some(true));
        assert_eq!(gate.has_capability("completionProvider.resolveProvider"), Some(false));
        assert_eq!(gate.supports(LspFeature::Rename), Some(false));
        assert_eq!(gate.supports(LspFeature::Definition), Some(false));
    }

    #[test]
    fn test_supports_method_passes_unknown_methods() {
        let gate = CapabilityGate::new();
        gate.set(capabilities(json!({})));
        assert_eq!(gate.supports_method("textDocument/formatting"), Some(false));
        assert_eq!(gate.supports_method("rust-analyzer/expandMacro"), Some(true));
    }

    #[test]
    fn test_dynamic_registration() {
        let gate = CapabilityGate::new();
        gate.set(capabilities(json!({"textDocumentSync": 1})));
        assert_eq!(gate.supports(LspFeature::Formatting), Some(false));

        gate.register(vec![
            Registration {
                id: "fmt".to_string(),
                method: "textDocument/formatting".to_string(),
                register_options: None,
            },
            Registration {
                id: "sync".to_string(),
                method: "textDocument/didChange".to_string(),
                register_options: Some(json!({"syncKind": 2})),
            },
        ]);
        assert_eq!(gate.supports(LspFeature::Formatting), Some(true));
        assert_eq!(gate.has_capability("documentFormattingProvider"), Some(true));
        assert_eq!(gate.sync_kind(), Some(TextDocumentSyncKind::Incremental));

        gate.unregister(&[Unregistration {
            id: "sync".to_string(),
            method: "textDocument/didChange".to_string(),
        }]);
        assert_eq!(gate.sync_kind(), Some(TextDocumentSyncKind::Full));

        gate.unregister(&[Unregistration {
            id: "fmt".to_string(),
            method: "textDocument/formatting".to_string(),
        }]);
        assert_eq!(gate.has_capability("documentFormattingProvider"), Some(false));
        assert_eq!(gate.supports(LspFeature::Formatting), Some(false));
    }

    #[test]
    fn test_sync_kind_from_options_object() {
        let gate = CapabilityGate::new();
        assert_eq!(gate.sync_kind(), None);
        gate.set(capabilities(json!({"textDocumentSync": {"openClose": true, "change": 2}})));
        assert_eq!(gate.sync_kind(), Some(TextDocumentSyncKind::Incremental));
    }

    #[test]
    fn test_feature_method_round_trip() {
        for feature in LspFeature::ALL {
            assert_eq!(LspFeature::from_method(feature.method()), Some(feature));
        }
        assert_eq!(LspFeature::from_method("initialize"), None);
    }
}
