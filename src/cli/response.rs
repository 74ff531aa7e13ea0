//! Response types for CLI output
//!
//! All types implement Serialize for consistent JSON output.

use serde::Serialize;
use serde_json::Value;

use crate::models::TextChange;

/// Output of `tether probe`
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// `none`, `full` or `incremental`
    pub sync: &'static str,
    pub features: Vec<FeatureSupport>,
    /// Raw capabilities from the initialize response
    pub capabilities: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureSupport {
    pub feature: &'static str,
    pub method: &'static str,
    pub supported: bool,
}

/// Output of `tether request`
#[derive(Debug, Clone, Serialize)]
pub struct RequestResponse {
    pub file: String,
    pub method: String,
    pub result: Value,
    /// Text edits from the result, mapped onto the current document as byte ranges
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edits: Option<Vec<TextChange>>,
}
