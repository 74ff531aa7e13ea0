//! Output formatting for CLI commands

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Output context for consistent formatting across commands
#[derive(Debug, Clone)]
pub struct OutputContext {
    /// Workspace root for relative path calculation
    root: PathBuf,
}

impl OutputContext {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert an absolute path to relative (if within the workspace root)
    pub fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }

    /// Print a successful response with data fields at the top level
    pub fn print_success_flat<T: Serialize>(&self, data: T) {
        let mut response = serde_json::to_value(data).unwrap_or(serde_json::json!({}));
        if let Some(obj) = response.as_object_mut() {
            obj.insert("success".to_string(), serde_json::json!(true));
        }
        print_json(&response);
    }

    pub fn print_error(&self, message: &str) {
        print_json(&error_json(message));
    }
}

/// `{"success": false, "error": message}`
pub fn error_json(message: &str) -> serde_json::Value {
    serde_json::json!({
        "success": false,
        "error": message
    })
}

pub fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to serialize output: {e}"),
    }
}
