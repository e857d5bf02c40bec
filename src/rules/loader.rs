//! Rules file handling: default documents for first start and load errors.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use super::tree::RuleTree;

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("cannot read rules file {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("rules file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid rules at {path}: {msg}")]
    Shape { path: String, msg: String },
    #[error("invalid {op} expression at {path}: {msg}")]
    Expression { path: String, op: String, msg: String },
}

/// Access granted by the rules written on first start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAccess {
    /// Nobody but the administrator.
    #[default]
    Deny,
    /// Any signed-in user.
    Auth,
    Allow,
}

impl DefaultAccess {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" | "none" => Some(DefaultAccess::Deny),
            "auth" | "authenticated" => Some(DefaultAccess::Auth),
            "allow" | "all" => Some(DefaultAccess::Allow),
            _ => None,
        }
    }

    pub fn rules_document(self) -> serde_json::Value {
        let rule = match self {
            DefaultAccess::Deny => json!(false),
            DefaultAccess::Auth => json!("auth !== null"),
            DefaultAccess::Allow => json!(true),
        };
        json!({"rules": {".read": rule.clone(), ".write": rule}})
    }
}

pub fn rules_file_path(db_root: &Path) -> PathBuf { db_root.join("rules.json") }

/// Write the default rules document unless a rules file already exists.
/// Returns true when a new file was written.
pub fn ensure_rules_file(path: &Path, access: DefaultAccess) -> Result<bool, RuleLoadError> {
    if path.exists() {
        return Ok(false);
    }
    let io_err = |source| RuleLoadError::Io { path: path.to_path_buf(), source };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let body = serde_json::to_vec_pretty(&access.rules_document())?;
    std::fs::write(path, body).map_err(io_err)?;
    info!(target: "rules", "wrote default rules ({:?}) to {}", access, path.display());
    Ok(true)
}

pub fn load_rules_file(path: &Path) -> Result<RuleTree, RuleLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io { path: path.to_path_buf(), source })?;
    RuleTree::from_json_str(&text)
}
