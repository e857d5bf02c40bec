//!
//! canopy rules module
//! -------------------
//! Per-path read/write authorization. A [`RuleEngine`] holds the active
//! [`RuleTree`] as an `Arc` snapshot; reloads compile a complete new tree and
//! swap it in whole, so a failed reload leaves the previous tree in force.
//!
//! Decisions are fail-closed: a missing rule, an expression error or a falsy
//! result all deny. The reason in a [`Decision`] is for operator logs only.

pub mod eval;
pub mod expr;
pub mod loader;
pub mod tree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

pub use loader::{ensure_rules_file, load_rules_file, rules_file_path, DefaultAccess, RuleLoadError};
pub use tree::{CompiledRule, RuleTree};

use crate::identity::AuthContext;
use crate::paths::split_path;
use crate::storage::TreeReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self { Operation::Read => "read", Operation::Write => "write" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub reason: String,
    /// Pattern path of the deciding rule.
    pub rule_path: String,
}

impl Decision {
    pub fn is_allowed(&self) -> bool { self.allow }
}

/// Values bound to `data`, `newData`, `root` and `now`.
#[derive(Clone, Copy)]
pub struct DataContext<'a> {
    /// Current value at the path. When `None`, `data` is read lazily through `root`.
    pub data: Option<&'a Value>,
    pub new_data: Option<&'a Value>,
    pub root: Option<&'a dyn TreeReader>,
    pub now_ms: i64,
}

impl<'a> DataContext<'a> {
    /// Context for a read against a live tree.
    pub fn read(root: &'a dyn TreeReader) -> Self {
        DataContext { data: None, new_data: None, root: Some(root), now_ms: crate::now_ms() }
    }

    /// Context for a write of `new_data` over `data`.
    pub fn write(root: &'a dyn TreeReader, data: &'a Value, new_data: &'a Value) -> Self {
        DataContext { data: Some(data), new_data: Some(new_data), root: Some(root), now_ms: crate::now_ms() }
    }

    /// Context with values only and no tree access.
    pub fn detached(data: Option<&'a Value>, new_data: Option<&'a Value>) -> Self {
        DataContext { data, new_data, root: None, now_ms: crate::now_ms() }
    }
}

static NULL: Value = Value::Null;

pub struct RuleEngine {
    tree: RwLock<Arc<RuleTree>>,
    source: Option<PathBuf>,
    loaded_mtime: Mutex<Option<SystemTime>>,
}

impl RuleEngine {
    pub fn new(tree: RuleTree) -> Self {
        RuleEngine { tree: RwLock::new(Arc::new(tree)), source: None, loaded_mtime: Mutex::new(None) }
    }

    /// Load the rules file at `path`; later calls to [`RuleEngine::reload`] re-read it.
    pub fn from_file(path: &Path) -> Result<Self, RuleLoadError> {
        let mtime = file_mtime(path);
        let tree = load_rules_file(path)?;
        info!(target: "rules", "loaded {} rule nodes from {}", tree.rule_count(), path.display());
        Ok(RuleEngine { tree: RwLock::new(Arc::new(tree)), source: Some(path.to_path_buf()), loaded_mtime: Mutex::new(mtime) })
    }

    pub fn source(&self) -> Option<&Path> { self.source.as_deref() }

    /// Snapshot of the active tree.
    pub fn current(&self) -> Arc<RuleTree> { self.tree.read().clone() }

    pub fn replace(&self, tree: RuleTree) {
        *self.tree.write() = Arc::new(tree);
    }

    /// Compile `src` and swap it in. On error the active tree is kept.
    pub fn reload_from_str(&self, src: &str) -> Result<usize, RuleLoadError> {
        match RuleTree::from_json_str(src) {
            Ok(tree) => {
                let count = tree.rule_count();
                self.replace(tree);
                info!(target: "rules", "rules reloaded ({} rule nodes)", count);
                Ok(count)
            }
            Err(e) => {
                error!(target: "rules", "rules reload rejected, keeping previous rules: {}", e);
                Err(e)
            }
        }
    }

    /// Re-read the rules file this engine was loaded from.
    pub fn reload(&self) -> Result<usize, RuleLoadError> {
        let Some(path) = self.source.as_ref() else {
            return Err(RuleLoadError::Shape { path: "/".into(), msg: "engine has no rules file".into() });
        };
        let mtime = file_mtime(path);
        let text = std::fs::read_to_string(path).map_err(|source| RuleLoadError::Io { path: path.clone(), source });
        let text = match text {
            Ok(t) => t,
            Err(e) => {
                error!(target: "rules", "rules reload failed: {}", e);
                return Err(e);
            }
        };
        // The mtime is recorded on failure too; a broken file is reported once.
        *self.loaded_mtime.lock() = mtime;
        self.reload_from_str(&text)
    }

    /// Reload when the rules file modification time differs from the last load.
    pub fn reload_if_changed(&self) -> Result<bool, RuleLoadError> {
        let Some(path) = self.source.as_ref() else { return Ok(false); };
        let mtime = file_mtime(path);
        if mtime.is_none() || mtime == *self.loaded_mtime.lock() {
            return Ok(false);
        }
        self.reload().map(|_| true)
    }

    pub fn evaluate(&self, path: &str, op: Operation, auth: &AuthContext, data: &DataContext<'_>) -> Decision {
        self.evaluate_segments(&split_path(path), op, auth, data)
    }

    pub fn evaluate_segments(&self, path: &[String], op: Operation, auth: &AuthContext, data: &DataContext<'_>) -> Decision {
        let tree = self.current();
        let resolved = tree.resolve(path, op);
        let decision = match resolved.rule {
            None => Decision { allow: false, reason: "no rule defined".into(), rule_path: resolved.rule_path.clone() },
            Some(CompiledRule::Const(allow)) => {
                Decision { allow: *allow, reason: format!("constant {}", allow), rule_path: resolved.rule_path.clone() }
            }
            Some(CompiledRule::Expr { source, ast }) => {
                let auth_value = auth.to_rule_value();
                let context = Value::Object(auth.context.clone());
                let scope = eval::Scope {
                    auth: &auth_value,
                    data: data.data,
                    new_data: data.new_data.unwrap_or(&NULL),
                    root: data.root,
                    path,
                    now: data.now_ms,
                    context: &context,
                    bindings: &resolved.bindings,
                };
                match eval::evaluate_bool(ast, &scope) {
                    Ok(allow) => Decision { allow, reason: format!("'{}' evaluated to {}", source, allow), rule_path: resolved.rule_path.clone() },
                    Err(e) => Decision { allow: false, reason: format!("'{}' failed: {}", source, e), rule_path: resolved.rule_path.clone() },
                }
            }
        };
        debug!(target: "rules", op = %op, path = %crate::paths::join_path(path), rule = %decision.rule_path, allow = decision.allow, "{}", decision.reason);
        decision
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
