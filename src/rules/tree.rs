//! Compiled rule tree and path resolution.
//!
//! A rules document is compiled into a tree of [`RuleNode`]s keyed by literal
//! segment, with at most one wildcard child per node. Resolution walks from the
//! root toward the requested path (exact segment before wildcard) and picks the
//! deepest node that defines a rule for the requested operation. The root always
//! resolves: when the document gives it no rule the operation is denied.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use super::expr::{parse, Expr};
use super::loader::RuleLoadError;
use super::Operation;
use crate::paths::{join_path, split_path, Bindings, PatternSegment};

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledRule {
    Const(bool),
    Expr { source: String, ast: Expr },
}

impl CompiledRule {
    fn compile(value: &Value, path: &str, op: &str) -> Result<Self, RuleLoadError> {
        match value {
            Value::Bool(b) => Ok(CompiledRule::Const(*b)),
            Value::String(s) => match s.trim() {
                "allow" | "true" => Ok(CompiledRule::Const(true)),
                "deny" | "false" => Ok(CompiledRule::Const(false)),
                src => {
                    let ast = parse(src).map_err(|e| RuleLoadError::Expression {
                        path: path.to_string(),
                        op: op.to_string(),
                        msg: e.to_string(),
                    })?;
                    Ok(CompiledRule::Expr { source: src.to_string(), ast })
                }
            },
            other => Err(RuleLoadError::Shape {
                path: path.to_string(),
                msg: format!("{} must be a string or boolean, got {}", op, other),
            }),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            CompiledRule::Const(true) => "true",
            CompiledRule::Const(false) => "false",
            CompiledRule::Expr { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleNode {
    pub read: Option<CompiledRule>,
    pub write: Option<CompiledRule>,
    pub children: BTreeMap<String, RuleNode>,
    pub wildcard: Option<(PatternSegment, Box<RuleNode>)>,
}

impl RuleNode {
    pub fn rule(&self, op: Operation) -> Option<&CompiledRule> {
        match op {
            Operation::Read => self.read.as_ref(),
            Operation::Write => self.write.as_ref(),
        }
    }

    fn child_mut(&mut self, seg: &str, at: &[String]) -> Result<&mut RuleNode, RuleLoadError> {
        let pat = PatternSegment::parse(seg);
        if !pat.is_wildcard() {
            return Ok(self.children.entry(seg.to_string()).or_default());
        }
        if let Some((existing, _)) = &self.wildcard {
            if *existing != pat {
                return Err(RuleLoadError::Shape {
                    path: join_path(at),
                    msg: format!("conflicting wildcards '{}' and '{}' at the same level", existing.as_str(), seg),
                });
            }
        }
        let (_, node) = self.wildcard.get_or_insert_with(|| (pat, Box::new(RuleNode::default())));
        Ok(&mut **node)
    }

    /// Merge a JSON rule object into this node. `at` is the pattern path of this node.
    fn merge(&mut self, obj: &Map<String, Value>, at: &mut Vec<String>) -> Result<(), RuleLoadError> {
        for (key, value) in obj {
            if let Some(op) = key.strip_prefix('.') {
                let here = join_path(at);
                let slot = match op {
                    "read" => &mut self.read,
                    "write" => &mut self.write,
                    other => {
                        warn!(target: "rules", "ignoring unsupported rule key '.{}' at {}", other, here);
                        continue;
                    }
                };
                if slot.is_some() {
                    return Err(RuleLoadError::Shape { path: here, msg: format!("duplicate {} rule", key) });
                }
                *slot = Some(CompiledRule::compile(value, &here, key)?);
                continue;
            }
            let Value::Object(child) = value else {
                return Err(RuleLoadError::Shape {
                    path: join_path(at),
                    msg: format!("rule entry '{}' must be an object", key),
                });
            };
            let segs = split_path(key);
            let depth = at.len();
            let mut node: &mut RuleNode = self;
            for seg in &segs {
                node = node.child_mut(seg, at)?;
                at.push(seg.clone());
            }
            let res = node.merge(child, at);
            at.truncate(depth);
            res?;
        }
        Ok(())
    }
}

/// Effective rule for one (path, operation) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<'t> {
    /// `None` when nothing defines the operation, which denies.
    pub rule: Option<&'t CompiledRule>,
    /// Pattern path of the node that supplied the rule, e.g. `/rooms/$roomId`.
    pub rule_path: String,
    pub bindings: Bindings,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTree {
    root: RuleNode,
}

impl RuleTree {
    /// Compile a rules document of the form `{"rules": {...}}`.
    pub fn from_json(doc: &Value) -> Result<Self, RuleLoadError> {
        let Some(rules) = doc.get("rules") else {
            return Err(RuleLoadError::Shape { path: "/".into(), msg: "missing top-level \"rules\" object".into() });
        };
        let Value::Object(obj) = rules else {
            return Err(RuleLoadError::Shape { path: "/".into(), msg: "\"rules\" must be an object".into() });
        };
        let mut root = RuleNode::default();
        root.merge(obj, &mut Vec::new())?;
        Ok(RuleTree { root })
    }

    pub fn from_json_str(src: &str) -> Result<Self, RuleLoadError> {
        let doc: Value = serde_json::from_str(src)?;
        Self::from_json(&doc)
    }

    pub fn root(&self) -> &RuleNode { &self.root }

    /// Count of nodes that define at least one rule.
    pub fn rule_count(&self) -> usize {
        fn walk(n: &RuleNode) -> usize {
            let own = usize::from(n.read.is_some() || n.write.is_some());
            own + n.children.values().map(walk).sum::<usize>() + n.wildcard.as_ref().map(|(_, w)| walk(w)).unwrap_or(0)
        }
        walk(&self.root)
    }

    pub fn resolve<S: AsRef<str>>(&self, path: &[S], op: Operation) -> Resolved<'_> {
        let mut node = &self.root;
        let mut pattern: Vec<String> = Vec::new();
        let mut bindings: Bindings = Vec::new();
        let mut best = Resolved { rule: node.rule(op), rule_path: "/".into(), bindings: Vec::new() };
        for seg in path {
            let seg = seg.as_ref();
            if let Some(next) = node.children.get(seg) {
                node = next;
                pattern.push(seg.to_string());
            } else if let Some((wild, next)) = &node.wildcard {
                if let PatternSegment::Var(name) = wild {
                    bindings.push((name.clone(), seg.to_string()));
                }
                node = &**next;
                pattern.push(wild.as_str().to_string());
            } else {
                break;
            }
            if let Some(rule) = node.rule(op) {
                best = Resolved { rule: Some(rule), rule_path: join_path(&pattern), bindings: bindings.clone() };
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(p: &str) -> Vec<String> { split_path(p) }

    #[test]
    fn nested_and_multi_segment_keys_compile_to_one_tree() {
        let a = RuleTree::from_json(&json!({"rules": {"rooms": {"$roomId": {".read": true}}}})).unwrap();
        let b = RuleTree::from_json(&json!({"rules": {"rooms/$roomId": {".read": true}}})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rule_count(), 1);
    }

    #[test]
    fn root_may_be_given_by_slash_key_or_top_level_ops() {
        let a = RuleTree::from_json(&json!({"rules": {"/": {".read": "allow"}}})).unwrap();
        let b = RuleTree::from_json(&json!({"rules": {".read": true}})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_operation_is_rejected() {
        let err = RuleTree::from_json(&json!({"rules": {"/": {".read": true}, ".read": false}})).unwrap_err();
        assert!(matches!(err, RuleLoadError::Shape { .. }));
    }

    #[test]
    fn conflicting_wildcards_are_rejected() {
        let err = RuleTree::from_json(&json!({"rules": {"a/$x": {".read": true}, "a/$y": {".read": true}}})).unwrap_err();
        assert!(matches!(err, RuleLoadError::Shape { .. }));
    }

    #[test]
    fn malformed_expression_reports_path_and_op() {
        let err = RuleTree::from_json(&json!({"rules": {"users/$uid": {".write": "auth.uid ==="}}})).unwrap_err();
        match err {
            RuleLoadError::Expression { path, op, .. } => {
                assert_eq!(path, "/users/$uid");
                assert_eq!(op, ".write");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exact_segment_beats_wildcard_and_binds_variables() {
        let t = RuleTree::from_json(&json!({"rules": {
            "users/$uid": {".read": "auth.uid === $uid"},
            "users/public": {".read": true}
        }}))
        .unwrap();
        let r = t.resolve(&segs("/users/public/name"), Operation::Read);
        assert_eq!(r.rule_path, "/users/public");
        assert!(r.bindings.is_empty());
        let r = t.resolve(&segs("/users/u7/name"), Operation::Read);
        assert_eq!(r.rule_path, "/users/$uid");
        assert_eq!(r.bindings, vec![("$uid".to_string(), "u7".to_string())]);
    }

    #[test]
    fn node_without_operation_defers_to_nearest_ancestor() {
        let t = RuleTree::from_json(&json!({"rules": {
            ".write": false,
            "a": {".write": true, "b": {".read": true}}
        }}))
        .unwrap();
        assert_eq!(t.resolve(&segs("/a/b/c"), Operation::Write).rule_path, "/a");
        assert_eq!(t.resolve(&segs("/a/b/c"), Operation::Read).rule_path, "/a/b");
        assert_eq!(t.resolve(&segs("/z"), Operation::Write).rule_path, "/");
    }

    #[test]
    fn missing_root_rule_resolves_to_none() {
        let t = RuleTree::from_json(&json!({"rules": {"a": {".read": true}}})).unwrap();
        let r = t.resolve(&segs("/b"), Operation::Read);
        assert!(r.rule.is_none());
        assert_eq!(r.rule_path, "/");
    }
}
