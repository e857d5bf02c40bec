//! Database path helpers shared by the store, the rule engine and realtime matching.
//!
//! Paths are `/`-delimited; leading and trailing slashes are ignored, so `""`, `"/"`
//! and `"//"` all address the root. Patterns add two wildcard forms per segment:
//! `$name` binds the key to a variable, `*` matches any key without binding.

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Maximum length of a single key.
pub const MAX_KEY_LEN: usize = 128;

/// Split a path into its non-empty segments.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect()
}

/// Join segments back into a canonical path; the root is `/`.
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() { return "/".to_string(); }
    let mut out = String::new();
    for s in segments {
        out.push('/');
        out.push_str(s.as_ref());
    }
    out
}

pub fn normalize_path(path: &str) -> String { join_path(&split_path(path)) }

/// Validate a data path and split it. Data paths are literal: wildcard markers and
/// control characters are rejected so stored keys can never be confused with rule patterns.
pub fn parse_data_path(path: &str) -> Result<Vec<String>> {
    let segs = split_path(path);
    for seg in &segs {
        validate_key(seg)?;
    }
    Ok(segs)
}

/// Check one object key as a single path segment.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        bail!("empty keys are not allowed");
    }
    if key.contains('/') {
        bail!("'/' is not allowed in keys");
    }
    if key.len() > MAX_KEY_LEN {
        bail!("key exceeds {} bytes", MAX_KEY_LEN);
    }
    if key.chars().any(|c| c.is_control()) {
        bail!("control characters are not allowed in keys");
    }
    if key.starts_with('$') || key == "*" {
        bail!("'{}' is reserved for rule patterns", key);
    }
    if key.starts_with('.') {
        bail!("keys starting with '.' are reserved");
    }
    if key.contains(['[', ']', '#']) {
        bail!("'[', ']' and '#' are not allowed in keys");
    }
    Ok(())
}

/// Check every object key inside a value about to be stored.
pub fn validate_value_keys(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                validate_key(key).with_context(|| format!("in key '{}'", key))?;
                validate_value_keys(child)?;
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_value_keys),
        _ => Ok(()),
    }
}

/// True when `ancestor` equals `path` or is a prefix of it.
pub fn is_ancestor_or_self<S: AsRef<str>, T: AsRef<str>>(ancestor: &[S], path: &[T]) -> bool {
    ancestor.len() <= path.len() && ancestor.iter().zip(path.iter()).all(|(a, p)| a.as_ref() == p.as_ref())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternSegment {
    Literal(String),
    /// `$name`; the matched key is bound as `$name`.
    Var(String),
    /// `*`
    Any,
}

impl PatternSegment {
    pub fn parse(seg: &str) -> Self {
        if seg == "*" { return PatternSegment::Any; }
        if seg.len() > 1 && seg.starts_with('$') { return PatternSegment::Var(seg.to_string()); }
        PatternSegment::Literal(seg.to_string())
    }

    pub fn is_wildcard(&self) -> bool { !matches!(self, PatternSegment::Literal(_)) }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            PatternSegment::Literal(l) => l == key,
            PatternSegment::Var(_) | PatternSegment::Any => true,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PatternSegment::Literal(s) | PatternSegment::Var(s) => s.as_str(),
            PatternSegment::Any => "*",
        }
    }
}

/// Wildcard bindings collected while matching, in path order.
pub type Bindings = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathPattern {
    segments: Vec<PatternSegment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        Self { segments: split_path(pattern).iter().map(|s| PatternSegment::parse(s)).collect() }
    }

    pub fn segments(&self) -> &[PatternSegment] { &self.segments }

    pub fn len(&self) -> usize { self.segments.len() }

    pub fn is_empty(&self) -> bool { self.segments.is_empty() }

    pub fn has_wildcards(&self) -> bool { self.segments.iter().any(|s| s.is_wildcard()) }

    /// Match the pattern against the first `self.len()` segments of `path`.
    /// Returns the bindings when the pattern covers a prefix of (or all of) the path.
    pub fn match_prefix<S: AsRef<str>>(&self, path: &[S]) -> Option<Bindings> {
        if self.segments.len() > path.len() { return None; }
        let mut bindings = Vec::new();
        for (seg, key) in self.segments.iter().zip(path.iter()) {
            let key = key.as_ref();
            if !seg.matches(key) { return None; }
            if let PatternSegment::Var(name) = seg { bindings.push((name.clone(), key.to_string())); }
        }
        Some(bindings)
    }

    /// True when `path` (shorter than the pattern) could be an ancestor of a matching path.
    pub fn is_matched_by_ancestor<S: AsRef<str>>(&self, path: &[S]) -> bool {
        path.len() < self.segments.len()
            && self.segments.iter().zip(path.iter()).all(|(seg, key)| seg.matches(key.as_ref()))
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let segs: Vec<&str> = self.segments.iter().map(|s| s.as_str()).collect();
        write!(f, "{}", join_path(&segs))
    }
}
