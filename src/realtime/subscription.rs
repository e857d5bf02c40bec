//! Subscriptions held by a connected client and the change projection they need:
//! which node an event touches from a subscription's point of view, child diffs and
//! query membership.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::paths::{split_path, PathPattern, PatternSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// New value of the changed node.
    Value,
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    /// Changed node with both previous and new value.
    Mutated,
}

impl EventKind {
    pub fn is_child_event(self) -> bool {
        matches!(self, EventKind::ChildAdded | EventKind::ChildChanged | EventKind::ChildRemoved)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Value => "value",
            EventKind::ChildAdded => "child_added",
            EventKind::ChildChanged => "child_changed",
            EventKind::ChildRemoved => "child_removed",
            EventKind::Mutated => "mutated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "!exists")]
    NotExists,
}

/// One condition on a child: `key` is a path relative to the child (`"meta/score"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub key: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Value,
}

static NULL: Value = Value::Null;

impl Filter {
    pub fn matches(&self, child: &Value) -> bool {
        let mut field = child;
        for seg in split_path(&self.key) {
            field = match field {
                Value::Object(m) => m.get(&seg).unwrap_or(&NULL),
                _ => &NULL,
            };
        }
        match self.op {
            FilterOp::Exists => !field.is_null(),
            FilterOp::NotExists => field.is_null(),
            FilterOp::Eq => json_eq(field, &self.value),
            FilterOp::Ne => !json_eq(field, &self.value),
            FilterOp::Lt => compare(field, &self.value).map(|o| o.is_lt()).unwrap_or(false),
            FilterOp::Le => compare(field, &self.value).map(|o| o.is_le()).unwrap_or(false),
            FilterOp::Gt => compare(field, &self.value).map(|o| o.is_gt()).unwrap_or(false),
            FilterOp::Ge => compare(field, &self.value).map(|o| o.is_ge()).unwrap_or(false),
        }
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Children of the subscribed node that satisfy every filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl QuerySpec {
    pub fn matches(&self, child: &Value) -> bool {
        !child.is_null() && self.filters.iter().all(|f| f.matches(child))
    }
}

/// Query state: a copy of every child under the base node plus the current
/// member keys. Events are applied to the copy, so membership follows the
/// change feed in order rather than the live tree.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub spec: QuerySpec,
    children: BTreeMap<String, Value>,
    members: BTreeSet<String>,
}

impl QueryState {
    pub fn new(spec: QuerySpec, base: &Value) -> Self {
        let mut st = QueryState { spec, children: BTreeMap::new(), members: BTreeSet::new() };
        for (k, v) in object_entries(base) {
            if st.spec.matches(&v) {
                st.members.insert(k.clone());
            }
            st.children.insert(k, v);
        }
        st
    }

    pub fn members(&self) -> impl Iterator<Item = &String> { self.members.iter() }

    pub fn is_member(&self, key: &str) -> bool { self.members.contains(key) }

    /// Apply a change at `rel` below the base node (`rel` non-empty) and report the
    /// membership transition of the affected child.
    pub fn apply_below(&mut self, rel: &[String], new_value: &Value) -> Option<MembershipChange> {
        let (key, rest) = rel.split_first()?;
        let old = self.children.remove(key).unwrap_or(Value::Null);
        let mut cur = old.clone();
        set_at(&mut cur, rest, new_value.clone());
        if !cur.is_null() {
            self.children.insert(key.clone(), cur.clone());
        }
        self.transition(key, old, cur)
    }

    /// Replace the whole base node and report every membership transition.
    pub fn replace_base(&mut self, base: &Value) -> Vec<MembershipChange> {
        let fresh: BTreeMap<String, Value> = object_entries(base).collect();
        let old = std::mem::replace(&mut self.children, fresh);
        let keys: BTreeSet<String> = old.keys().chain(self.children.keys()).cloned().collect();
        let mut out = Vec::new();
        for k in keys {
            let before = old.get(&k).cloned().unwrap_or(Value::Null);
            let after = self.children.get(&k).cloned().unwrap_or(Value::Null);
            if let Some(c) = self.transition(&k, before, after) {
                out.push(c);
            }
        }
        out
    }

    fn transition(&mut self, key: &str, before: Value, after: Value) -> Option<MembershipChange> {
        let was = self.members.contains(key);
        let now = self.spec.matches(&after);
        let kind = match (was, now) {
            (false, true) => EventKind::ChildAdded,
            (true, true) if before != after => EventKind::ChildChanged,
            (true, false) => EventKind::ChildRemoved,
            _ => return None,
        };
        if now {
            self.members.insert(key.to_string());
        } else {
            self.members.remove(key);
        }
        Some(MembershipChange { kind, key: key.to_string(), previous: before, value: after })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MembershipChange {
    pub kind: EventKind,
    pub key: String,
    pub previous: Value,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub pattern: PathPattern,
    pub events: BTreeSet<EventKind>,
    pub query: Option<QueryState>,
}

impl Subscription {
    pub fn path(&self) -> String { self.pattern.to_string() }

    pub fn wants(&self, kind: EventKind) -> bool { self.events.contains(&kind) }
}

/// Nodes matched by the rest of a pattern below an event path, with the
/// projected previous and new values. Only nodes whose value changed are kept.
pub fn expand_below(rest: &[PatternSegment], at: Vec<String>, previous: &Value, new: &Value, out: &mut Vec<(Vec<String>, Value, Value)>) {
    let Some((seg, tail)) = rest.split_first() else {
        if previous != new {
            out.push((at, previous.clone(), new.clone()));
        }
        return;
    };
    let keys: BTreeSet<String> = match seg {
        PatternSegment::Literal(k) => std::iter::once(k.clone()).collect(),
        PatternSegment::Var(_) | PatternSegment::Any => object_keys(previous).chain(object_keys(new)).collect(),
    };
    for k in keys {
        let mut next = at.clone();
        next.push(k.clone());
        expand_below(tail, next, child(previous, &k), child(new, &k), out);
    }
}

/// `(key, previous, new)` for every child that differs between two values.
pub fn child_diff(previous: &Value, new: &Value) -> Vec<(String, Value, Value)> {
    let keys: BTreeSet<String> = object_keys(previous).chain(object_keys(new)).collect();
    keys.into_iter()
        .filter_map(|k| {
            let (p, n) = (child(previous, &k), child(new, &k));
            if p == n { None } else { Some((k, p.clone(), n.clone())) }
        })
        .collect()
}

/// Child event for a direct child going from `previous` to `new`.
pub fn child_event_kind(previous: &Value, new: &Value) -> EventKind {
    match (previous.is_null(), new.is_null()) {
        (true, false) => EventKind::ChildAdded,
        (false, true) => EventKind::ChildRemoved,
        _ => EventKind::ChildChanged,
    }
}

pub fn project<'a>(v: &'a Value, rel: &[String]) -> &'a Value {
    rel.iter().fold(v, |cur, k| child(cur, k))
}

fn child<'a>(v: &'a Value, key: &str) -> &'a Value {
    match v {
        Value::Object(m) => m.get(key).unwrap_or(&NULL),
        Value::Array(a) => key.parse::<usize>().ok().and_then(|i| a.get(i)).unwrap_or(&NULL),
        _ => &NULL,
    }
}

fn object_keys(v: &Value) -> Box<dyn Iterator<Item = String> + '_> {
    match v {
        Value::Object(m) => Box::new(m.keys().cloned()),
        Value::Array(a) => Box::new((0..a.len()).map(|i| i.to_string())),
        _ => Box::new(std::iter::empty()),
    }
}

fn object_entries(v: &Value) -> impl Iterator<Item = (String, Value)> + '_ {
    object_keys(v).map(move |k| {
        let c = child(v, &k).clone();
        (k, c)
    })
}

/// Write `value` at `rel` inside `root`, creating objects below null slots and
/// pruning nodes left empty. Mirrors how the store applies a mutation.
fn set_at(root: &mut Value, rel: &[String], value: Value) {
    let Some((key, rest)) = rel.split_first() else {
        *root = value;
        return;
    };
    if root.is_null() {
        *root = Value::Object(Map::new());
    }
    match root {
        Value::Array(items) => {
            if let Some(slot) = key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                set_at(slot, rest, value);
            }
        }
        Value::Object(m) => {
            let slot = m.entry(key.clone()).or_insert(Value::Null);
            set_at(slot, rest, value);
            if slot.is_null() || slot.as_object().is_some_and(|o| o.is_empty()) {
                m.remove(key);
            }
            if m.is_empty() {
                *root = Value::Null;
            }
        }
        // The store never writes through a primitive.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn segs(p: &str) -> Vec<String> { split_path(p) }

    #[test]
    fn filters_compare_numbers_and_strings() {
        let f: Filter = serde_json::from_value(json!({"key": "score", "op": ">=", "value": 10})).unwrap();
        assert!(f.matches(&json!({"score": 10.0})));
        assert!(!f.matches(&json!({"score": 9})));
        assert!(!f.matches(&json!({"score": "10"})));
        let nested: Filter = serde_json::from_value(json!({"key": "meta/tag", "op": "exists"})).unwrap();
        assert!(nested.matches(&json!({"meta": {"tag": "x"}})));
        assert!(!nested.matches(&json!({"meta": {}})));
    }

    #[test]
    fn query_membership_follows_changes() {
        let spec = QuerySpec { filters: vec![Filter { key: "open".into(), op: FilterOp::Eq, value: json!(true) }] };
        let mut q = QueryState::new(spec, &json!({"a": {"open": true}, "b": {"open": false}}));
        assert_eq!(q.members().cloned().collect::<Vec<_>>(), vec!["a".to_string()]);

        let c = q.apply_below(&segs("b/open"), &json!(true)).unwrap();
        assert_eq!((c.kind, c.key.as_str()), (EventKind::ChildAdded, "b"));
        let c = q.apply_below(&segs("a/title"), &json!("hi")).unwrap();
        assert_eq!(c.kind, EventKind::ChildChanged);
        assert_eq!(c.value, json!({"open": true, "title": "hi"}));
        let c = q.apply_below(&segs("a"), &Value::Null).unwrap();
        assert_eq!(c.kind, EventKind::ChildRemoved);
        assert!(q.apply_below(&segs("c/open"), &json!(false)).is_none());

        let changes = q.replace_base(&Value::Null);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, EventKind::ChildRemoved);
        assert!(!q.is_member("b"));
    }

    #[test]
    fn expansion_keeps_only_changed_matches() {
        let pattern = PathPattern::parse("/rooms/$room/title");
        let mut out = Vec::new();
        let prev = json!({"r1": {"title": "a"}, "r2": {"title": "b"}});
        let new = json!({"r1": {"title": "a"}, "r2": {"title": "c"}, "r3": {"title": "d"}});
        expand_below(&pattern.segments()[1..], segs("/rooms"), &prev, &new, &mut out);
        let paths: Vec<String> = out.iter().map(|(p, _, _)| crate::paths::join_path(p)).collect();
        assert_eq!(paths, vec!["/rooms/r2/title", "/rooms/r3/title"]);
    }

    #[test]
    fn child_diff_and_kinds() {
        let diff = child_diff(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        let kinds: Vec<(String, EventKind)> = diff.iter().map(|(k, p, n)| (k.clone(), child_event_kind(p, n))).collect();
        assert_eq!(
            kinds,
            vec![
                ("a".to_string(), EventKind::ChildRemoved),
                ("b".to_string(), EventKind::ChildChanged),
                ("c".to_string(), EventKind::ChildAdded)
            ]
        );
    }
}
