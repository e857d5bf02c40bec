//!
//! canopy storage module
//! ----------------------
//! In-memory JSON tree behind the access layer. It provides:
//!
//! - path reads (`get`) and a [`TreeReader`] view used by rule expressions (`root`)
//! - `set` / `update` / `remove` mutations; writing `null` deletes a node and empty
//!   parent objects are pruned
//! - every stored object key is a single valid path segment, and a write never
//!   reaches through a primitive or past the end of an array
//! - an ordered change feed: every mutation produces exactly one [`ChangeEvent`]
//!   with a strictly increasing sequence number, delivered to every listener in
//!   mutation order
//! - optional snapshot persistence to a JSON file on an interval and on shutdown
//!
//! The tree is usually wrapped in a cloneable [`SharedTree`] handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::paths::{join_path, parse_data_path, validate_key, validate_value_keys};

/// Mutation failures caused by the caller's input. They travel inside
/// `anyhow::Error` and are mapped to 400/409 at the route layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("{0}")]
    Conflict(String),
}

fn invalid(e: anyhow::Error) -> StoreError { StoreError::InvalidPath(format!("{:#}", e)) }

fn data_path(path: &str) -> Result<Vec<String>, StoreError> { parse_data_path(path).map_err(invalid) }

/// A single mutation as emitted by the store. Read-only to everything downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    /// Canonical path of the mutated node (`/` for the root).
    pub path: String,
    #[serde(rename = "previous")]
    pub previous_value: Value,
    #[serde(rename = "value")]
    pub new_value: Value,
    /// Client-declared request context of the writer, passed through verbatim.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ChangeEvent {
    pub fn segments(&self) -> Vec<String> { crate::paths::split_path(&self.path) }
}

/// Read access to the whole tree, as seen by rule expressions through `root`.
pub trait TreeReader: Send + Sync {
    /// Value at the given segments, `Value::Null` when absent.
    fn read(&self, segments: &[String]) -> Value;
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PersistenceSettings {
    /// Enable periodic snapshotting of the tree to disk
    #[serde(default)]
    pub enabled: bool,
    /// Interval in milliseconds between snapshots
    #[serde(default = "PersistenceSettings::default_interval_ms")]
    pub interval_ms: u64,
}

impl PersistenceSettings {
    fn default_interval_ms() -> u64 { 5_000 }
}

impl Default for PersistenceSettings {
    fn default() -> Self { Self { enabled: false, interval_ms: Self::default_interval_ms() } }
}

struct TreeState {
    root: Value,
    seq: u64,
    dirty: bool,
}

pub struct MemoryTree {
    state: RwLock<TreeState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    snapshot_path: Option<PathBuf>,
}

/// Cloneable handle used by the server, the dispatcher and rule evaluation.
#[derive(Clone)]
pub struct SharedTree(pub Arc<MemoryTree>);

impl std::ops::Deref for SharedTree {
    type Target = MemoryTree;
    fn deref(&self) -> &MemoryTree { &self.0 }
}

impl SharedTree {
    pub fn new() -> Self { SharedTree(Arc::new(MemoryTree::new(Value::Null, None))) }

    /// Open a tree backed by `<db_root>/data.json`, loading the existing snapshot if present.
    pub fn open<P: AsRef<Path>>(db_root: P, persistence: &PersistenceSettings) -> Result<Self> {
        let path = db_root.as_ref().join("data.json");
        let root = if path.exists() {
            let bytes = std::fs::read(&path).with_context(|| format!("reading snapshot {}", path.display()))?;
            serde_json::from_slice::<Value>(&bytes).with_context(|| format!("parsing snapshot {}", path.display()))?
        } else {
            Value::Null
        };
        let snapshot_path = if persistence.enabled { Some(path) } else { None };
        let tree = SharedTree(Arc::new(MemoryTree::new(root, snapshot_path)));
        if persistence.enabled { tree.start_persistence_loop(persistence.interval_ms); }
        Ok(tree)
    }

    fn start_persistence_loop(&self, interval_ms: u64) {
        let weak = Arc::downgrade(&self.0);
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(Duration::from_millis(interval_ms));
                let Some(tree) = weak.upgrade() else { break; };
                if let Err(e) = tree.save_snapshot() { warn!(target: "storage", "snapshot failed: {e}"); }
            }
        });
    }
}

impl Default for SharedTree {
    fn default() -> Self { Self::new() }
}

impl TreeReader for SharedTree {
    fn read(&self, segments: &[String]) -> Value { self.0.get_segments(segments) }
}

impl TreeReader for MemoryTree {
    fn read(&self, segments: &[String]) -> Value { self.get_segments(segments) }
}

impl MemoryTree {
    pub fn new(root: Value, snapshot_path: Option<PathBuf>) -> Self {
        let mut root = root;
        prune_empty(&mut root);
        Self { state: RwLock::new(TreeState { root, seq: 0, dirty: false }), listeners: Mutex::new(Vec::new()), snapshot_path }
    }

    /// Register a change listener. Events already emitted are not replayed.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    pub fn get(&self, path: &str) -> Result<Value> {
        let segs = data_path(path)?;
        Ok(self.get_segments(&segs))
    }

    pub fn get_segments(&self, segments: &[String]) -> Value {
        let st = self.state.read();
        lookup(&st.root, segments).cloned().unwrap_or(Value::Null)
    }

    pub fn exists(&self, path: &str) -> Result<bool> { Ok(!self.get(path)?.is_null()) }

    pub fn last_seq(&self) -> u64 { self.state.read().seq }

    /// Replace the value at `path`. `null` removes the node.
    pub fn set(&self, path: &str, value: Value, context: Map<String, Value>) -> Result<ChangeEvent> {
        let segs = data_path(path)?;
        validate_value_keys(&value).map_err(invalid)?;
        self.mutate(&segs, context, |slot| {
            *slot = value;
        })
    }

    /// Merge `children` into the object at `path`. `null` children are removed.
    pub fn update(&self, path: &str, children: Map<String, Value>, context: Map<String, Value>) -> Result<ChangeEvent> {
        let segs = data_path(path)?;
        for (key, child) in &children {
            validate_key(key).map_err(invalid)?;
            validate_value_keys(child).map_err(invalid)?;
        }
        self.mutate(&segs, context, |slot| {
            if !slot.is_object() { *slot = Value::Object(Map::new()); }
            if let Value::Object(obj) = slot {
                for (k, v) in children {
                    if v.is_null() { obj.remove(&k); } else { obj.insert(k, v); }
                }
            }
        })
    }

    pub fn remove(&self, path: &str, context: Map<String, Value>) -> Result<ChangeEvent> {
        self.set(path, Value::Null, context)
    }

    fn mutate<F>(&self, segs: &[String], context: Map<String, Value>, apply: F) -> Result<ChangeEvent>
    where
        F: FnOnce(&mut Value),
    {
        let mut st = self.state.write();
        let previous_value = lookup(&st.root, segs).cloned().unwrap_or(Value::Null);
        {
            let slot = slot_mut(&mut st.root, segs)?;
            apply(slot);
            prune_empty(slot);
        }
        prune_path(&mut st.root, segs);
        let new_value = lookup(&st.root, segs).cloned().unwrap_or(Value::Null);
        st.seq += 1;
        st.dirty = true;
        let event = ChangeEvent {
            seq: st.seq,
            path: join_path(segs),
            previous_value,
            new_value,
            context,
        };
        // Emit while still holding the write lock so listener order equals mutation order.
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(target: "storage", seq = event.seq, path = %event.path, "change");
        Ok(event)
    }

    /// Write the tree to its snapshot file if anything changed since the last save.
    pub fn save_snapshot(&self) -> Result<()> {
        let Some(path) = self.snapshot_path.as_ref() else { return Ok(()); };
        let bytes = {
            let mut st = self.state.write();
            if !st.dirty { return Ok(()); }
            st.dirty = false;
            serde_json::to_vec(&st.root)?
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }
}

fn lookup<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    let mut cur = root;
    for s in segs {
        cur = match cur {
            Value::Object(m) => m.get(s)?,
            Value::Array(a) => a.get(s.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Walk to `segs`, creating intermediate objects where nothing exists yet.
/// Existing array elements are addressed by index. Nothing is created when the
/// walk fails: new nodes only appear below null slots, where no later step can fail.
fn slot_mut<'a>(root: &'a mut Value, segs: &[String]) -> Result<&'a mut Value, StoreError> {
    let mut cur = root;
    for (depth, s) in segs.iter().enumerate() {
        if cur.is_null() {
            *cur = Value::Object(Map::new());
        }
        cur = match cur {
            Value::Object(map) => map.entry(s.clone()).or_insert(Value::Null),
            Value::Array(items) => {
                let len = items.len();
                match s.parse::<usize>().ok().filter(|i| *i < len) {
                    Some(i) => &mut items[i],
                    None => {
                        return Err(StoreError::Conflict(format!(
                            "'{}' is not an index of the {}-element array at {}",
                            s,
                            len,
                            join_path(&segs[..depth])
                        )))
                    }
                }
            }
            _ => return Err(StoreError::Conflict(format!("{} holds a primitive value", join_path(&segs[..depth])))),
        };
    }
    Ok(cur)
}

/// Remove null entries and empty objects below `v`, depth first.
fn prune_empty(v: &mut Value) {
    if let Value::Object(map) = v {
        for child in map.values_mut() { prune_empty(child); }
        map.retain(|_, c| !is_empty_node(c));
        if map.is_empty() { *v = Value::Null; }
    }
}

/// After a mutation at `segs`, drop the node and any ancestors left empty.
fn prune_path(root: &mut Value, segs: &[String]) {
    if segs.is_empty() { return; }
    if let Value::Object(map) = root {
        if let Some(child) = map.get_mut(&segs[0]) {
            prune_path(child, &segs[1..]);
            if is_empty_node(child) { map.remove(&segs[0]); }
        }
        if map.is_empty() { *root = Value::Null; }
    }
}

fn is_empty_node(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}
