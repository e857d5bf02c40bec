//! Fan-out of store change events to connected clients.
//!
//! The dispatcher owns the client registry and is driven from a single task (see
//! [`super::handle`]), so registry access never races with delivery. For each event
//! it works out which subscriptions are affected, builds the event messages, and
//! re-runs the read rule for every (client, message) pair before the message is
//! queued on the client's transport. A transport that cannot take a message gets its
//! client dropped after the event; other clients are unaffected.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::messages::{EventMessage, ServerMessage, SubscribeRequest};
use super::subscription::{child_diff, child_event_kind, expand_below, project, EventKind, QueryState, Subscription};
use super::transport::ClientTransport;
use crate::error::AppError;
use crate::identity::AuthContext;
use crate::paths::{is_ancestor_or_self, join_path, normalize_path, parse_data_path, split_path, PathPattern};
use crate::rules::{DataContext, Operation, RuleEngine};
use crate::storage::{ChangeEvent, TreeReader};

pub type ClientId = String;

struct ConnectedClient {
    transport: Box<dyn ClientTransport>,
    auth: AuthContext,
    subscriptions: BTreeMap<String, Subscription>,
}

/// Outcome of fanning out one change event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub denied: usize,
    pub dropped: Vec<ClientId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub clients: usize,
    pub subscriptions: usize,
    pub last_seq: u64,
    pub delivered: u64,
    pub denied: u64,
    pub dropped: u64,
}

struct Delivery {
    path: Vec<String>,
    /// Bound to `data` for the read check; `None` reads the live tree.
    data: Option<Value>,
    message: EventMessage,
}

pub struct Dispatcher {
    rules: Arc<RuleEngine>,
    tree: Arc<dyn TreeReader>,
    clients: HashMap<ClientId, ConnectedClient>,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(rules: Arc<RuleEngine>, tree: Arc<dyn TreeReader>) -> Self {
        Dispatcher { rules, tree, clients: HashMap::new(), stats: DispatcherStats::default() }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            clients: self.clients.len(),
            subscriptions: self.clients.values().map(|c| c.subscriptions.len()).sum(),
            ..self.stats
        }
    }

    pub fn is_connected(&self, client: &str) -> bool { self.clients.contains_key(client) }

    pub fn connect(&mut self, client: ClientId, transport: Box<dyn ClientTransport>, auth: AuthContext) {
        debug!(target: "realtime", client = %client, uid = ?auth.uid, "client connected");
        let replaced = self.clients.insert(client.clone(), ConnectedClient { transport, auth, subscriptions: BTreeMap::new() });
        if replaced.is_some() {
            warn!(target: "realtime", client = %client, "client id reused; previous connection dropped");
        }
    }

    /// Remove a client and all of its subscriptions.
    pub fn disconnect(&mut self, client: &str) -> bool {
        match self.clients.remove(client) {
            Some(c) => {
                debug!(target: "realtime", client = %client, subscriptions = c.subscriptions.len(), "client disconnected");
                true
            }
            None => false,
        }
    }

    /// Swap the identity used for future read checks. Existing subscriptions stay.
    pub fn reauthenticate(&mut self, client: &str, auth: AuthContext) -> bool {
        match self.clients.get_mut(client) {
            Some(c) => {
                debug!(target: "realtime", client = %client, uid = ?auth.uid, "client re-authenticated");
                c.auth = auth;
                true
            }
            None => false,
        }
    }

    /// Queue a message outside the change feed (acks, errors).
    pub fn send_to(&mut self, client: &str, message: ServerMessage) -> bool {
        let Some(c) = self.clients.get(client) else { return false };
        match c.transport.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "realtime", client = %client, "dropping client: {}", e);
                self.stats.dropped += 1;
                self.disconnect(client);
                false
            }
        }
    }

    /// Register a subscription and return its id. Concrete paths are checked
    /// against the read rule up front; wildcard patterns are only checked per event.
    pub fn subscribe(&mut self, client: &str, request: SubscribeRequest) -> Result<String, AppError> {
        let Dispatcher { rules, tree, clients, .. } = self;
        let c = clients.get_mut(client).ok_or_else(|| AppError::not_found("unknown_client", "client is not connected"))?;
        let pattern = parse_subscription_path(&request.path)?;

        let mut events: BTreeSet<EventKind> = request.events.iter().copied().collect();
        if events.is_empty() {
            if request.query.is_some() {
                events.extend([EventKind::ChildAdded, EventKind::ChildChanged, EventKind::ChildRemoved]);
            } else {
                events.insert(EventKind::Value);
            }
        }
        if request.query.is_some() {
            if pattern.has_wildcards() {
                return Err(AppError::user("invalid_query", "query subscriptions need a concrete path"));
            }
            if events.iter().any(|e| !e.is_child_event()) {
                return Err(AppError::user("invalid_query", "query subscriptions only emit child events"));
            }
        }

        let query = if pattern.has_wildcards() {
            None
        } else {
            let segs = split_path(&request.path);
            let decision = rules.evaluate_segments(&segs, Operation::Read, &c.auth, &DataContext::read(&**tree));
            if !decision.allow {
                return Err(AppError::access_denied());
            }
            request.query.map(|spec| QueryState::new(spec, &tree.read(&segs)))
        };

        let id = request.id.filter(|s| !s.is_empty()).unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        debug!(target: "realtime", client = %client, subscription = %id, path = %pattern, "subscribed");
        c.subscriptions.insert(id.clone(), Subscription { id: id.clone(), pattern, events, query });
        Ok(id)
    }

    /// Remove subscriptions by id, or every subscription on `path`. With neither,
    /// all of the client's subscriptions go. Returns how many were removed.
    pub fn unsubscribe(&mut self, client: &str, id: Option<&str>, path: Option<&str>) -> usize {
        let Some(c) = self.clients.get_mut(client) else { return 0 };
        let before = c.subscriptions.len();
        match (id, path) {
            (Some(id), _) => {
                c.subscriptions.remove(id);
            }
            (None, Some(path)) => {
                let path = normalize_path(path);
                c.subscriptions.retain(|_, s| s.path() != path);
            }
            (None, None) => c.subscriptions.clear(),
        }
        before - c.subscriptions.len()
    }

    /// Deliver one store change to every affected subscription the client may read.
    pub fn on_change(&mut self, event: &ChangeEvent) -> DispatchReport {
        let path = event.segments();
        let now = crate::now_ms();
        let mut report = DispatchReport::default();
        {
            let Dispatcher { rules, tree, clients, .. } = &mut *self;
            for (id, client) in clients.iter_mut() {
                let mut deliveries = Vec::new();
                for sub in client.subscriptions.values_mut() {
                    collect(sub, event, &path, &mut deliveries);
                }
                for d in deliveries {
                    let ctx = DataContext { data: d.data.as_ref(), new_data: None, root: Some(&**tree), now_ms: now };
                    if !rules.evaluate_segments(&d.path, Operation::Read, &client.auth, &ctx).allow {
                        report.denied += 1;
                        continue;
                    }
                    if let Err(e) = client.transport.send(ServerMessage::Event(d.message)) {
                        warn!(target: "realtime", client = %id, seq = event.seq, "dropping client: {}", e);
                        report.dropped.push(id.clone());
                        break;
                    }
                    report.delivered += 1;
                }
            }
        }
        for id in &report.dropped {
            self.disconnect(id);
        }
        self.stats.last_seq = event.seq;
        self.stats.delivered += report.delivered as u64;
        self.stats.denied += report.denied as u64;
        self.stats.dropped += report.dropped.len() as u64;
        report
    }
}

/// Subscription paths are data paths whose segments may also be `$var` or `*`.
fn parse_subscription_path(path: &str) -> Result<PathPattern, AppError> {
    let pattern = PathPattern::parse(path);
    let literal: Vec<&str> = pattern.segments().iter().filter(|s| !s.is_wildcard()).map(|s| s.as_str()).collect();
    parse_data_path(&join_path(&literal)).map_err(|e| AppError::user("invalid_path".to_string(), e.to_string()))?;
    Ok(pattern)
}

fn collect(sub: &mut Subscription, event: &ChangeEvent, path: &[String], out: &mut Vec<Delivery>) {
    if sub.query.is_some() {
        collect_query(sub, event, path, out);
        return;
    }
    let pat = sub.pattern.segments();
    if pat.len() <= path.len() {
        if sub.pattern.match_prefix(path).is_none() {
            return;
        }
        let (target, rel) = path.split_at(pat.len());
        emit_node(sub, event, target, rel, &event.previous_value, &event.new_value, out);
    } else if sub.pattern.is_matched_by_ancestor(path) {
        let mut nodes = Vec::new();
        expand_below(&pat[path.len()..], path.to_vec(), &event.previous_value, &event.new_value, &mut nodes);
        for (target, previous, new) in nodes {
            emit_node(sub, event, &target, &[], &previous, &new, out);
        }
    }
}

/// Messages for a change at `target + rel` seen by a subscription on `target`.
fn emit_node(sub: &Subscription, event: &ChangeEvent, target: &[String], rel: &[String], previous: &Value, new: &Value, out: &mut Vec<Delivery>) {
    if previous == new {
        return;
    }
    let changed: Vec<String> = target.iter().chain(rel).cloned().collect();
    let visible = if new.is_null() { previous } else { new };
    if sub.wants(EventKind::Value) {
        out.push(Delivery {
            path: changed.clone(),
            data: Some(visible.clone()),
            message: message(sub, event, EventKind::Value, &changed, None, Some(new.clone()), None),
        });
    }
    if sub.wants(EventKind::Mutated) {
        out.push(Delivery {
            path: changed.clone(),
            data: Some(visible.clone()),
            message: message(sub, event, EventKind::Mutated, &changed, None, Some(new.clone()), Some(previous.clone())),
        });
    }

    if rel.is_empty() {
        for (key, p, n) in child_diff(previous, new) {
            push_child(sub, event, target, key, child_event_kind(&p, &n), Some((p, n)), out);
        }
    } else if rel.len() == 1 {
        push_child(sub, event, target, rel[0].clone(), child_event_kind(previous, new), Some((previous.clone(), new.clone())), out);
    } else {
        // A deeper mutation changes the child without giving its full value.
        push_child(sub, event, target, rel[0].clone(), EventKind::ChildChanged, None, out);
    }
}

fn push_child(
    sub: &Subscription,
    event: &ChangeEvent,
    target: &[String],
    key: String,
    kind: EventKind,
    values: Option<(Value, Value)>,
    out: &mut Vec<Delivery>,
) {
    if !sub.wants(kind) {
        return;
    }
    let mut path = target.to_vec();
    path.push(key.clone());
    let (data, value, previous) = match (kind, values) {
        (_, None) => (None, None, None),
        (EventKind::ChildRemoved, Some((p, _))) => (Some(p.clone()), Some(p), None),
        (EventKind::ChildChanged, Some((p, n))) => (Some(n.clone()), Some(n), Some(p)),
        (_, Some((_, n))) => (Some(n.clone()), Some(n), None),
    };
    let message = message(sub, event, kind, &path, Some(key), value, previous);
    out.push(Delivery { path, data, message });
}

fn collect_query(sub: &mut Subscription, event: &ChangeEvent, path: &[String], out: &mut Vec<Delivery>) {
    let base: Vec<String> = sub.pattern.segments().iter().map(|s| s.as_str().to_string()).collect();
    let Some(q) = sub.query.as_mut() else { return };
    let changes = if path.len() > base.len() && is_ancestor_or_self(&base, path) {
        q.apply_below(&path[base.len()..], &event.new_value).into_iter().collect()
    } else if is_ancestor_or_self(path, &base) {
        q.replace_base(project(&event.new_value, &base[path.len()..]))
    } else {
        return;
    };
    for c in changes {
        push_child(sub, event, &base, c.key, c.kind, Some((c.previous, c.value)), out);
    }
}

fn message(
    sub: &Subscription,
    event: &ChangeEvent,
    kind: EventKind,
    path: &[String],
    key: Option<String>,
    value: Option<Value>,
    previous: Option<Value>,
) -> EventMessage {
    EventMessage {
        subscription: sub.id.clone(),
        event: kind,
        path: join_path(path),
        key,
        value,
        previous,
        seq: event.seq,
        context: event.context.clone(),
    }
}
