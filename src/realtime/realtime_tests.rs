use super::*;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::identity::AuthContext;
use crate::rules::{RuleEngine, RuleTree};
use crate::storage::{ChangeEvent, SharedTree};

fn setup(rules: Value) -> (Dispatcher, SharedTree, mpsc::UnboundedReceiver<ChangeEvent>) {
    let tree = SharedTree::new();
    let changes = tree.subscribe_changes();
    let engine = Arc::new(RuleEngine::new(RuleTree::from_json(&rules).unwrap()));
    (Dispatcher::new(engine, Arc::new(tree.clone())), tree, changes)
}

fn connect(d: &mut Dispatcher, id: &str, auth: AuthContext, capacity: usize) -> mpsc::Receiver<ServerMessage> {
    let (transport, rx) = ChannelTransport::new(capacity);
    d.connect(id.to_string(), Box::new(transport), auth);
    rx
}

fn sub(path: &str, events: &[EventKind]) -> SubscribeRequest {
    SubscribeRequest { id: Some(format!("sub:{path}")), path: path.to_string(), events: events.to_vec(), query: None }
}

fn pump(d: &mut Dispatcher, changes: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> Vec<DispatchReport> {
    let mut out = Vec::new();
    while let Ok(ev) = changes.try_recv() {
        out.push(d.on_change(&ev));
    }
    out
}

fn events(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<EventMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let ServerMessage::Event(e) = msg {
            out.push(e);
        }
    }
    out
}

fn set(tree: &SharedTree, path: &str, v: Value) { tree.set(path, v, Map::new()).unwrap(); }

#[test]
fn denied_event_is_skipped_and_subscription_survives() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {
        ".read": false,
        "rooms": {"1": {".read": true, "secret": {".read": false}}}
    }}));
    let mut a = connect(&mut d, "a", AuthContext::anonymous(), 16);
    d.subscribe("a", sub("/rooms/1", &[EventKind::Value])).unwrap();

    set(&tree, "/rooms/1/secret/code", json!(42));
    let reports = pump(&mut d, &mut changes);
    assert_eq!(reports[0].denied, 1);
    assert!(events(&mut a).is_empty());
    assert_eq!(d.stats().subscriptions, 1);

    set(&tree, "/rooms/1/title", json!("lobby"));
    pump(&mut d, &mut changes);
    let got = events(&mut a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].path, "/rooms/1/title");
    assert_eq!(got[0].value, Some(json!("lobby")));
}

#[test]
fn subscribing_where_reads_are_denied_fails() {
    let (mut d, _tree, _changes) = setup(json!({"rules": {".read": "auth !== null"}}));
    let _a = connect(&mut d, "a", AuthContext::anonymous(), 4);
    let err = d.subscribe("a", sub("/x", &[])).unwrap_err();
    assert_eq!(err.code_str(), "access_denied");
    assert!(d.subscribe("a", sub("/.hidden", &[])).is_err());
    assert_eq!(d.stats().subscriptions, 0);
}

#[test]
fn events_arrive_in_store_order() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {".read": true}}));
    let mut a = connect(&mut d, "a", AuthContext::anonymous(), 16);
    d.subscribe("a", sub("/counter", &[EventKind::Mutated])).unwrap();
    for n in 5..=7 {
        set(&tree, "/counter", json!(n));
    }
    pump(&mut d, &mut changes);
    let got = events(&mut a);
    let values: Vec<Value> = got.iter().filter_map(|e| e.value.clone()).collect();
    assert_eq!(values, vec![json!(5), json!(6), json!(7)]);
    assert_eq!(got[1].previous, Some(json!(5)));
    assert!(got.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn closed_client_is_dropped_without_affecting_others() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {".read": true}}));
    let a = connect(&mut d, "a", AuthContext::anonymous(), 16);
    let mut b = connect(&mut d, "b", AuthContext::anonymous(), 16);
    d.subscribe("a", sub("/feed", &[])).unwrap();
    d.subscribe("b", sub("/feed", &[])).unwrap();
    drop(a);

    set(&tree, "/feed/1", json!("hello"));
    set(&tree, "/feed/2", json!("again"));
    let reports = pump(&mut d, &mut changes);
    assert_eq!(reports[0].dropped, vec!["a".to_string()]);
    assert!(reports[1].dropped.is_empty());
    assert!(!d.is_connected("a"));
    assert_eq!(events(&mut b).len(), 2);
}

#[test]
fn slow_client_with_full_queue_is_dropped() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {".read": true}}));
    let _slow = connect(&mut d, "slow", AuthContext::anonymous(), 1);
    d.subscribe("slow", sub("/n", &[])).unwrap();
    set(&tree, "/n", json!(1));
    set(&tree, "/n", json!(2));
    let reports = pump(&mut d, &mut changes);
    assert_eq!(reports[0].delivered, 1);
    assert_eq!(reports[1].dropped, vec!["slow".to_string()]);
    assert_eq!(d.stats().clients, 0);
}

#[test]
fn ancestor_writes_are_projected_onto_the_subscription() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {".read": true}}));
    let mut a = connect(&mut d, "a", AuthContext::anonymous(), 16);
    d.subscribe("a", sub("/rooms/1/title", &[])).unwrap();

    set(&tree, "/rooms", json!({"1": {"title": "x"}, "2": {"title": "y"}}));
    set(&tree, "/rooms/2", json!({"title": "z"}));
    set(&tree, "/rooms", json!({"1": {"title": "x", "topic": "t"}}));
    pump(&mut d, &mut changes);
    let got = events(&mut a);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].path, "/rooms/1/title");
    assert_eq!(got[0].value, Some(json!("x")));
}

#[test]
fn child_events_report_added_changed_and_removed() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {".read": true}}));
    let mut a = connect(&mut d, "a", AuthContext::anonymous(), 16);
    let kinds = [EventKind::ChildAdded, EventKind::ChildChanged, EventKind::ChildRemoved];
    d.subscribe("a", sub("/list", &kinds)).unwrap();

    set(&tree, "/list/a", json!({"n": 1}));
    set(&tree, "/list/a/n", json!(2));
    tree.update("/list", serde_json::from_value(json!({"a": null, "b": 1})).unwrap(), Map::new()).unwrap();
    pump(&mut d, &mut changes);
    let got: Vec<(EventKind, Option<String>)> = events(&mut a).into_iter().map(|e| (e.event, e.key)).collect();
    assert_eq!(
        got,
        vec![
            (EventKind::ChildAdded, Some("a".into())),
            (EventKind::ChildChanged, Some("a".into())),
            (EventKind::ChildRemoved, Some("a".into())),
            (EventKind::ChildAdded, Some("b".into())),
        ]
    );
}

#[test]
fn query_subscriptions_track_membership() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {".read": true}}));
    set(&tree, "/tasks/t1", json!({"done": false}));
    set(&tree, "/tasks/t2", json!({"done": true}));
    changes.try_recv().unwrap();
    changes.try_recv().unwrap();

    let mut a = connect(&mut d, "a", AuthContext::anonymous(), 16);
    let query = QuerySpec { filters: vec![Filter { key: "done".into(), op: FilterOp::Eq, value: json!(false) }] };
    d.subscribe("a", SubscribeRequest { id: Some("open".into()), path: "/tasks".into(), events: vec![], query: Some(query) })
        .unwrap();

    set(&tree, "/tasks/t2/done", json!(false));
    set(&tree, "/tasks/t1/done", json!(true));
    set(&tree, "/tasks/t3", json!({"done": true}));
    set(&tree, "/tasks/t2/title", json!("write docs"));
    pump(&mut d, &mut changes);
    let got: Vec<(EventKind, String)> = events(&mut a).into_iter().map(|e| (e.event, e.key.unwrap_or_default())).collect();
    assert_eq!(
        got,
        vec![
            (EventKind::ChildAdded, "t2".to_string()),
            (EventKind::ChildRemoved, "t1".to_string()),
            (EventKind::ChildChanged, "t2".to_string()),
        ]
    );
}

#[test]
fn wildcard_subscriptions_are_checked_per_concrete_path() {
    let (mut d, tree, mut changes) = setup(json!({"rules": {
        "users": {"$uid": {".read": "auth !== null && auth.uid === $uid"}}
    }}));
    let mut u1 = connect(&mut d, "c1", AuthContext::for_uid("u1", Map::new()), 16);
    d.subscribe("c1", sub("/users/$uid", &[])).unwrap();

    set(&tree, "/users/u1/name", json!("Ann"));
    set(&tree, "/users/u2/name", json!("Bob"));
    let reports = pump(&mut d, &mut changes);
    assert_eq!(reports[1].denied, 1);
    let got = events(&mut u1);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].path, "/users/u1/name");

    d.reauthenticate("c1", AuthContext::for_uid("u2", Map::new()));
    set(&tree, "/users/u2/name", json!("Bobby"));
    pump(&mut d, &mut changes);
    assert_eq!(events(&mut u1)[0].value, Some(json!("Bobby")));
}

#[test]
fn unsubscribe_by_id_and_path() {
    let (mut d, _tree, _changes) = setup(json!({"rules": {".read": true}}));
    let _a = connect(&mut d, "a", AuthContext::anonymous(), 16);
    d.subscribe("a", sub("/x", &[])).unwrap();
    d.subscribe("a", SubscribeRequest { id: None, ..sub("/y/", &[]) }).unwrap();
    d.subscribe("a", SubscribeRequest { id: None, ..sub("/y", &[EventKind::Mutated]) }).unwrap();
    assert_eq!(d.unsubscribe("a", Some("sub:/x"), None), 1);
    assert_eq!(d.unsubscribe("a", None, Some("y")), 2);
    assert_eq!(d.stats().subscriptions, 0);
}

#[tokio::test]
async fn dispatcher_task_acks_then_streams_changes() {
    let (d, tree, changes) = setup(json!({"rules": {".read": true}}));
    let (handle, _task) = spawn_dispatcher(d, changes);
    let (transport, mut rx) = ChannelTransport::new(16);
    handle.connect("a", transport, AuthContext::anonymous());
    handle.subscribe("a", sub("/counter", &[]));
    assert_eq!(rx.recv().await, Some(ServerMessage::ack("subscribe", Some("sub:/counter".into()))));

    set(&tree, "/counter", json!(1));
    match rx.recv().await {
        Some(ServerMessage::Event(e)) => assert_eq!(e.value, Some(json!(1))),
        other => panic!("unexpected {other:?}"),
    }

    handle.subscribe("a", sub("/a/#b", &[]));
    assert!(matches!(rx.recv().await, Some(ServerMessage::Error { code, .. }) if code == "invalid_path"));

    handle.reauthenticate("a", AuthContext::for_uid("u9", Map::new()), "signin");
    assert!(matches!(rx.recv().await, Some(ServerMessage::Ack { uid: Some(u), .. }) if u == "u9"));

    handle.disconnect("a");
    assert_eq!(rx.recv().await, None);
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.clients, 0);
    assert_eq!(stats.delivered, 1);
}
