mod common;

use std::time::Duration;

use common::{start, TestServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn open_rules() -> Value {
    json!({"rules": {
        ".read": true,
        ".write": "auth !== null",
        "private": {".read": "data === null || data.public === true"}
    }})
}

async fn open(srv: &TestServer, token: Option<&str>) -> Ws {
    let (ws, _) = connect_async(srv.ws_url(token)).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: Value) {
    ws.send(Message::Text(msg.to_string())).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next()).await.expect("timed out waiting for a frame");
        match frame.expect("socket closed").unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

/// Asserts nothing arrives within a short window.
async fn expect_quiet(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
        panic!("unexpected message {}", text);
    }
}

async fn subscribe(ws: &mut Ws, id: &str, path: &str, events: Value) {
    send(ws, json!({"action": "subscribe", "id": id, "path": path, "events": events})).await;
    let ack = next_json(ws).await;
    assert_eq!(ack, json!({"type": "ack", "action": "subscribe", "id": id}));
}

#[tokio::test]
async fn subscriber_sees_writes_in_order() {
    let srv = start(Some(open_rules()), |_| {}).await;
    let admin = srv.admin_token().await;
    let mut ws = open(&srv, None).await;
    subscribe(&mut ws, "c", "/counter", json!(["value"])).await;

    for n in 5..=7 {
        assert_eq!(srv.put("/counter", Some(&admin), json!(n)).await.status(), 200);
    }
    let mut seen = Vec::new();
    let mut last_seq = 0;
    for _ in 0..3 {
        let ev = next_json(&mut ws).await;
        assert_eq!(ev["type"], "event");
        assert_eq!(ev["subscription"], "c");
        assert_eq!(ev["event"], "value");
        let seq = ev["seq"].as_u64().unwrap();
        assert!(seq > last_seq);
        last_seq = seq;
        seen.push(ev["value"].clone());
    }
    assert_eq!(seen, vec![json!(5), json!(6), json!(7)]);
}

#[tokio::test]
async fn denied_event_is_skipped_but_subscription_stays() {
    let srv = start(Some(open_rules()), |_| {}).await;
    let admin = srv.admin_token().await;
    let mut ws = open(&srv, None).await;
    subscribe(&mut ws, "p", "/private/doc", json!(["value"])).await;

    srv.put("/private/doc", Some(&admin), json!({"public": false, "body": "draft"})).await;
    expect_quiet(&mut ws).await;

    srv.put("/private/doc", Some(&admin), json!({"public": true, "body": "final"})).await;
    let ev = next_json(&mut ws).await;
    assert_eq!(ev["value"]["body"], "final");
}

#[tokio::test]
async fn dropped_socket_leaves_other_clients_alone() {
    let srv = start(Some(open_rules()), |_| {}).await;
    let admin = srv.admin_token().await;
    let mut a = open(&srv, None).await;
    let mut b = open(&srv, None).await;
    subscribe(&mut a, "a", "/counter", json!(["value"])).await;
    subscribe(&mut b, "b", "/counter", json!(["value"])).await;

    srv.put("/counter", Some(&admin), json!(1)).await;
    next_json(&mut a).await;
    next_json(&mut b).await;
    drop(a);

    for n in 2..=4 {
        srv.put("/counter", Some(&admin), json!(n)).await;
    }
    for n in 2..=4 {
        assert_eq!(next_json(&mut b).await["value"], json!(n));
    }

    let mut clients = usize::MAX;
    for _ in 0..50 {
        clients = srv.state.realtime.stats().await.unwrap().clients;
        if clients == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(clients, 1);
}

#[tokio::test]
async fn signin_over_the_socket_changes_what_is_readable() {
    let rules = json!({"rules": {".read": "auth !== null", ".write": "auth !== null"}});
    let srv = start(Some(rules), |_| {}).await;
    let admin = srv.admin_token().await;
    let mut ws = open(&srv, None).await;

    send(&mut ws, json!({"action": "subscribe", "id": "m", "path": "/msgs"})).await;
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "access_denied");
    assert_eq!(err["id"], "m");

    send(&mut ws, json!({"action": "signin", "token": admin})).await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "ack", "action": "signin", "uid": "admin"}));
    subscribe(&mut ws, "m", "/msgs", json!(["value"])).await;

    send(&mut ws, json!({"action": "signin", "token": "garbage"})).await;
    assert_eq!(next_json(&mut ws).await["code"], "unauthenticated");

    send(&mut ws, json!({"action": "bogus"})).await;
    assert_eq!(next_json(&mut ws).await["code"], "invalid_message");
}

#[tokio::test]
async fn bad_token_fails_the_handshake() {
    let srv = start(Some(open_rules()), |_| {}).await;
    let err = connect_async(srv.ws_url(Some("not-a-token"))).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 401),
        other => panic!("expected an HTTP rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn writer_context_is_delivered_with_the_event() {
    let srv = start(Some(open_rules()), |_| {}).await;
    let admin = srv.admin_token().await;
    let mut ws = open(&srv, None).await;
    subscribe(&mut ws, "r", "/rooms/1", json!(["child_added"])).await;

    let resp = srv
        .http
        .put(srv.url("/data/rooms/1/alice"))
        .bearer_auth(&admin)
        .header("canopy-context", r#"{"device": "phone"}"#)
        .json(&json!({"online": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let ev = next_json(&mut ws).await;
    assert_eq!(ev["event"], "child_added");
    assert_eq!(ev["key"], "alice");
    assert_eq!(ev["context"], json!({"device": "phone"}));
}

#[tokio::test]
async fn socket_context_header_is_kept_on_the_connection() {
    let rules = json!({"rules": {".read": "context.app === 'console'"}});
    let srv = start(Some(rules), |_| {}).await;

    let mut request = srv.ws_url(None).into_client_request().unwrap();
    request.headers_mut().insert("canopy-context", r#"{"app": "console"}"#.parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();
    subscribe(&mut ws, "s", "/status", json!(["value"])).await;

    let mut plain = open(&srv, None).await;
    send(&mut plain, json!({"action": "subscribe", "id": "s", "path": "/status"})).await;
    assert_eq!(next_json(&mut plain).await["code"], "access_denied");
}
