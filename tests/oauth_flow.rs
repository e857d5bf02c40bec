mod common;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use canopy::config::ServerSettings;
use canopy::federation::ProviderSettings;
use common::{start, TestServer};
use serde_json::{json, Value};

#[derive(Clone)]
struct Mock {
    base: String,
    discovery_hits: Arc<AtomicUsize>,
}

async fn token(Form(form): Form<HashMap<String, String>>) -> Response {
    if form.get("code").map(String::as_str) == Some("bad") {
        let body = json!({"error": "bad_verification_code", "error_description": "The code passed is incorrect or expired."});
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
    Json(json!({"access_token": "mock-access", "token_type": "bearer", "scope": "read:user"})).into_response()
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer mock-access")
}

async fn github_user(headers: HeaderMap) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"id": 42, "login": "octocat", "name": "Octo Cat", "avatar_url": "https://example.com/o.png"})).into_response()
}

async fn github_emails(headers: HeaderMap) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!([
        {"email": "old@example.com", "primary": false, "verified": true},
        {"email": "octo@example.com", "primary": true, "verified": true}
    ]))
    .into_response()
}

async fn discovery(State(mock): State<Mock>) -> Json<Value> {
    mock.discovery_hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "authorization_endpoint": format!("{}/authorize", mock.base),
        "token_endpoint": format!("{}/token", mock.base),
        "userinfo_endpoint": format!("{}/userinfo", mock.base)
    }))
}

async fn userinfo(headers: HeaderMap) -> Response {
    if !bearer_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"sub": "g-7", "email": "gee@example.com", "email_verified": true, "name": "Gee Example"})).into_response()
}

async fn start_mock() -> Mock {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mock = Mock { base: format!("http://{}", listener.local_addr().unwrap()), discovery_hits: Arc::new(AtomicUsize::new(0)) };
    let app = Router::new()
        .route("/token", post(token))
        .route("/user", get(github_user))
        .route("/user/emails", get(github_emails))
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/userinfo", get(userinfo))
        .with_state(mock.clone());
    tokio::spawn(async move { axum::serve(listener, app).await });
    mock
}

fn providers(mock: &Mock) -> BTreeMap<String, ProviderSettings> {
    let mut map = BTreeMap::new();
    map.insert(
        "github".to_string(),
        ProviderSettings {
            kind: Some("github".into()),
            client_id: "gh-client".into(),
            client_secret: "gh-secret".into(),
            authorize_url: Some(format!("{}/authorize", mock.base)),
            token_url: Some(format!("{}/token", mock.base)),
            profile_url: Some(format!("{}/user", mock.base)),
            emails_url: Some(format!("{}/user/emails", mock.base)),
            ..ProviderSettings::default()
        },
    );
    map.insert(
        "google".to_string(),
        ProviderSettings {
            kind: Some("google".into()),
            client_id: "g-client".into(),
            client_secret: "g-secret".into(),
            discovery_url: Some(format!("{}/.well-known/openid-configuration", mock.base)),
            ..ProviderSettings::default()
        },
    );
    map
}

async fn start_with_providers(mock: &Mock, allow_signup: bool) -> TestServer {
    let providers = providers(mock);
    start(None, move |s: &mut ServerSettings| {
        s.providers = providers;
        s.allow_user_signup = allow_signup;
    })
    .await
}

async fn init(srv: &TestServer, provider: &str) -> reqwest::Response {
    srv.http
        .get(srv.url(&format!("/oauth2/{}/init", provider)))
        .query(&[("redirect_url", "http://localhost:5173/auth/callback")])
        .send()
        .await
        .unwrap()
}

async fn begin(srv: &TestServer, provider: &str) -> String {
    let resp = init(srv, provider).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let redirect = body["redirectUrl"].as_str().unwrap();
    assert!(redirect.contains("client_id="), "{redirect}");
    body["state"].as_str().unwrap().to_string()
}

async fn callback(srv: &TestServer, provider: &str, code: &str, state: &str) -> reqwest::Response {
    srv.http
        .get(srv.url(&format!("/oauth2/{}/callback", provider)))
        .query(&[("code", code), ("state", state)])
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn github_login_creates_then_reuses_the_account() {
    let mock = start_mock().await;
    let srv = start_with_providers(&mock, true).await;

    let state = begin(&srv, "github").await;
    let resp = callback(&srv, "github", "good", &state).await;
    assert_eq!(resp.status(), 200);
    let first: Value = resp.json().await.unwrap();
    assert_eq!(first["user"]["username"], "octocat");
    assert_eq!(first["user"]["email"], "octo@example.com");
    assert_eq!(first["user"]["displayName"], "Octo Cat");
    assert_eq!(first["user"]["providers"], json!(["github"]));

    let token = first["token"].as_str().unwrap();
    let session: Value = srv.http.get(srv.url("/auth/state")).bearer_auth(token).send().await.unwrap().json().await.unwrap();
    assert_eq!(session["signedIn"], json!(true));

    let state = begin(&srv, "github").await;
    let second: Value = callback(&srv, "github", "good", &state).await.json().await.unwrap();
    assert_eq!(second["user"]["uid"], first["user"]["uid"]);
}

#[tokio::test]
async fn state_values_are_single_use() {
    let mock = start_mock().await;
    let srv = start_with_providers(&mock, true).await;
    let state = begin(&srv, "github").await;
    assert_eq!(callback(&srv, "github", "good", &state).await.status(), 200);
    assert_eq!(callback(&srv, "github", "good", &state).await.status(), 401);
    assert_eq!(callback(&srv, "github", "good", "never-issued").await.status(), 401);

    let google_state = begin(&srv, "google").await;
    assert_eq!(callback(&srv, "github", "good", &google_state).await.status(), 401);
}

#[tokio::test]
async fn unknown_identity_is_refused_when_signup_is_disabled() {
    let mock = start_mock().await;
    let srv = start_with_providers(&mock, false).await;
    let state = begin(&srv, "github").await;
    let resp = callback(&srv, "github", "good", &state).await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "signup_disabled");
}

#[tokio::test]
async fn provider_errors_surface_their_code() {
    let mock = start_mock().await;
    let srv = start_with_providers(&mock, true).await;

    let state = begin(&srv, "github").await;
    let resp = callback(&srv, "github", "bad", &state).await;
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "bad_verification_code");

    let resp = srv
        .http
        .get(srv.url("/oauth2/github/callback"))
        .query(&[("error", "access_denied"), ("error_description", "The user has denied your application access.")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "access_denied");
}

#[tokio::test]
async fn unknown_provider_and_bad_redirect() {
    let mock = start_mock().await;
    let srv = start_with_providers(&mock, true).await;
    assert_eq!(init(&srv, "myspace").await.status(), 404);

    let resp = srv.http.get(srv.url("/oauth2/github/init")).query(&[("redirect_url", "not a url")]).send().await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn google_discovery_is_fetched_once() {
    let mock = start_mock().await;
    let srv = start_with_providers(&mock, true).await;

    for _ in 0..2 {
        let state = begin(&srv, "google").await;
        let resp = callback(&srv, "google", "good", &state).await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["user"]["email"], "gee@example.com");
    }
    assert_eq!(mock.discovery_hits.load(Ordering::SeqCst), 1);
}
