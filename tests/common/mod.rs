#![allow(dead_code)]

use std::net::SocketAddr;

use canopy::config::ServerSettings;
use canopy::server::{bootstrap, serve, AppState};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const ADMIN_PASSWORD: &str = "admin-password-1";
pub const USER_PASSWORD: &str = "user-password-1";

pub struct TestServer {
    pub base: String,
    pub addr: SocketAddr,
    pub state: AppState,
    pub http: reqwest::Client,
    pub dir: TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String { format!("{}{}", self.base, path) }

    pub fn ws_url(&self, token: Option<&str>) -> String {
        match token {
            Some(t) => format!("ws://{}/ws?token={}", self.addr, t),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    pub async fn signin(&self, username: &str, password: &str) -> String {
        let resp = self.http.post(self.url("/auth/signin")).json(&json!({"username": username, "password": password})).send().await.unwrap();
        assert_eq!(resp.status(), 200, "signin as {username}");
        let body: Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn admin_token(&self) -> String { self.signin("admin", ADMIN_PASSWORD).await }

    /// Create a user and return `(uid, token)`. Requires signup to be enabled.
    pub async fn signup(&self, username: &str) -> (String, String) {
        let resp = self
            .http
            .post(self.url("/auth/signup"))
            .json(&json!({"username": username, "password": USER_PASSWORD}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200, "signup {username}");
        let body: Value = resp.json().await.unwrap();
        (body["user"]["uid"].as_str().unwrap().to_string(), body["token"].as_str().unwrap().to_string())
    }

    pub async fn put(&self, path: &str, token: Option<&str>, value: Value) -> reqwest::Response {
        let mut req = self.http.put(self.url(&format!("/data{}", path))).json(&value);
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        req.send().await.unwrap()
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> reqwest::Response {
        let mut req = self.http.get(self.url(&format!("/data{}", path)));
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        req.send().await.unwrap()
    }
}

/// Start a server on an ephemeral port. `rules` is written as the rules file
/// before startup; without it the default (deny) rules are generated.
pub async fn start(rules: Option<Value>, tweak: impl FnOnce(&mut ServerSettings)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    if let Some(doc) = rules {
        std::fs::write(dir.path().join("rules.json"), serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    }
    let mut settings = ServerSettings {
        db_root: dir.path().to_path_buf(),
        admin_password: Some(ADMIN_PASSWORD.to_string()),
        rules_poll_secs: 0,
        ..ServerSettings::default()
    };
    settings.persistence.enabled = false;
    tweak(&mut settings);

    let booted = bootstrap(settings).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = booted.state.clone();
    tokio::spawn(serve(listener, booted.state));
    TestServer { base: format!("http://{}", addr), addr, state, http: reqwest::Client::new(), dir }
}
