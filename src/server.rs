//!
//! canopy HTTP/WS server
//! ---------------------
//! Axum routes over the tree store. Every request resolves its bearer token to an
//! [`AuthContext`] and every data operation goes through the rule engine first;
//! administrators bypass rules at this boundary.
//!
//! Responsibilities:
//! - password sign-in, signup, password change and session state (`/auth/*`)
//! - federated sign-in through configured OAuth2 providers (`/oauth2/*`)
//! - rule-gated data reads and writes (`/data/*`)
//! - admin operations: rules reload and salt rotation (`/admin/*`)
//! - the realtime WebSocket channel (`/ws`)
//! - startup: rules file, tree snapshot, accounts, administrator bootstrap, the
//!   dispatcher task and the rules file watcher

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use tracing::{info, warn};

use crate::config::ServerSettings;
use crate::error::AppError;
use crate::federation::ProviderRegistry;
use crate::identity::{
    bearer_token, parse_context_header, AccountStore, AuthContext, AuthenticationError, BootstrapOutcome, RequestContext,
    SessionAuthority, SessionSigner,
};
use crate::realtime::{spawn_dispatcher, Dispatcher, DispatcherHandle};
use crate::rules::{ensure_rules_file, rules_file_path, RuleEngine};
use crate::storage::SharedTree;

pub mod admin;
pub mod auth;
pub mod data;
pub mod ws;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub tree: SharedTree,
    pub rules: Arc<RuleEngine>,
    pub auth: Arc<SessionAuthority>,
    pub realtime: DispatcherHandle,
    pub settings: Arc<ServerSettings>,
}

/// Result of [`bootstrap`]: the state plus the administrator password when one was
/// generated on this start. It is not kept anywhere else.
pub struct Bootstrapped {
    pub state: AppState,
    pub generated_admin_password: Option<String>,
}

fn log_startup_folders(settings: &ServerSettings) {
    let cwd = std::env::current_dir().ok();
    let db_env = std::env::var("CANOPY_DB_FOLDER").ok();
    info!(
        target: "startup",
        "canopy starting. cwd={:?}, db_root={:?}, CANOPY_DB_FOLDER_env={:?}",
        cwd, settings.db_root, db_env
    );
}

/// Open everything under the database root and start the background tasks.
/// Must run inside a tokio runtime.
pub async fn bootstrap(settings: ServerSettings) -> anyhow::Result<Bootstrapped> {
    log_startup_folders(&settings);
    let db_root = settings.db_root.clone();
    std::fs::create_dir_all(&db_root).with_context(|| format!("Failed to create or access database root: {}", db_root.display()))?;

    let rules_path = rules_file_path(&db_root);
    if ensure_rules_file(&rules_path, settings.default_access)? {
        info!(target: "startup", "wrote default rules ({:?}) to {}", settings.default_access, rules_path.display());
    }
    let rules = Arc::new(RuleEngine::from_file(&rules_path).with_context(|| format!("While loading rules from {}", rules_path.display()))?);

    let tree = SharedTree::open(&db_root, &settings.persistence).with_context(|| format!("While opening tree under {}", db_root.display()))?;

    let signer = SessionSigner::open(&db_root, Duration::from_secs(settings.token_ttl_secs))?;
    let accounts = AccountStore::open(&db_root)?;
    let http = reqwest::Client::builder().timeout(Duration::from_secs(20)).build()?;
    let providers = ProviderRegistry::from_settings(&settings.providers, http);
    if !providers.names().is_empty() {
        info!(target: "startup", "oauth2 providers: {}", providers.names().join(", "));
    }
    let authority = SessionAuthority::new(signer, accounts, providers, settings.allow_user_signup);
    let generated_admin_password = match authority.bootstrap_admin(settings.admin_password.as_deref())? {
        BootstrapOutcome::Existing => None,
        BootstrapOutcome::Created { generated_password } => generated_password,
    };

    let dispatcher = Dispatcher::new(rules.clone(), Arc::new(tree.clone()));
    let (realtime, _task) = spawn_dispatcher(dispatcher, tree.subscribe_changes());

    if settings.rules_poll_secs > 0 {
        spawn_rules_watcher(rules.clone(), Duration::from_secs(settings.rules_poll_secs));
    } else {
        info!(target: "startup", "rules file watcher disabled");
    }

    let state = AppState { tree, rules, auth: Arc::new(authority), realtime, settings: Arc::new(settings) };
    Ok(Bootstrapped { state, generated_admin_password })
}

/// Poll the rules file and hot-swap the tree when it changes. Rejected files are
/// logged by the engine and the active rules stay.
fn spawn_rules_watcher(rules: Arc<RuleEngine>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Ok(true) = rules.reload_if_changed() {
                info!(target: "rules", "rules file change applied");
            }
        }
    });
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "canopy ok" }))
        .route("/auth/signin", post(auth::signin))
        .route("/auth/signup", post(auth::signup))
        .route("/auth/state", get(auth::session_state))
        .route("/auth/change_password", post(auth::change_password))
        .route("/oauth2/{provider}/init", get(auth::oauth_init))
        .route("/oauth2/{provider}/callback", get(auth::oauth_callback))
        .route("/data", get(data::get_root).put(data::put_root).patch(data::patch_root).delete(data::delete_root))
        .route("/data/{*path}", get(data::get_value).put(data::put_value).patch(data::patch_value).delete(data::delete_value))
        .route("/admin/rules/reload", post(admin::reload_rules))
        .route("/admin/auth/rotate_salt", post(admin::rotate_salt))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    serve_with_shutdown(listener, state, std::future::pending()).await
}

/// Serve until `shutdown` resolves and in-flight requests finish, then write a
/// final tree snapshot.
pub async fn serve_with_shutdown<F>(listener: tokio::net::TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let tree = state.tree.clone();
    axum::serve(listener, router(state)).with_graceful_shutdown(shutdown).await?;
    info!(target: "startup", "server stopped; saving snapshot (last seq {})", tree.last_seq());
    tokio::task::spawn_blocking(move || tree.save_snapshot()).await?.context("final snapshot")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "startup", "cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!(target: "startup", "shutdown requested");
}

/// Start the canopy server with the given settings.
pub async fn run_with_settings(settings: ServerSettings) -> anyhow::Result<()> {
    let port = settings.http_port;
    let Bootstrapped { state, generated_admin_password } = bootstrap(settings).await?;
    if let Some(pw) = generated_admin_password {
        // Shown once; only the hash is stored.
        println!("Generated administrator password for 'admin': {}", pw);
        warn!(target: "startup", "administrator password was generated; set CANOPY_ADMIN_PASSWORD to choose one");
    }
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    info!(target: "startup", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    serve_with_shutdown(listener, state, shutdown_signal()).await
}

/// Resolve the caller of a request. No token means anonymous; a bad token is a 401.
pub(crate) fn request_context(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> Result<RequestContext, AppError> {
    let token = bearer_token(headers).or_else(|| query_token.filter(|t| !t.is_empty()).map(|t| t.to_string()));
    let context = parse_context_header(headers);
    let auth = match token.as_deref() {
        Some(t) => state.auth.verify(t).map_err(|e| {
            tracing::debug!(target: "http", "token rejected: {}", e);
            AppError::unauthenticated()
        })?,
        None => AuthContext::anonymous(),
    };
    let request_id = headers.get("x-request-id").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    Ok(RequestContext { auth: auth.with_context(context), token, request_id })
}

/// Run an argon2-bound identity call off the async workers.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AuthenticationError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::internal("internal_error".to_string(), e.to_string()))?
        .map_err(AppError::from)
}
