//! Administrator-only operations.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::{info, warn};

use super::{request_context, AppState};
use crate::error::AppError;
use crate::identity::RequestContext;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<RequestContext, AppError> {
    let ctx = request_context(state, headers, None)?;
    if ctx.auth.is_anonymous() {
        return Err(AppError::unauthenticated());
    }
    if !ctx.auth.is_admin() {
        warn!(target: "http", uid = ?ctx.auth.uid, "non-admin attempted an admin operation");
        return Err(AppError::access_denied());
    }
    Ok(ctx)
}

/// Re-read the rules file now. A rejected file keeps the active rules and is
/// reported back with the compile error.
pub async fn reload_rules(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    require_admin(&state, &headers)?;
    let count = state.rules.reload()?;
    Ok(Json(json!({"status": "ok", "ruleNodes": count})))
}

/// Replace the session salt. Every outstanding token, including the caller's, stops verifying.
pub async fn rotate_salt(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let ctx = require_admin(&state, &headers)?;
    state.auth.rotate_salt()?;
    info!(target: "auth", uid = ?ctx.auth.uid, "session salt rotated");
    Ok(Json(json!({"status": "ok"})))
}
