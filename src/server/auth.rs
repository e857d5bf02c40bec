//! `/auth/*` and `/oauth2/*` handlers.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{blocking, request_context, AppState};
use crate::error::AppError;
use crate::identity::{Account, Credentials, Session, SignupRequest};

fn session_body(account: Option<&Account>, session: &Session) -> Value {
    json!({
        "status": "ok",
        "token": session.token,
        "expiresAt": session.expires_at,
        "user": account.map(|a| a.public_view()).unwrap_or(Value::Null),
    })
}

pub async fn signin(State(state): State<AppState>, Json(payload): Json<Credentials>) -> Result<impl IntoResponse, AppError> {
    let auth = state.auth.clone();
    let session = blocking(move || auth.login(&payload)).await?;
    Ok(Json(session_body(state.auth.account(&session.uid).as_ref(), &session)))
}

pub async fn signup(State(state): State<AppState>, Json(payload): Json<SignupRequest>) -> Result<impl IntoResponse, AppError> {
    let auth = state.auth.clone();
    let (account, session) = blocking(move || auth.signup(&payload)).await?;
    Ok(Json(session_body(Some(&account), &session)))
}

/// Who the bearer token belongs to; anonymous callers get `signedIn: false`.
pub async fn session_state(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers, None)?;
    let user = ctx.auth.uid.as_deref().and_then(|uid| state.auth.account(uid));
    Ok(Json(json!({
        "status": "ok",
        "signedIn": user.is_some(),
        "user": user.map(|a| a.public_view()).unwrap_or(Value::Null),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordPayload {
    pub old_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ChangePasswordPayload>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers, None)?;
    let Some(uid) = ctx.auth.uid.clone() else { return Err(AppError::unauthenticated()) };
    let auth = state.auth.clone();
    blocking(move || auth.change_password(&uid, &payload.old_password, &payload.new_password)).await?;
    Ok(Json(json!({"status": "ok"})))
}

#[derive(Debug, Deserialize)]
pub struct InitParams {
    pub redirect_url: String,
}

pub async fn oauth_init(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<InitParams>,
) -> Result<impl IntoResponse, AppError> {
    if url::Url::parse(&params.redirect_url).is_err() {
        return Err(AppError::user("invalid_redirect_url", "redirect_url must be an absolute URL"));
    }
    let (state_token, url) = state.auth.begin_federated(&provider, &params.redirect_url)?;
    info!(target: "auth", provider = %provider, "federated sign-in started");
    Ok(Json(json!({"status": "ok", "provider": provider, "state": state_token, "redirectUrl": url})))
}

/// Providers report a refused consent as `error`/`error_description` instead of a code.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(code) = params.error {
        return Err(AppError::provider(code, params.error_description.unwrap_or_default()));
    }
    let (Some(code), Some(flow_state)) = (params.code, params.state) else {
        return Err(AppError::user("invalid_callback", "code and state are required"));
    };
    let (account, session) = state.auth.complete_federated(&provider, &code, &flow_state).await?;
    Ok(Json(session_body(Some(&account), &session)))
}
