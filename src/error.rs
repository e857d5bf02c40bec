//! Unified application error model and mapping helpers.
//! Component errors (authentication, provider, rule loading) stay in their own modules;
//! this enum is what the HTTP and WebSocket frontends report. Messages for authentication
//! and authorization failures are fixed strings so they never leak the denying rule or data.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::federation::ProviderError;
use crate::identity::AuthenticationError;
use crate::rules::RuleLoadError;
use crate::storage::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    UserInput { code: String, message: String },
    NotFound { code: String, message: String },
    Conflict { code: String, message: String },
    Authentication { code: String, message: String },
    Authorization { code: String, message: String },
    Provider { code: String, message: String },
    RuleLoad { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Authentication { code, .. }
            | AppError::Authorization { code, .. }
            | AppError::Provider { code, .. }
            | AppError::RuleLoad { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Authentication { message, .. }
            | AppError::Authorization { message, .. }
            | AppError::Provider { message, .. }
            | AppError::RuleLoad { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user<S: Into<String>>(code: S, msg: S) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn provider<S: Into<String>>(code: S, msg: S) -> Self { AppError::Provider { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Authentication failures never carry detail beyond "unauthenticated".
    pub fn unauthenticated() -> Self {
        AppError::Authentication { code: "unauthenticated".into(), message: "unauthenticated".into() }
    }

    /// Authorization failures never reveal the rule or the data behind the decision.
    pub fn access_denied() -> Self {
        AppError::Authorization { code: "access_denied".into(), message: "access denied".into() }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Authentication { .. } => 401,
            AppError::Authorization { .. } => 403,
            AppError::Provider { .. } => 502,
            AppError::RuleLoad { .. } => 422,
            AppError::Internal { .. } => 500,
        }
    }

    /// JSON body shared by HTTP responses and WebSocket error frames.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({"status": "error", "code": self.code_str(), "message": self.message()})
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StoreError>() {
            Ok(e) => e.into(),
            Err(err) => AppError::Internal { code: "internal_error".into(), message: err.to_string() },
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPath(msg) => AppError::user("invalid_path".to_string(), msg),
            StoreError::Conflict(msg) => AppError::conflict("write_conflict".to_string(), msg),
        }
    }
}

impl From<AuthenticationError> for AppError {
    fn from(err: AuthenticationError) -> Self {
        match err {
            AuthenticationError::SignupDisabled => AppError::Authorization { code: "signup_disabled".into(), message: err.to_string() },
            AuthenticationError::UsernameTaken => AppError::conflict("username_taken", "username is already in use"),
            AuthenticationError::WeakPassword(_) | AuthenticationError::InvalidInput(_) => AppError::user("invalid_input".to_string(), err.to_string()),
            AuthenticationError::Internal(msg) => AppError::internal("internal_error".to_string(), msg),
            AuthenticationError::Provider(e) => e.into(),
            _ => AppError::unauthenticated(),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::UnknownProvider(name) => AppError::not_found("unknown_provider".to_string(), format!("no provider '{}'", name)),
            ProviderError::Unsupported(what) => AppError::user("unsupported".to_string(), what),
            ProviderError::Remote { code, description, .. } => AppError::provider(code, description),
            other => AppError::provider("provider_error".to_string(), other.to_string()),
        }
    }
}

impl From<RuleLoadError> for AppError {
    fn from(err: RuleLoadError) -> Self {
        AppError::RuleLoad { code: "rule_load_error".into(), message: err.to_string() }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
