use axum::http::HeaderMap;
use serde_json::{Map, Value};

use super::AuthContext;

/// Header carrying the client-declared request context as a JSON object.
pub const CONTEXT_HEADER: &str = "canopy-context";

/// What the route layer knows about the caller of one request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub auth: AuthContext,
    pub token: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn anonymous() -> Self { Self::default() }
}

/// Token from `Authorization: Bearer <token>`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() { None } else { Some(token.to_string()) }
}

/// Parse the context header. Anything but a JSON object is ignored.
pub fn parse_context_header(headers: &HeaderMap) -> Map<String, Value> {
    headers
        .get(CONTEXT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| serde_json::from_str::<Value>(s).ok())
        .and_then(|v| match v {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .unwrap_or_default()
}
