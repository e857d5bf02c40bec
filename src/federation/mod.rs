//!
//! canopy federation module
//! ------------------------
//! Third-party OAuth2 sign-in normalized to one [`FederatedProfile`] shape.
//!
//! Each vendor is an independent [`OAuthProvider`] built from its
//! [`ProviderSettings`]; a [`ProviderRegistry`] selects one by name. Vendors only
//! differ in endpoints and field names, so the HTTP exchange helpers live here
//! and the variants supply URLs and a pure profile normalizer.

pub mod facebook;
pub mod github;
pub mod google;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("provider error {code}: {description}")]
    Remote { status: Option<u16>, code: String, description: String },
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self { ProviderError::Transport(e.to_string()) }
}

/// Settings for one provider, read from `auth_providers.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    /// Variant to build (`google`, `github`, `facebook`); defaults to the entry name.
    #[serde(default)]
    pub kind: Option<String>,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub authorize_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub emails_url: Option<String>,
    #[serde(default)]
    pub revoke_url: Option<String>,
    #[serde(default)]
    pub discovery_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Picture {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Picture {
    pub fn url(url: &str) -> Self { Picture { url: url.to_string(), width: None, height: None } }
}

/// Provider-agnostic identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedProfile {
    pub id: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub picture: Vec<Picture>,
    pub email: Option<String>,
    pub email_verified: bool,
    /// Vendor fields with no normalized counterpart, verbatim.
    pub other: Map<String, Value>,
}

/// Extra parameters for [`OAuthProvider::build_authorization_url`].
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// Replaces the configured scopes when set.
    pub scopes: Option<Vec<String>>,
    pub extra: BTreeMap<String, String>,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Authorization redirect URL. No network access.
    fn build_authorization_url(&self, state: &str, redirect_url: &str, options: &AuthorizeOptions) -> Result<String, ProviderError>;

    async fn exchange_authorization_code(&self, code: &str, redirect_url: &str) -> Result<ProviderToken, ProviderError>;

    async fn refresh_token(&self, token: &ProviderToken) -> Result<ProviderToken, ProviderError>;

    async fn fetch_profile(&self, access_token: &str) -> Result<FederatedProfile, ProviderError>;

    async fn revoke_access(&self, _access_token: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported(format!("{} does not support revocation", self.name())))
    }
}

/// Build `base?client_id=..&redirect_uri=..&response_type=code&scope=..&state=..` plus extras.
pub(crate) fn authorization_url(
    base: &str,
    client_id: &str,
    redirect_url: &str,
    state: &str,
    scopes: &[String],
    scope_sep: &str,
    extra: &BTreeMap<String, String>,
) -> Result<String, ProviderError> {
    let mut url = url::Url::parse(base).map_err(|e| ProviderError::Config(format!("authorize url '{}': {}", base, e)))?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("client_id", client_id);
        q.append_pair("redirect_uri", redirect_url);
        q.append_pair("response_type", "code");
        if !scopes.is_empty() {
            q.append_pair("scope", &scopes.join(scope_sep));
        }
        q.append_pair("state", state);
        for (k, v) in extra {
            q.append_pair(k, v);
        }
    }
    Ok(url.to_string())
}

/// Pull an error code/description out of a provider error payload, if it is one.
/// Handles the OAuth2 form (`error`, `error_description`) and the Graph API form
/// (`error: {message, type, code}`).
pub(crate) fn remote_error(status: Option<u16>, body: &Value) -> Option<ProviderError> {
    match body.get("error") {
        Some(Value::String(code)) => Some(ProviderError::Remote {
            status,
            code: code.clone(),
            description: body
                .get("error_description")
                .or_else(|| body.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        }),
        Some(Value::Object(obj)) => Some(ProviderError::Remote {
            status,
            code: obj
                .get("type")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| obj.get("code").map(|v| v.to_string()))
                .unwrap_or_else(|| "error".to_string()),
            description: obj.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        }),
        _ => None,
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value, ProviderError> {
    let status = resp.status();
    let text = resp.text().await?;
    let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
    if let Some(err) = remote_error(Some(status.as_u16()), &body) {
        return Err(err);
    }
    if !status.is_success() {
        let description = body.get("message").and_then(|v| v.as_str()).map(|s| s.to_string()).unwrap_or(text);
        return Err(ProviderError::Remote { status: Some(status.as_u16()), code: format!("http_{}", status.as_u16()), description });
    }
    if body.is_null() {
        return Err(ProviderError::InvalidResponse("response body is not JSON".into()));
    }
    Ok(body)
}

/// POST a token request as a form and parse the token response.
pub(crate) async fn token_request(client: &reqwest::Client, token_url: &str, form: &[(&str, &str)]) -> Result<ProviderToken, ProviderError> {
    debug!(target: "auth", "token request to {}", token_url);
    let resp = client
        .post(token_url)
        .header(ACCEPT, "application/json")
        .header(USER_AGENT, "canopy")
        .form(form)
        .send()
        .await?;
    let body = read_json(resp).await?;
    serde_json::from_value(body).map_err(|e| ProviderError::InvalidResponse(format!("token response: {}", e)))
}

/// GET a JSON document with a bearer token.
pub(crate) async fn get_json(client: &reqwest::Client, url: &str, access_token: Option<&str>) -> Result<Value, ProviderError> {
    let mut req = client.get(url).header(ACCEPT, "application/json").header(USER_AGENT, "canopy");
    if let Some(tok) = access_token {
        req = req.bearer_auth(tok);
    }
    read_json(req.send().await?).await
}

/// Split `obj` into the named fields and the untouched remainder.
pub(crate) fn take_other(obj: &Map<String, Value>, mapped: &[&str]) -> Map<String, Value> {
    obj.iter().filter(|(k, _)| !mapped.contains(&k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect()
}

pub(crate) fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string())
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn OAuthProvider>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self { ProviderRegistry { providers: HashMap::new() } }

    /// Build one provider per settings entry. Entries with an unknown kind are skipped with a warning.
    pub fn from_settings(settings: &BTreeMap<String, ProviderSettings>, client: reqwest::Client) -> Self {
        let mut reg = Self::empty();
        for (name, s) in settings {
            let kind = s.kind.clone().unwrap_or_else(|| name.clone());
            let provider: Arc<dyn OAuthProvider> = match kind.as_str() {
                "google" => Arc::new(google::GoogleProvider::new(name, s.clone(), client.clone())),
                "github" => Arc::new(github::GithubProvider::new(name, s.clone(), client.clone())),
                "facebook" => Arc::new(facebook::FacebookProvider::new(name, s.clone(), client.clone())),
                other => {
                    warn!(target: "auth", "skipping provider '{}': unknown kind '{}'", name, other);
                    continue;
                }
            };
            reg.register(provider);
        }
        reg
    }

    pub fn register(&mut self, provider: Arc<dyn OAuthProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn OAuthProvider>, ProviderError> {
        self.providers.get(name).cloned().ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut v: Vec<String> = self.providers.keys().cloned().collect();
        v.sort();
        v
    }
}
