//! Google sign-in (OpenID Connect). Token, userinfo and revocation endpoints come
//! from the discovery document, which is fetched once per provider instance and
//! kept for the life of the process.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::info;

use super::{
    authorization_url, get_json, str_field, take_other, token_request, AuthorizeOptions, FederatedProfile, OAuthProvider,
    Picture, ProviderError, ProviderSettings, ProviderToken,
};

pub const DISCOVERY_URL: &str = "https://accounts.google.com/.well-known/openid-configuration";
pub const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
}

pub struct GoogleProvider {
    name: String,
    settings: ProviderSettings,
    client: reqwest::Client,
    discovery: OnceCell<Discovery>,
}

impl GoogleProvider {
    pub fn new(name: &str, settings: ProviderSettings, client: reqwest::Client) -> Self {
        GoogleProvider { name: name.to_string(), settings, client, discovery: OnceCell::new() }
    }

    async fn discovery(&self) -> Result<&Discovery, ProviderError> {
        self.discovery
            .get_or_try_init(|| async {
                let url = self.settings.discovery_url.as_deref().unwrap_or(DISCOVERY_URL);
                let doc = get_json(&self.client, url, None).await?;
                let parsed: Discovery = serde_json::from_value(doc)
                    .map_err(|e| ProviderError::InvalidResponse(format!("discovery document: {}", e)))?;
                info!(target: "auth", "{}: discovery document loaded from {}", self.name, url);
                Ok(parsed)
            })
            .await
    }

    async fn token_url(&self) -> Result<String, ProviderError> {
        match &self.settings.token_url {
            Some(u) => Ok(u.clone()),
            None => Ok(self.discovery().await?.token_endpoint.clone()),
        }
    }
}

/// Normalize an OpenID userinfo document.
pub fn normalize_profile(info: &Value) -> Result<FederatedProfile, ProviderError> {
    let obj = info.as_object().ok_or_else(|| ProviderError::InvalidResponse("userinfo is not an object".into()))?;
    let id = str_field(obj, "sub").ok_or_else(|| ProviderError::InvalidResponse("userinfo has no 'sub'".into()))?;
    let name = str_field(obj, "name");
    Ok(FederatedProfile {
        id,
        display_name: name.clone().or_else(|| str_field(obj, "given_name")),
        name,
        picture: str_field(obj, "picture").map(|u| vec![Picture::url(&u)]).unwrap_or_default(),
        email: str_field(obj, "email"),
        email_verified: obj.get("email_verified").and_then(|v| v.as_bool()).unwrap_or(false),
        other: take_other(obj, &["sub", "name", "picture", "email", "email_verified"]),
    })
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn name(&self) -> &str { &self.name }

    fn build_authorization_url(&self, state: &str, redirect_url: &str, options: &AuthorizeOptions) -> Result<String, ProviderError> {
        let default_scopes = ["openid".to_string(), "email".to_string(), "profile".to_string()];
        let scopes = options.scopes.as_deref().unwrap_or(if self.settings.scopes.is_empty() { &default_scopes[..] } else { &self.settings.scopes[..] });
        let base = self.settings.authorize_url.as_deref().unwrap_or(AUTHORIZE_URL);
        authorization_url(base, &self.settings.client_id, redirect_url, state, scopes, " ", &options.extra)
    }

    async fn exchange_authorization_code(&self, code: &str, redirect_url: &str) -> Result<ProviderToken, ProviderError> {
        let url = self.token_url().await?;
        token_request(
            &self.client,
            &url,
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_url),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ],
        )
        .await
    }

    async fn refresh_token(&self, token: &ProviderToken) -> Result<ProviderToken, ProviderError> {
        let Some(refresh) = token.refresh_token.as_deref() else {
            return Err(ProviderError::Unsupported("token carries no refresh_token".into()));
        };
        let url = self.token_url().await?;
        let mut out = token_request(
            &self.client,
            &url,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ],
        )
        .await?;
        // Google omits the refresh token on refresh responses.
        if out.refresh_token.is_none() {
            out.refresh_token = Some(refresh.to_string());
        }
        Ok(out)
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<FederatedProfile, ProviderError> {
        let url = match &self.settings.profile_url {
            Some(u) => u.clone(),
            None => self.discovery().await?.userinfo_endpoint.clone(),
        };
        normalize_profile(&get_json(&self.client, &url, Some(access_token)).await?)
    }

    async fn revoke_access(&self, access_token: &str) -> Result<(), ProviderError> {
        let url = match &self.settings.revoke_url {
            Some(u) => u.clone(),
            None => self
                .discovery()
                .await?
                .revocation_endpoint
                .clone()
                .ok_or_else(|| ProviderError::Unsupported("discovery document has no revocation_endpoint".into()))?,
        };
        let resp = self.client.post(&url).form(&[("token", access_token)]).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            return Err(super::remote_error(Some(status), &body).unwrap_or(ProviderError::Remote {
                status: Some(status),
                code: format!("http_{}", status),
                description: "revocation failed".into(),
            }));
        }
        Ok(())
    }
}
