use async_trait::async_trait;
use serde_json::Value;

use super::{
    authorization_url, get_json, str_field, take_other, AuthorizeOptions, FederatedProfile, OAuthProvider, Picture,
    ProviderError, ProviderSettings, ProviderToken,
};

pub const GRAPH_URL: &str = "https://graph.facebook.com/v19.0";
pub const AUTHORIZE_URL: &str = "https://www.facebook.com/v19.0/dialog/oauth";
const PROFILE_FIELDS: &str = "id,name,email,first_name,last_name,picture.width(256).height(256)";

pub struct FacebookProvider {
    name: String,
    settings: ProviderSettings,
    client: reqwest::Client,
}

impl FacebookProvider {
    pub fn new(name: &str, settings: ProviderSettings, client: reqwest::Client) -> Self {
        FacebookProvider { name: name.to_string(), settings, client }
    }

    fn token_url(&self) -> String {
        self.settings.token_url.clone().unwrap_or_else(|| format!("{}/oauth/access_token", GRAPH_URL))
    }

    /// The Graph API token endpoint takes its parameters in the query string.
    async fn token_get(&self, params: &[(&str, &str)]) -> Result<ProviderToken, ProviderError> {
        let url = url::Url::parse_with_params(&self.token_url(), params)
            .map_err(|e| ProviderError::Config(format!("token url: {}", e)))?;
        let body = get_json(&self.client, url.as_str(), None).await?;
        serde_json::from_value(body).map_err(|e| ProviderError::InvalidResponse(format!("token response: {}", e)))
    }
}

/// Normalize a Graph API `/me` document. Facebook only returns confirmed addresses.
pub fn normalize_profile(me: &Value) -> Result<FederatedProfile, ProviderError> {
    let obj = me.as_object().ok_or_else(|| ProviderError::InvalidResponse("profile is not an object".into()))?;
    let id = str_field(obj, "id").ok_or_else(|| ProviderError::InvalidResponse("profile has no 'id'".into()))?;
    let picture = obj
        .get("picture")
        .and_then(|p| p.get("data"))
        .filter(|d| !d.get("is_silhouette").and_then(|s| s.as_bool()).unwrap_or(false))
        .and_then(|d| {
            let url = d.get("url")?.as_str()?;
            Some(Picture {
                url: url.to_string(),
                width: d.get("width").and_then(|w| w.as_u64()).map(|w| w as u32),
                height: d.get("height").and_then(|h| h.as_u64()).map(|h| h as u32),
            })
        });
    let email = str_field(obj, "email");
    Ok(FederatedProfile {
        id,
        name: str_field(obj, "name"),
        display_name: str_field(obj, "name").or_else(|| str_field(obj, "first_name")),
        picture: picture.into_iter().collect(),
        email_verified: email.is_some(),
        email,
        other: take_other(obj, &["id", "name", "email", "picture"]),
    })
}

#[async_trait]
impl OAuthProvider for FacebookProvider {
    fn name(&self) -> &str { &self.name }

    fn build_authorization_url(&self, state: &str, redirect_url: &str, options: &AuthorizeOptions) -> Result<String, ProviderError> {
        let default_scopes = ["email".to_string(), "public_profile".to_string()];
        let scopes = options.scopes.as_deref().unwrap_or(if self.settings.scopes.is_empty() { &default_scopes[..] } else { &self.settings.scopes[..] });
        let base = self.settings.authorize_url.as_deref().unwrap_or(AUTHORIZE_URL);
        authorization_url(base, &self.settings.client_id, redirect_url, state, scopes, ",", &options.extra)
    }

    async fn exchange_authorization_code(&self, code: &str, redirect_url: &str) -> Result<ProviderToken, ProviderError> {
        self.token_get(&[
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("redirect_uri", redirect_url),
            ("code", code),
        ])
        .await
    }

    /// Exchanges the token for a long-lived one.
    async fn refresh_token(&self, token: &ProviderToken) -> Result<ProviderToken, ProviderError> {
        self.token_get(&[
            ("grant_type", "fb_exchange_token"),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("fb_exchange_token", token.access_token.as_str()),
        ])
        .await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<FederatedProfile, ProviderError> {
        let base = self.settings.profile_url.clone().unwrap_or_else(|| format!("{}/me", GRAPH_URL));
        let url = url::Url::parse_with_params(&base, &[("fields", PROFILE_FIELDS)])
            .map_err(|e| ProviderError::Config(format!("profile url: {}", e)))?;
        normalize_profile(&get_json(&self.client, url.as_str(), Some(access_token)).await?)
    }

    async fn revoke_access(&self, access_token: &str) -> Result<(), ProviderError> {
        let url = self.settings.revoke_url.clone().unwrap_or_else(|| format!("{}/me/permissions", GRAPH_URL));
        let resp = self.client.delete(&url).bearer_auth(access_token).send().await?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if let Some(err) = super::remote_error(Some(status), &body) {
            return Err(err);
        }
        if !(200..300).contains(&status) {
            return Err(ProviderError::Remote { status: Some(status), code: format!("http_{}", status), description: "revocation failed".into() });
        }
        Ok(())
    }
}
