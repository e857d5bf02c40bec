use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    authorization_url, get_json, str_field, take_other, token_request, AuthorizeOptions, FederatedProfile, OAuthProvider,
    Picture, ProviderError, ProviderSettings, ProviderToken,
};

pub const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
pub const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const API_URL: &str = "https://api.github.com";

pub struct GithubProvider {
    name: String,
    settings: ProviderSettings,
    client: reqwest::Client,
}

impl GithubProvider {
    pub fn new(name: &str, settings: ProviderSettings, client: reqwest::Client) -> Self {
        GithubProvider { name: name.to_string(), settings, client }
    }

    fn token_url(&self) -> &str { self.settings.token_url.as_deref().unwrap_or(TOKEN_URL) }
}

/// Normalize `GET /user`, using `GET /user/emails` (when available) for the verified address.
pub fn normalize_profile(user: &Value, emails: Option<&Value>) -> Result<FederatedProfile, ProviderError> {
    let obj = user.as_object().ok_or_else(|| ProviderError::InvalidResponse("user is not an object".into()))?;
    let id = match obj.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return Err(ProviderError::InvalidResponse("user has no 'id'".into())),
    };
    let login = str_field(obj, "login");
    let primary = emails
        .and_then(|v| v.as_array())
        .and_then(|list| list.iter().find(|e| e.get("primary").and_then(|p| p.as_bool()).unwrap_or(false)));
    let (email, email_verified) = match primary {
        Some(e) => (
            e.get("email").and_then(|v| v.as_str()).map(|s| s.to_string()),
            e.get("verified").and_then(|v| v.as_bool()).unwrap_or(false),
        ),
        None => (str_field(obj, "email"), false),
    };
    Ok(FederatedProfile {
        id,
        display_name: str_field(obj, "name").or_else(|| login.clone()),
        name: login,
        picture: str_field(obj, "avatar_url").map(|u| vec![Picture::url(&u)]).unwrap_or_default(),
        email,
        email_verified,
        other: take_other(obj, &["id", "login", "name", "avatar_url", "email"]),
    })
}

#[async_trait]
impl OAuthProvider for GithubProvider {
    fn name(&self) -> &str { &self.name }

    fn build_authorization_url(&self, state: &str, redirect_url: &str, options: &AuthorizeOptions) -> Result<String, ProviderError> {
        let default_scopes = ["read:user".to_string(), "user:email".to_string()];
        let scopes = options.scopes.as_deref().unwrap_or(if self.settings.scopes.is_empty() { &default_scopes[..] } else { &self.settings.scopes[..] });
        let base = self.settings.authorize_url.as_deref().unwrap_or(AUTHORIZE_URL);
        authorization_url(base, &self.settings.client_id, redirect_url, state, scopes, " ", &options.extra)
    }

    async fn exchange_authorization_code(&self, code: &str, redirect_url: &str) -> Result<ProviderToken, ProviderError> {
        token_request(
            &self.client,
            self.token_url(),
            &[
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
            return Err(ProviderError::Unsupported("github tokens without expiry cannot be refreshed".into()));
        };
        token_request(
            &self.client,
            self.token_url(),
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh),
                ("client_id", self.settings.client_id.as_str()),
                ("client_secret", self.settings.client_secret.as_str()),
            ],
        )
        .await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<FederatedProfile, ProviderError> {
        let user_url = self.settings.profile_url.clone().unwrap_or_else(|| format!("{}/user", API_URL));
        let user = get_json(&self.client, &user_url, Some(access_token)).await?;
        let emails_url = self.settings.emails_url.clone().unwrap_or_else(|| format!("{}/user/emails", API_URL));
        // The emails endpoint needs the user:email scope; without it fall back to the public address.
        let emails = get_json(&self.client, &emails_url, Some(access_token)).await.ok();
        normalize_profile(&user, emails.as_ref())
    }

    async fn revoke_access(&self, access_token: &str) -> Result<(), ProviderError> {
        let url = self
            .settings
            .revoke_url
            .clone()
            .unwrap_or_else(|| format!("{}/applications/{}/grant", API_URL, self.settings.client_id));
        let resp = self
            .client
            .delete(&url)
            .basic_auth(&self.settings.client_id, Some(&self.settings.client_secret))
            .header(reqwest::header::USER_AGENT, "canopy")
            .json(&json!({"access_token": access_token}))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Err(ProviderError::Remote {
            status: Some(status.as_u16()),
            code: format!("http_{}", status.as_u16()),
            description: body.get("message").and_then(|v| v.as_str()).unwrap_or("revocation failed").to_string(),
        })
    }
}
