//! Sign-in flows: password login, signup, bootstrap administrator and federated
//! login through an [`OAuthProvider`]. Every flow ends in [`SessionSigner::issue`].

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::accounts::{check_password_policy, hash_password, verify_password, Account, AccountStore, ProviderLink};
use super::session::{Session, SessionSigner};
use super::{AuthContext, AuthenticationError};
use crate::federation::{AuthorizeOptions, FederatedProfile, OAuthProvider, ProviderRegistry};
use crate::tprintln;

pub const ADMIN_UID: &str = "admin";
/// Pending federated sign-ins expire after ten minutes.
pub const PENDING_FLOW_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// An administrator already existed; nothing changed.
    Existing,
    /// The administrator was created. A generated password is returned exactly once.
    Created { generated_password: Option<String> },
}

#[derive(Debug, Clone)]
struct PendingFlow {
    provider: String,
    redirect_url: String,
    created_at: i64,
}

fn random_token(len: usize) -> Result<String, AuthenticationError> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).map_err(|e| AuthenticationError::Internal(e.to_string()))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

fn validate_username(name: &str) -> Result<(), AuthenticationError> {
    let len = name.chars().count();
    if !(3..=64).contains(&len) {
        return Err(AuthenticationError::InvalidInput("username must be 3 to 64 characters".into()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) {
        return Err(AuthenticationError::InvalidInput("username may only contain letters, digits, '_', '-' and '.'".into()));
    }
    Ok(())
}

pub struct SessionAuthority {
    signer: SessionSigner,
    accounts: AccountStore,
    providers: ProviderRegistry,
    pending: Mutex<HashMap<String, PendingFlow>>,
    allow_user_signup: bool,
}

impl SessionAuthority {
    pub fn new(signer: SessionSigner, accounts: AccountStore, providers: ProviderRegistry, allow_user_signup: bool) -> Self {
        SessionAuthority { signer, accounts, providers, pending: Mutex::new(HashMap::new()), allow_user_signup }
    }

    pub fn accounts(&self) -> &AccountStore { &self.accounts }

    pub fn signer(&self) -> &SessionSigner { &self.signer }

    pub fn providers(&self) -> &ProviderRegistry { &self.providers }

    pub fn allow_user_signup(&self) -> bool { self.allow_user_signup }

    pub fn account(&self, uid: &str) -> Option<Account> { self.accounts.get(uid) }

    /// Create the administrator account unless one exists.
    pub fn bootstrap_admin(&self, password: Option<&str>) -> Result<BootstrapOutcome, AuthenticationError> {
        if self.accounts.admin_exists() {
            return Ok(BootstrapOutcome::Existing);
        }
        let (password, generated) = match password {
            Some(p) => {
                check_password_policy(p)?;
                (p.to_string(), false)
            }
            None => (random_token(18)?, true),
        };
        let mut admin = Account::new(ADMIN_UID, ADMIN_UID);
        admin.display_name = Some("Administrator".into());
        admin.is_admin = true;
        admin.password_hash = Some(hash_password(&password)?);
        self.accounts.insert(admin)?;
        info!(target: "auth", "created administrator account '{}'", ADMIN_UID);
        Ok(BootstrapOutcome::Created { generated_password: generated.then_some(password) })
    }

    fn issue_for(&self, account: &Account) -> Result<Session, AuthenticationError> {
        let now = crate::now_ms();
        self.accounts.update(&account.uid, |a| a.last_signin_at = Some(now))?;
        self.signer.issue(&account.uid, now)
    }

    pub fn login(&self, credentials: &Credentials) -> Result<Session, AuthenticationError> {
        let Some(account) = self.accounts.find_by_username(credentials.username.trim()) else {
            tprintln!("auth.login unknown user={}", credentials.username);
            return Err(AuthenticationError::InvalidCredentials);
        };
        let ok = account.password_hash.as_deref().map(|h| verify_password(h, &credentials.password)).unwrap_or(false);
        if !ok {
            return Err(AuthenticationError::InvalidCredentials);
        }
        let session = self.issue_for(&account)?;
        info!(target: "auth", uid = %account.uid, "password sign-in");
        Ok(session)
    }

    /// Resolve a token to the identity it was issued for. No I/O.
    pub fn verify(&self, token: &str) -> Result<AuthContext, AuthenticationError> {
        let session = self.signer.verify(token, crate::now_ms())?;
        let account = self.accounts.get(&session.uid).ok_or(AuthenticationError::UnknownAccount)?;
        Ok(AuthContext::for_uid(&account.uid, account.claims()))
    }

    pub fn rotate_salt(&self) -> Result<(), AuthenticationError> {
        self.signer.rotate_salt()?;
        Ok(())
    }

    pub fn signup(&self, req: &SignupRequest) -> Result<(Account, Session), AuthenticationError> {
        if !self.allow_user_signup {
            return Err(AuthenticationError::SignupDisabled);
        }
        let username = req.username.trim();
        validate_username(username)?;
        check_password_policy(&req.password)?;
        let mut account = Account::new(&uuid::Uuid::new_v4().simple().to_string(), username);
        account.email = req.email.clone().filter(|e| !e.trim().is_empty());
        account.display_name = req.display_name.clone().or_else(|| Some(username.to_string()));
        account.password_hash = Some(hash_password(&req.password)?);
        self.accounts.insert(account.clone())?;
        let session = self.issue_for(&account)?;
        info!(target: "auth", uid = %account.uid, "account created");
        Ok((self.accounts.get(&account.uid).unwrap_or(account), session))
    }

    pub fn change_password(&self, uid: &str, old_password: &str, new_password: &str) -> Result<(), AuthenticationError> {
        let account = self.accounts.get(uid).ok_or(AuthenticationError::UnknownAccount)?;
        let ok = account.password_hash.as_deref().map(|h| verify_password(h, old_password)).unwrap_or(false);
        if !ok {
            return Err(AuthenticationError::InvalidCredentials);
        }
        check_password_policy(new_password)?;
        let hash = hash_password(new_password)?;
        self.accounts.update(uid, |a| a.password_hash = Some(hash))?;
        info!(target: "auth", uid = %uid, "password changed");
        Ok(())
    }

    fn purge_pending(&self, now: i64) {
        self.pending.lock().retain(|_, f| now - f.created_at < PENDING_FLOW_TTL_MS);
    }

    /// Start a federated sign-in. Returns the `state` value and the provider redirect URL.
    pub fn begin_federated(&self, provider: &str, redirect_url: &str) -> Result<(String, String), AuthenticationError> {
        let p = self.providers.get(provider)?;
        let now = crate::now_ms();
        self.purge_pending(now);
        let state = random_token(24)?;
        let url = p.build_authorization_url(&state, redirect_url, &AuthorizeOptions::default())?;
        self.pending.lock().insert(
            state.clone(),
            PendingFlow { provider: provider.to_string(), redirect_url: redirect_url.to_string(), created_at: now },
        );
        Ok((state, url))
    }

    /// Finish a federated sign-in started by [`SessionAuthority::begin_federated`].
    /// The state is single use.
    pub async fn complete_federated(&self, provider: &str, code: &str, state: &str) -> Result<(Account, Session), AuthenticationError> {
        let now = crate::now_ms();
        let flow = self.pending.lock().remove(state).ok_or(AuthenticationError::InvalidState)?;
        if flow.provider != provider || now - flow.created_at >= PENDING_FLOW_TTL_MS {
            return Err(AuthenticationError::InvalidState);
        }
        let p: Arc<dyn OAuthProvider> = self.providers.get(provider)?;
        let token = p.exchange_authorization_code(code, &flow.redirect_url).await?;
        let profile = p.fetch_profile(&token.access_token).await?;
        let account = self.account_for_profile(provider, &profile)?;
        let session = self.issue_for(&account)?;
        info!(target: "auth", uid = %account.uid, provider = %provider, "federated sign-in");
        Ok((account, session))
    }

    /// Find the account linked to `(provider, profile.id)`, creating it when signup is allowed.
    fn account_for_profile(&self, provider: &str, profile: &FederatedProfile) -> Result<Account, AuthenticationError> {
        if let Some(existing) = self.accounts.find_by_provider(provider, &profile.id) {
            return Ok(existing);
        }
        if !self.allow_user_signup {
            warn!(target: "auth", provider = %provider, "rejecting unknown federated identity: signup disabled");
            return Err(AuthenticationError::SignupDisabled);
        }
        let base = username_candidate(provider, profile);
        let mut n = 0;
        loop {
            let username = if n == 0 { base.clone() } else { format!("{}_{}", base, n) };
            let mut account = Account::new(&uuid::Uuid::new_v4().simple().to_string(), &username);
            account.email = profile.email.clone();
            account.display_name = profile.display_name.clone().or_else(|| profile.name.clone());
            account.providers.push(ProviderLink { provider: provider.to_string(), provider_uid: profile.id.clone() });
            if let Some(pic) = profile.picture.first() {
                account.settings.insert("picture".into(), serde_json::Value::String(pic.url.clone()));
            }
            match self.accounts.insert(account.clone()) {
                Ok(()) => return Ok(account),
                Err(AuthenticationError::UsernameTaken) if n < 100 => n += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

fn username_candidate(provider: &str, profile: &FederatedProfile) -> String {
    let raw = profile
        .name
        .clone()
        .or_else(|| profile.email.as_ref().and_then(|e| e.split('@').next().map(|s| s.to_string())))
        .unwrap_or_default();
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c.to_ascii_lowercase() } else { '_' })
        .take(48)
        .collect();
    if cleaned.trim_matches('_').len() < 3 {
        format!("{}_{}", provider, profile.id.chars().take(32).collect::<String>())
    } else {
        cleaned
    }
}
