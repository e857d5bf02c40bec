//! Local account records, persisted as one JSON document under the database root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use parking_lot::{Mutex, RwLock};
use password_hash::{PasswordHash, SaltString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::AuthenticationError;

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLink {
    pub provider: String,
    pub provider_uid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub uid: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// argon2 PHC string; `None` for accounts that only sign in through a provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub providers: Vec<ProviderLink>,
    pub created_at: i64,
    #[serde(default)]
    pub last_signin_at: Option<i64>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl Account {
    pub fn new(uid: &str, username: &str) -> Self {
        Account {
            uid: uid.to_string(),
            username: username.to_string(),
            email: None,
            display_name: None,
            password_hash: None,
            is_admin: false,
            providers: Vec::new(),
            created_at: crate::now_ms(),
            last_signin_at: None,
            settings: Map::new(),
        }
    }

    /// Claims exposed to rule expressions as `auth.*`.
    pub fn claims(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("username".into(), Value::String(self.username.clone()));
        if let Some(email) = &self.email {
            m.insert("email".into(), Value::String(email.clone()));
        }
        if let Some(link) = self.providers.first() {
            m.insert("provider".into(), Value::String(link.provider.clone()));
        }
        m.insert("admin".into(), Value::Bool(self.is_admin));
        m
    }

    /// Account summary returned to clients; never includes the password hash.
    pub fn public_view(&self) -> Value {
        serde_json::json!({
            "uid": self.uid,
            "username": self.username,
            "email": self.email,
            "displayName": self.display_name,
            "isAdmin": self.is_admin,
            "providers": self.providers.iter().map(|p| p.provider.clone()).collect::<Vec<_>>(),
            "created": self.created_at,
            "lastSignin": self.last_signin_at,
            "settings": self.settings,
        })
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| anyhow!(e.to_string()))?;
    let argon2 = Argon2::default();
    let phc = argon2.hash_password(password.as_bytes(), &salt).map_err(|e| anyhow!(e.to_string()))?.to_string();
    Ok(phc)
}

pub fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

pub fn check_password_policy(password: &str) -> Result<(), AuthenticationError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthenticationError::WeakPassword(format!("password must be at least {} characters", MIN_PASSWORD_LEN)));
    }
    Ok(())
}

pub struct AccountStore {
    accounts: RwLock<BTreeMap<String, Account>>,
    path: Option<PathBuf>,
    /// Serializes writers of the temp file.
    save_lock: Mutex<()>,
}

impl AccountStore {
    pub fn in_memory() -> Self { AccountStore { accounts: RwLock::new(BTreeMap::new()), path: None, save_lock: Mutex::new(()) } }

    /// Load `<db_root>/accounts.json`; a missing file yields an empty store.
    pub fn open(db_root: &Path) -> Result<Self> {
        let path = db_root.join("accounts.json");
        let accounts = if path.exists() {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let list: Vec<Account> = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
            list.into_iter().map(|a| (a.uid.clone(), a)).collect()
        } else {
            BTreeMap::new()
        };
        Ok(AccountStore { accounts: RwLock::new(accounts), path: Some(path), save_lock: Mutex::new(()) })
    }

    pub fn len(&self) -> usize { self.accounts.read().len() }

    pub fn is_empty(&self) -> bool { self.accounts.read().is_empty() }

    pub fn get(&self, uid: &str) -> Option<Account> { self.accounts.read().get(uid).cloned() }

    pub fn find_by_username(&self, username: &str) -> Option<Account> {
        self.accounts.read().values().find(|a| a.username.eq_ignore_ascii_case(username)).cloned()
    }

    pub fn find_by_provider(&self, provider: &str, provider_uid: &str) -> Option<Account> {
        self.accounts
            .read()
            .values()
            .find(|a| a.providers.iter().any(|l| l.provider == provider && l.provider_uid == provider_uid))
            .cloned()
    }

    pub fn admin_exists(&self) -> bool { self.accounts.read().values().any(|a| a.is_admin) }

    /// Insert a new account; usernames are unique ignoring ASCII case.
    pub fn insert(&self, account: Account) -> Result<(), AuthenticationError> {
        {
            let mut map = self.accounts.write();
            if map.contains_key(&account.uid) || map.values().any(|a| a.username.eq_ignore_ascii_case(&account.username)) {
                return Err(AuthenticationError::UsernameTaken);
            }
            map.insert(account.uid.clone(), account);
        }
        self.persist()
    }

    /// Apply `f` to the account with `uid` and persist.
    pub fn update<F>(&self, uid: &str, f: F) -> Result<Account, AuthenticationError>
    where
        F: FnOnce(&mut Account),
    {
        let updated = {
            let mut map = self.accounts.write();
            let acct = map.get_mut(uid).ok_or(AuthenticationError::UnknownAccount)?;
            f(acct);
            acct.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    fn persist(&self) -> Result<(), AuthenticationError> {
        let Some(path) = self.path.as_ref() else { return Ok(()); };
        let _guard = self.save_lock.lock();
        let body = {
            let map = self.accounts.read();
            let list: Vec<&Account> = map.values().collect();
            serde_json::to_vec_pretty(&list).map_err(|e| AuthenticationError::Internal(e.to_string()))?
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| AuthenticationError::Internal(format!("saving accounts: {}", e)))
    }
}
