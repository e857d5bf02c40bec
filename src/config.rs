//! Server settings: defaults, `CANOPY_*` environment overrides and the optional
//! `auth_providers.json` file under the database root. The server binary layers
//! command-line flags on top of [`ServerSettings::from_env`].

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::federation::ProviderSettings;
use crate::rules::DefaultAccess;
use crate::storage::PersistenceSettings;

pub const DEFAULT_HTTP_PORT: u16 = 7979;
pub const DEFAULT_DB_ROOT: &str = "dbs/canopy";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub http_port: u16,
    pub db_root: PathBuf,
    /// Rules written on first start when no rules file exists.
    pub default_access: DefaultAccess,
    pub allow_user_signup: bool,
    pub token_ttl_secs: u64,
    /// Administrator password used at bootstrap; generated when absent.
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
    /// Rules file polling interval; 0 disables the watcher.
    pub rules_poll_secs: u64,
    pub persistence: PersistenceSettings,
    /// Outbound messages buffered per realtime client before it is dropped.
    pub client_queue_capacity: usize,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            http_port: DEFAULT_HTTP_PORT,
            db_root: PathBuf::from(DEFAULT_DB_ROOT),
            default_access: DefaultAccess::Deny,
            allow_user_signup: false,
            token_ttl_secs: 24 * 60 * 60,
            admin_password: None,
            rules_poll_secs: 2,
            persistence: PersistenceSettings { enabled: true, ..Default::default() },
            client_queue_capacity: 256,
            providers: BTreeMap::new(),
        }
    }
}

pub fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_bool_env(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|v| parse_bool(&v))
}

impl ServerSettings {
    /// Defaults overridden by `CANOPY_*` environment variables.
    pub fn from_env() -> Self {
        let mut s = ServerSettings::default();
        if let Some(port) = env_parse::<u16>("CANOPY_HTTP_PORT") { s.http_port = port; }
        if let Ok(root) = env::var("CANOPY_DB_FOLDER") { s.db_root = PathBuf::from(root); }
        if let Some(access) = env::var("CANOPY_DEFAULT_ACCESS").ok().and_then(|v| DefaultAccess::parse(&v)) {
            s.default_access = access;
        }
        if let Some(b) = parse_bool_env("CANOPY_ALLOW_SIGNUP") { s.allow_user_signup = b; }
        if let Some(ttl) = env_parse::<u64>("CANOPY_TOKEN_TTL_SECS") { s.token_ttl_secs = ttl; }
        if let Ok(pw) = env::var("CANOPY_ADMIN_PASSWORD") {
            if !pw.is_empty() { s.admin_password = Some(pw); }
        }
        if let Some(secs) = env_parse::<u64>("CANOPY_RULES_POLL_SECS") { s.rules_poll_secs = secs; }
        if let Some(b) = parse_bool_env("CANOPY_PERSIST") { s.persistence.enabled = b; }
        if let Some(ms) = env_parse::<u64>("CANOPY_PERSIST_INTERVAL_MS") { s.persistence.interval_ms = ms; }
        if let Some(cap) = env_parse::<usize>("CANOPY_CLIENT_QUEUE") { s.client_queue_capacity = cap.max(1); }
        s
    }

    /// Merge provider entries from `<db_root>/auth_providers.json`, if present.
    pub fn load_providers(&mut self) -> Result<()> {
        let found = load_provider_settings(&self.db_root)?;
        self.providers.extend(found);
        Ok(())
    }
}

pub fn provider_settings_path(db_root: &Path) -> PathBuf { db_root.join("auth_providers.json") }

/// Provider settings keyed by provider name. A missing file yields an empty map.
pub fn load_provider_settings(db_root: &Path) -> Result<BTreeMap<String, ProviderSettings>> {
    let path = provider_settings_path(db_root);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
