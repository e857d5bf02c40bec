//!
//! canopy server binary
//! --------------------
//! Command-line entry point for the canopy HTTP/WebSocket server. Settings come
//! from `CANOPY_*` environment variables, overridden by command-line flags.

use anyhow::Result;
use std::env;
use std::path::PathBuf;

use canopy::config::{parse_bool, ServerSettings};
use canopy::rules::DefaultAccess;

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    arg_value(args, flag).and_then(|v| v.parse::<u16>().ok())
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

/// `--flag` alone means true; `--flag false` and friends are honored.
fn parse_bool_arg(args: &[String], flag: &str) -> Option<bool> {
    let i = args.iter().position(|a| a == flag)?;
    match args.get(i + 1) {
        Some(next) if !next.starts_with('-') => Some(parse_bool(next).unwrap_or(true)),
        _ => Some(true),
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

const HELP: &str = "canopy Server

USAGE:
  canopy_server [--http-port N] [--db-folder PATH] [--default-access deny|auth|allow]
                [--allow-signup [bool]] [--token-ttl SECS] [--rules-poll SECS] [--no-persist]

OPTIONS:
  --http-port N          HTTP/WS port (env: CANOPY_HTTP_PORT, default 7979)
  --db-folder PATH       Database root folder (env: CANOPY_DB_FOLDER, default dbs/canopy)
  --default-access MODE  Rules written on first start (env: CANOPY_DEFAULT_ACCESS, default deny)
  --allow-signup [bool]  Allow self-service and federated account creation (env: CANOPY_ALLOW_SIGNUP)
  --token-ttl SECS       Session token lifetime (env: CANOPY_TOKEN_TTL_SECS, default 86400)
  --rules-poll SECS      Rules file poll interval, 0 disables (env: CANOPY_RULES_POLL_SECS, default 2)
  --no-persist           Keep the tree in memory only (env: CANOPY_PERSIST)

  The administrator password is taken from CANOPY_ADMIN_PASSWORD on first start;
  when unset a password is generated and printed once.
  OAuth2 providers are read from <db-folder>/auth_providers.json.
";

#[tokio::main]
async fn main() -> Result<()> {
    println!(r"  ___ __ _ _ __   ___  _ __  _   _
 / __/ _` | '_ \ / _ \| '_ \| | | |
| (_| (_| | | | | (_) | |_) | |_| |
 \___\__,_|_| |_|\___/| .__/ \__, |
                      |_|    |___/ ");

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", HELP);
        return Ok(());
    }

    // CLI arguments override environment
    let mut settings = ServerSettings::from_env();
    if let Some(port) = parse_port_arg(&args, "--http-port") {
        settings.http_port = port;
    }
    if let Some(root) = arg_value(&args, "--db-folder") {
        settings.db_root = PathBuf::from(root);
    }
    if let Some(mode) = arg_value(&args, "--default-access") {
        match DefaultAccess::parse(&mode) {
            Some(access) => settings.default_access = access,
            None => anyhow::bail!("unknown --default-access '{}': expected deny, auth or allow", mode),
        }
    }
    if let Some(b) = parse_bool_arg(&args, "--allow-signup") {
        settings.allow_user_signup = b;
    }
    if let Some(ttl) = arg_value(&args, "--token-ttl").and_then(|v| v.parse::<u64>().ok()) {
        settings.token_ttl_secs = ttl;
    }
    if let Some(secs) = arg_value(&args, "--rules-poll").and_then(|v| v.parse::<u64>().ok()) {
        settings.rules_poll_secs = secs;
    }
    if has_flag(&args, "--no-persist") {
        settings.persistence.enabled = false;
    }
    settings.load_providers()?;

    println!(
        "canopy starting: http={}, db_root={}, default_access={:?}, signup={}",
        settings.http_port,
        settings.db_root.display(),
        settings.default_access,
        settings.allow_user_signup
    );
    tracing::info!(target: "startup", "Using port: http={}, db_root={}", settings.http_port, settings.db_root.display());
    canopy::server::run_with_settings(settings).await
}
