//! Signed, stateless session tokens.
//!
//! A token is `<payload>.<signature>`: the payload is base64url JSON `{uid, iat}`,
//! the signature is hex HMAC-SHA256 of the encoded payload keyed by the server
//! salt. Expiry is `iat + ttl`, recomputed on every verify. Replacing the salt
//! invalidates every token issued under the old one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use super::AuthenticationError;
use crate::tprintln;

type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 32;

pub type SessionToken = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub uid: String,
    /// Epoch millis.
    pub issued_at: i64,
    pub expires_at: i64,
    pub signature: String,
    pub token: SessionToken,
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    uid: String,
    iat: i64,
}

fn random_salt() -> Result<[u8; SALT_LEN]> {
    let mut buf = [0u8; SALT_LEN];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    Ok(buf)
}

pub struct SessionSigner {
    salt: RwLock<Arc<[u8; SALT_LEN]>>,
    salt_path: Option<PathBuf>,
    pub ttl: Duration,
}

impl SessionSigner {
    /// In-memory signer with a fresh salt.
    pub fn ephemeral(ttl: Duration) -> Result<Self> {
        Ok(SessionSigner { salt: RwLock::new(Arc::new(random_salt()?)), salt_path: None, ttl })
    }

    /// Load the salt from `<db_root>/session.salt`, creating it on first start.
    pub fn open(db_root: &Path, ttl: Duration) -> Result<Self> {
        let path = db_root.join("session.salt");
        let salt = if path.exists() {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let bytes = hex::decode(text.trim()).with_context(|| format!("decoding {}", path.display()))?;
            let salt: [u8; SALT_LEN] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("{} must hold {} bytes", path.display(), SALT_LEN))?;
            salt
        } else {
            let salt = random_salt()?;
            write_salt(&path, &salt)?;
            info!(target: "auth", "created session salt at {}", path.display());
            salt
        };
        Ok(SessionSigner { salt: RwLock::new(Arc::new(salt)), salt_path: Some(path), ttl })
    }

    fn sign(salt: &[u8], payload: &str) -> Result<String, AuthenticationError> {
        let mut mac = HmacSha256::new_from_slice(salt).map_err(|e| AuthenticationError::Internal(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn issue(&self, uid: &str, issued_at: i64) -> Result<Session, AuthenticationError> {
        let payload = serde_json::to_vec(&TokenPayload { uid: uid.to_string(), iat: issued_at })
            .map_err(|e| AuthenticationError::Internal(e.to_string()))?;
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload);
        let salt = self.salt.read().clone();
        let signature = Self::sign(&salt[..], &encoded)?;
        tprintln!("session.issue uid={} iat={}", uid, issued_at);
        Ok(Session {
            uid: uid.to_string(),
            issued_at,
            expires_at: issued_at + self.ttl.as_millis() as i64,
            token: format!("{}.{}", encoded, signature),
            signature,
        })
    }

    /// Check signature and expiry. Performs no I/O.
    pub fn verify(&self, token: &str, now_ms: i64) -> Result<Session, AuthenticationError> {
        let (encoded, signature) = token.split_once('.').ok_or(AuthenticationError::Malformed)?;
        let salt = self.salt.read().clone();
        let expected = Self::sign(&salt[..], encoded)?;
        if expected.len() != signature.len() || !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(AuthenticationError::BadSignature);
        }
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| AuthenticationError::Malformed)?;
        let payload: TokenPayload = serde_json::from_slice(&payload).map_err(|_| AuthenticationError::Malformed)?;
        let expires_at = payload.iat + self.ttl.as_millis() as i64;
        if now_ms >= expires_at {
            return Err(AuthenticationError::Expired);
        }
        Ok(Session { uid: payload.uid, issued_at: payload.iat, expires_at, signature: signature.to_string(), token: token.to_string() })
    }

    /// Replace the salt in memory and on disk. Every outstanding token stops verifying.
    pub fn rotate_salt(&self) -> Result<()> {
        let salt = random_salt()?;
        if let Some(path) = self.salt_path.as_ref() {
            write_salt(path, &salt)?;
        }
        *self.salt.write() = Arc::new(salt);
        warn!(target: "auth", "session salt rotated; all outstanding sessions are invalid");
        Ok(())
    }
}

fn write_salt(path: &Path, salt: &[u8; SALT_LEN]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("salt.tmp");
    std::fs::write(&tmp, hex::encode(salt)).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
