//! Accounts, signed sessions and the sign-in flows that issue them.
//! Keep the public surface thin and split implementation across sub-modules.

mod accounts;
mod authority;
mod principal;
mod request_context;
mod session;

use thiserror::Error;

use crate::federation::ProviderError;

pub use accounts::{check_password_policy, hash_password, verify_password, Account, AccountStore, ProviderLink, MIN_PASSWORD_LEN};
pub use authority::{BootstrapOutcome, Credentials, SessionAuthority, SignupRequest, PENDING_FLOW_TTL_MS};
pub use principal::AuthContext;
pub use request_context::{bearer_token, parse_context_header, RequestContext, CONTEXT_HEADER};
pub use session::{Session, SessionSigner, SessionToken, SALT_LEN};

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session expired")]
    Expired,
    #[error("bad session signature")]
    BadSignature,
    #[error("malformed session token")]
    Malformed,
    #[error("unknown account")]
    UnknownAccount,
    #[error("unknown or expired sign-in state")]
    InvalidState,
    #[error("signup is disabled")]
    SignupDisabled,
    #[error("username is already in use")]
    UsernameTaken,
    #[error("{0}")]
    WeakPassword(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<anyhow::Error> for AuthenticationError {
    fn from(e: anyhow::Error) -> Self { AuthenticationError::Internal(e.to_string()) }
}
