//! Connection authentication.
//!
//! The server runs exactly one [`Authenticator`], chosen from configuration
//! at startup: a shared password, or DID challenge/response.

pub mod did;
pub mod pending;

pub use did::{Challenge, DidAuthEngine, Response, VerifyError};
pub use pending::{PendingChallenge, PendingChallenges};

use crate::config::{AuthMode, Configuration};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("no challenge is pending for this peer")]
    NoPendingChallenge,
    #[error("challenge expired")]
    Expired,
    #[error("malformed authentication message")]
    Malformed,
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("peer disconnected during verification")]
    PeerGone,
    #[error("identity was banned during authentication")]
    Banned,
}

#[derive(Debug, Clone)]
pub enum Authenticator {
    Password { password: String },
    Did(DidAuthEngine),
}

impl Authenticator {
    pub fn from_config(config: &Configuration) -> Self {
        match config.auth_mode {
            AuthMode::Password => Authenticator::Password {
                password: config.password.clone(),
            },
            AuthMode::Did => Authenticator::Did(DidAuthEngine::new(config.resolve_timeout())),
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Authenticator::Password { .. } => AuthMode::Password,
            Authenticator::Did(_) => AuthMode::Did,
        }
    }
}

/// Compares two byte slices in time independent of where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
