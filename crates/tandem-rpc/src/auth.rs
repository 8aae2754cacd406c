//! Connection identity and the token vault.
//!
//! A listener-side connection carries a [`Principal`], anonymous until a
//! successful `SignIn` replaces it.  Tokens are opaque byte blobs to the
//! engine; the [`TokenVault`] seam issues and verifies them.  The stock
//! [`SignedTokenVault`] signs a JSON claim set with a keyed Sha256 digest;
//! enough for tests and single-key deployments, replaceable for anything
//! stronger.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: Option<String>,
    pub claims: BTreeMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
    authenticated: bool,
}

impl Principal {
    /// The unauthenticated principal every connection starts with.
    pub fn anonymous() -> Self {
        Principal {
            name: None,
            claims: BTreeMap::new(),
            expires_at: None,
            authenticated: false,
        }
    }

    /// An authenticated principal with the given display name.
    pub fn named(name: impl Into<String>) -> Self {
        Principal {
            name: Some(name.into()),
            claims: BTreeMap::new(),
            expires_at: None,
            authenticated: true,
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// Token verification / issuance failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token invalid")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token issue failed: {0}")]
    Issue(String),
}

/// The opaque-token seam: issue a token for a principal, verify a token
/// back into one.
pub trait TokenVault: Send + Sync {
    fn issue(&self, principal: &Principal, validity: Duration) -> Result<Vec<u8>, TokenError>;
    fn verify(&self, token: &[u8]) -> Result<Principal, TokenError>;
}

#[derive(Serialize, Deserialize)]
struct TokenClaims {
    name: Option<String>,
    claims: BTreeMap<String, String>,
    expires_at: DateTime<Utc>,
    nonce: u64,
}

const SIGNATURE_LEN: usize = 32;

/// Keyed-digest token vault: `sha256(key || body) || body`.
pub struct SignedTokenVault {
    key: Vec<u8>,
}

impl SignedTokenVault {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        SignedTokenVault { key: key.into() }
    }

    fn signature(&self, body: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(body);
        hasher.finalize().into()
    }
}

impl TokenVault for SignedTokenVault {
    fn issue(&self, principal: &Principal, validity: Duration) -> Result<Vec<u8>, TokenError> {
        let claims = TokenClaims {
            name: principal.name.clone(),
            claims: principal.claims.clone(),
            expires_at: Utc::now() + validity,
            nonce: rand::random(),
        };
        let body = serde_json::to_vec(&claims).map_err(|e| TokenError::Issue(e.to_string()))?;
        let mut token = Vec::with_capacity(SIGNATURE_LEN + body.len());
        token.extend_from_slice(&self.signature(&body));
        token.extend_from_slice(&body);
        Ok(token)
    }

    fn verify(&self, token: &[u8]) -> Result<Principal, TokenError> {
        if token.len() <= SIGNATURE_LEN {
            return Err(TokenError::Invalid);
        }
        let (signature, body) = token.split_at(SIGNATURE_LEN);
        if !digests_equal(signature, &self.signature(body)) {
            return Err(TokenError::Invalid);
        }
        let claims: TokenClaims =
            serde_json::from_slice(body).map_err(|_| TokenError::Invalid)?;
        if claims.expires_at <= Utc::now() {
            return Err(TokenError::Expired);
        }
        Ok(Principal {
            name: claims.name,
            claims: claims.claims,
            expires_at: Some(claims.expires_at),
            authenticated: true,
        })
    }
}

/// Constant-time digest comparison; no short-circuit on mismatch.
fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Tokens cross the JSON codec as base64 strings.
pub(crate) fn token_to_wire(token: &[u8]) -> String {
    BASE64.encode(token)
}

pub(crate) fn token_from_wire(text: &str) -> Result<Vec<u8>, TokenError> {
    BASE64.decode(text).map_err(|_| TokenError::Invalid)
}

/// Dialer-side gate serializing `SignIn`/`SignOut` against each other so
/// the observable flag tracks completed operations only.
pub(crate) struct AuthGate {
    pub gate: Mutex<()>,
    authenticated: AtomicBool,
}

impl AuthGate {
    pub fn new() -> Self {
        AuthGate {
            gate: Mutex::new(()),
            authenticated: AtomicBool::new(false),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Release);
    }
}
