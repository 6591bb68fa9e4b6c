//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! A fresh verifier is generated for every authorization attempt and held
//! server-side until the callback arrives. Only the S256 challenge leaves the
//! gateway, inside the authorization URL.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::PKCE_VERIFIER_BYTES;

/// Verifier/challenge pair for one authorization attempt.
///
/// Debug output omits the verifier.
#[derive(Clone, PartialEq, Eq)]
pub struct PkceSession {
    pub verifier: String,
    pub challenge: String,
}

impl PkceSession {
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

impl std::fmt::Debug for PkceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceSession")
            .field("verifier", &"[REDACTED]")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// 32 random bytes, URL-safe base64 without padding (43 chars).
pub fn generate_verifier() -> String {
    random_token(PKCE_VERIFIER_BYTES)
}

/// `BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Opaque `state` value for an authorization attempt.
pub fn generate_state() -> String {
    random_token(16)
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(bytes.as_mut_slice());
    URL_SAFE_NO_PAD.encode(bytes)
}
