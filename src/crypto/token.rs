//! Signed exemption-verification tokens.
//!
//! A token is `base64url(payload) "." base64url(signature)`, where the
//! payload is the JSON-encoded [`VerificationClaims`] and the signature is
//! ED25519 over the encoded payload.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How long a verification link stays valid.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationClaims {
    /// User the verification is for.
    pub sub: String,
    /// Expiry, unix seconds.
    pub exp: i64,
    pub nonce: String,
}

impl VerificationClaims {
    /// Claims for `user_id`, valid for `ttl` from `now`, with a fresh nonce.
    pub fn new(user_id: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);

        Self {
            sub: user_id.to_string(),
            exp: now.timestamp() + ttl.as_secs() as i64,
            nonce: hex::encode(nonce),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("bad token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,
}

/// Signs `claims` into a token.
pub fn issue(key: &SigningKey, claims: &VerificationClaims) -> String {
    // Serializing plain strings and integers cannot fail.
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
    let signature: Signature = key.sign(payload.as_bytes());

    format!("{}.{}", payload, URL_SAFE_NO_PAD.encode(signature.to_bytes()))
}

/// Checks the signature and expiry of a token and returns its claims.
pub fn verify(
    key: &VerifyingKey,
    token: &str,
    now: DateTime<Utc>,
) -> Result<VerificationClaims, TokenError> {
    let (payload, signature_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;

    let signature_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| TokenError::Malformed)?;
    let signature = Signature::from_slice(&signature_bytes).map_err(|_| TokenError::Malformed)?;
    key.verify(payload.as_bytes(), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    let claims: VerificationClaims =
        serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

    if claims.exp <= now.timestamp() {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}
