// SPDX-License-Identifier: Apache-2.0
//! Signed bearer tokens encoding a principal id with an expiry.
//!
//! Format: `base64url(payload_json).base64url(hmac_sha256(secret, payload_json))`.
//! The signature is verified in constant time; there is no way to recover
//! `secret` from a token, and a tampered payload invalidates the signature.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenPayload {
    principal_id: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Issue a signed bearer token for `principal_id`, valid for `ttl`.
pub fn issue(secret: &[u8], principal_id: &str, ttl: chrono::Duration) -> String {
    let payload = TokenPayload {
        principal_id: principal_id.to_string(),
        expires_at: chrono::Utc::now() + ttl,
    };
    let payload_json = serde_json::to_vec(&payload).expect("token payload always serializes");
    let sig = sign(secret, &payload_json);
    format!("{}.{}", b64(&payload_json), b64(&sig))
}

/// Verify a bearer token's signature and expiry, returning the principal id
/// it encodes.
pub fn verify(secret: &[u8], token: &str) -> Result<String> {
    let (payload_part, sig_part) = token
        .split_once('.')
        .ok_or(GatewayError::Unauthenticated)?;
    let payload_json = b64_decode(payload_part).map_err(|_| GatewayError::Unauthenticated)?;
    let provided_sig = b64_decode(sig_part).map_err(|_| GatewayError::Unauthenticated)?;
    let expected_sig = sign(secret, &payload_json);

    if !bool::from(expected_sig.as_slice().ct_eq(provided_sig.as_slice())) {
        return Err(GatewayError::Unauthenticated);
    }

    let payload: TokenPayload =
        serde_json::from_slice(&payload_json).map_err(|_| GatewayError::Unauthenticated)?;

    if payload.expires_at < chrono::Utc::now() {
        return Err(GatewayError::Unauthenticated);
    }

    Ok(payload.principal_id)
}

fn sign(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn b64_decode(s: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let secret = b"test-secret";
        let token = issue(secret, "p1", chrono::Duration::minutes(5));
        let principal = verify(secret, &token).unwrap();
        assert_eq!(principal, "p1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = b"test-secret";
        let token = issue(secret, "p1", chrono::Duration::seconds(-1));
        assert!(verify(secret, &token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue(b"secret-a", "p1", chrono::Duration::minutes(5));
        assert!(verify(b"secret-b", &token).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let secret = b"test-secret";
        let token = issue(secret, "p1", chrono::Duration::minutes(5));
        let (_, sig) = token.split_once('.').unwrap();
        let forged_payload = TokenPayload {
            principal_id: "p2".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
        };
        let forged_json = serde_json::to_vec(&forged_payload).unwrap();
        let forged = format!("{}.{}", b64(&forged_json), sig);
        assert!(verify(secret, &forged).is_err());
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(verify(b"secret", "not-a-valid-token").is_err());
    }
}
