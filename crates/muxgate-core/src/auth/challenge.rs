// SPDX-License-Identifier: Apache-2.0
//! Signed-challenge authentication: caller supplies a public key, a recent
//! timestamp, a random nonce, and a signature over `"timestamp|nonce"`.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::dedup::DedupCache;
use crate::error::{GatewayError, Result};

/// A parsed, not-yet-verified signed-challenge credential.
#[derive(Debug, Clone)]
pub struct SignedChallenge {
    pub pubkey_hex: String,
    pub signature_b64: String,
    pub timestamp: i64,
    pub nonce: String,
}

/// SHA-256 hex fingerprint of a raw public key — 64 lowercase hex chars.
pub fn fingerprint(pubkey_bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(pubkey_bytes))
}

/// Verify a signed-challenge credential against a replay cache.
///
/// Returns the key fingerprint on success. Fails `unauthenticated` for bad
/// encoding, bad signature, a timestamp outside `window_secs` of now, or a
/// `(fingerprint, timestamp, nonce)` triple already seen (replay).
pub fn verify(
    challenge: &SignedChallenge,
    now: i64,
    window_secs: i64,
    replay_cache: &DedupCache,
) -> Result<String> {
    let pubkey_bytes = hex::decode(&challenge.pubkey_hex).map_err(|_| GatewayError::Unauthenticated)?;
    let pubkey_arr: [u8; 32] = pubkey_bytes
        .try_into()
        .map_err(|_| GatewayError::Unauthenticated)?;
    let verifying_key =
        VerifyingKey::from_bytes(&pubkey_arr).map_err(|_| GatewayError::Unauthenticated)?;

    if (now - challenge.timestamp).abs() > window_secs {
        return Err(GatewayError::Unauthenticated);
    }

    let sig_bytes = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        &challenge.signature_b64,
    )
    .map_err(|_| GatewayError::Unauthenticated)?;
    let sig_arr: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| GatewayError::Unauthenticated)?;
    let signature = Signature::from_bytes(&sig_arr);

    let message = format!("{}|{}", challenge.timestamp, challenge.nonce);
    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| GatewayError::Unauthenticated)?;

    let fp = fingerprint(&pubkey_bytes);
    let replay_key = format!("{fp}|{}|{}", challenge.timestamp, challenge.nonce);
    if replay_cache.check_and_mark(&replay_key) {
        return Err(GatewayError::Unauthenticated);
    }

    Ok(fp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::time::Duration;

    fn signed(timestamp: i64, nonce: &str) -> (SigningKey, SignedChallenge) {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let message = format!("{timestamp}|{nonce}");
        let signature = signing_key.sign(message.as_bytes());
        let challenge = SignedChallenge {
            pubkey_hex: hex::encode(signing_key.verifying_key().to_bytes()),
            signature_b64: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                signature.to_bytes(),
            ),
            timestamp,
            nonce: nonce.to_string(),
        };
        (signing_key, challenge)
    }

    #[test]
    fn valid_challenge_verifies() {
        let now = chrono::Utc::now().timestamp();
        let (_key, challenge) = signed(now, "nonce-1");
        let cache = DedupCache::new(64, Duration::from_secs(600));
        assert!(verify(&challenge, now, 300, &cache).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let now = chrono::Utc::now().timestamp();
        let (_key, challenge) = signed(now - 10_000, "nonce-2");
        let cache = DedupCache::new(64, Duration::from_secs(600));
        assert!(verify(&challenge, now, 300, &cache).is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let now = chrono::Utc::now().timestamp();
        let (_key, mut challenge) = signed(now, "nonce-3");
        challenge.nonce = "different-nonce".to_string();
        let cache = DedupCache::new(64, Duration::from_secs(600));
        assert!(verify(&challenge, now, 300, &cache).is_err());
    }

    #[test]
    fn replayed_triple_is_rejected_on_second_attempt() {
        let now = chrono::Utc::now().timestamp();
        let (_key, challenge) = signed(now, "nonce-4");
        let cache = DedupCache::new(64, Duration::from_secs(600));
        assert!(verify(&challenge, now, 300, &cache).is_ok());
        assert!(verify(&challenge, now, 300, &cache).is_err());
    }

    #[test]
    fn fingerprint_is_64_lowercase_hex_chars() {
        let fp = fingerprint(b"some key bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
