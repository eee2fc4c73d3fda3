// SPDX-License-Identifier: Apache-2.0
//! Authentication gate: tries a signed challenge, then a bearer token, and
//! resolves the winning credential to an active [`crate::model::Principal`].

pub mod challenge;
pub mod token;

use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::ledger::LedgerStore;
use crate::model::{Principal, PrincipalKind, PrincipalStatus};

pub use challenge::SignedChallenge;

/// Policy for principals discovered via signed-challenge auth with no
/// pre-existing record. Mirrors `muxgate_config::AutoRegisterPolicy` — kept
/// as a separate type here so this crate has no dependency on the config
/// crate; the gateway binary maps one onto the other at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRegisterPolicy {
    Approved,
    Pending,
    Disabled,
}

/// Credential presented by a connecting caller.
pub enum Credential {
    SignedChallenge(SignedChallenge),
    BearerToken(String),
}

pub struct AuthGate {
    ledger: Arc<dyn LedgerStore>,
    bearer_secret: Vec<u8>,
    challenge_window_secs: i64,
    auto_register: AutoRegisterPolicy,
    replay_cache: Arc<crate::dedup::DedupCache>,
}

impl AuthGate {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        bearer_secret: Vec<u8>,
        challenge_window_secs: i64,
        auto_register: AutoRegisterPolicy,
        replay_cache: Arc<crate::dedup::DedupCache>,
    ) -> Self {
        Self {
            ledger,
            bearer_secret,
            challenge_window_secs,
            auto_register,
            replay_cache,
        }
    }

    /// Authenticate `credential` as of `now`, returning the resolved
    /// principal. Touches `last_seen` on success.
    pub async fn authenticate(&self, credential: Credential, now: i64) -> Result<Principal> {
        let principal = match credential {
            Credential::SignedChallenge(challenge) => self.authenticate_challenge(challenge, now).await?,
            Credential::BearerToken(token_str) => self.authenticate_bearer(&token_str).await?,
        };

        if !principal.status.is_active() {
            return Err(GatewayError::Unauthenticated);
        }

        self.ledger.touch_principal_last_seen(&principal.id).await?;
        Ok(principal)
    }

    async fn authenticate_challenge(&self, ch: SignedChallenge, now: i64) -> Result<Principal> {
        let fingerprint =
            challenge::verify(&ch, now, self.challenge_window_secs, &self.replay_cache)?;

        match self.ledger.get_principal_by_pubkey(&fingerprint).await? {
            Some(principal) => Ok(principal),
            None => self.auto_register_principal(fingerprint).await,
        }
    }

    async fn auto_register_principal(&self, fingerprint: String) -> Result<Principal> {
        let status = match self.auto_register {
            AutoRegisterPolicy::Approved => PrincipalStatus::Approved,
            AutoRegisterPolicy::Pending => PrincipalStatus::Pending,
            AutoRegisterPolicy::Disabled => return Err(GatewayError::Unauthenticated),
        };
        let principal = Principal {
            id: uuid::Uuid::new_v4().to_string(),
            kind: PrincipalKind::Agent,
            pubkey_fingerprint: fingerprint,
            display_name: "unnamed".to_string(),
            status,
            created_at: chrono::Utc::now(),
            last_seen: None,
        };
        self.ledger.create_principal(principal.clone()).await?;
        if status != PrincipalStatus::Approved {
            // A pending principal is not active; reject this attempt but the
            // record now exists for an admin to approve.
            return Err(GatewayError::Unauthenticated);
        }
        Ok(principal)
    }

    async fn authenticate_bearer(&self, token_str: &str) -> Result<Principal> {
        let principal_id = token::verify(&self.bearer_secret, token_str)?;
        self.ledger
            .get_principal(&principal_id)
            .await?
            .ok_or(GatewayError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupCache;
    use crate::ledger::sqlite::SqliteLedger;
    use std::time::Duration;

    async fn gate_with(auto_register: AutoRegisterPolicy) -> (AuthGate, Arc<dyn LedgerStore>) {
        let ledger: Arc<dyn LedgerStore> = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let replay = Arc::new(DedupCache::new(64, Duration::from_secs(600)));
        let gate = AuthGate::new(
            ledger.clone(),
            b"test-secret".to_vec(),
            300,
            auto_register,
            replay,
        );
        (gate, ledger)
    }

    #[tokio::test]
    async fn bearer_token_for_known_principal_succeeds() {
        let (gate, ledger) = gate_with(AutoRegisterPolicy::Disabled).await;
        let principal = Principal {
            id: "p1".into(),
            kind: PrincipalKind::Client,
            pubkey_fingerprint: "f".repeat(64),
            display_name: "test".into(),
            status: PrincipalStatus::Approved,
            created_at: chrono::Utc::now(),
            last_seen: None,
        };
        ledger.create_principal(principal.clone()).await.unwrap();
        let token = token::issue(b"test-secret", "p1", chrono::Duration::minutes(5));
        let resolved = gate
            .authenticate(Credential::BearerToken(token), chrono::Utc::now().timestamp())
            .await
            .unwrap();
        assert_eq!(resolved.id, "p1");
    }

    #[tokio::test]
    async fn bearer_token_for_unknown_principal_fails() {
        let (gate, _ledger) = gate_with(AutoRegisterPolicy::Disabled).await;
        let token = token::issue(b"test-secret", "ghost", chrono::Duration::minutes(5));
        let err = gate
            .authenticate(Credential::BearerToken(token), chrono::Utc::now().timestamp())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn revoked_principal_is_rejected_even_with_valid_token() {
        let (gate, ledger) = gate_with(AutoRegisterPolicy::Disabled).await;
        let principal = Principal {
            id: "p1".into(),
            kind: PrincipalKind::Client,
            pubkey_fingerprint: "f".repeat(64),
            display_name: "test".into(),
            status: PrincipalStatus::Revoked,
            created_at: chrono::Utc::now(),
            last_seen: None,
        };
        ledger.create_principal(principal).await.unwrap();
        let token = token::issue(b"test-secret", "p1", chrono::Duration::minutes(5));
        let err = gate
            .authenticate(Credential::BearerToken(token), chrono::Utc::now().timestamp())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn unknown_challenge_key_with_disabled_policy_is_rejected() {
        use ed25519_dalek::{Signer, SigningKey};
        let (gate, _ledger) = gate_with(AutoRegisterPolicy::Disabled).await;
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let now = chrono::Utc::now().timestamp();
        let message = format!("{now}|nonce-a");
        let signature = signing_key.sign(message.as_bytes());
        let ch = SignedChallenge {
            pubkey_hex: hex::encode(signing_key.verifying_key().to_bytes()),
            signature_b64: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                signature.to_bytes(),
            ),
            timestamp: now,
            nonce: "nonce-a".to_string(),
        };
        let err = gate
            .authenticate(Credential::SignedChallenge(ch), now)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn unknown_challenge_key_with_approved_policy_registers_and_authenticates() {
        use ed25519_dalek::{Signer, SigningKey};
        let (gate, ledger) = gate_with(AutoRegisterPolicy::Approved).await;
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let now = chrono::Utc::now().timestamp();
        let message = format!("{now}|nonce-b");
        let signature = signing_key.sign(message.as_bytes());
        let ch = SignedChallenge {
            pubkey_hex: hex::encode(signing_key.verifying_key().to_bytes()),
            signature_b64: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                signature.to_bytes(),
            ),
            timestamp: now,
            nonce: "nonce-b".to_string(),
        };
        let fingerprint = challenge::fingerprint(&signing_key.verifying_key().to_bytes());
        let resolved = gate
            .authenticate(Credential::SignedChallenge(ch), now)
            .await
            .unwrap();
        assert_eq!(resolved.pubkey_fingerprint, fingerprint);
        assert_eq!(resolved.status, PrincipalStatus::Approved);
        assert!(ledger
            .get_principal_by_pubkey(&fingerprint)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn unknown_challenge_key_with_pending_policy_registers_but_rejects() {
        use ed25519_dalek::{Signer, SigningKey};
        let (gate, ledger) = gate_with(AutoRegisterPolicy::Pending).await;
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let now = chrono::Utc::now().timestamp();
        let message = format!("{now}|nonce-c");
        let signature = signing_key.sign(message.as_bytes());
        let ch = SignedChallenge {
            pubkey_hex: hex::encode(signing_key.verifying_key().to_bytes()),
            signature_b64: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                signature.to_bytes(),
            ),
            timestamp: now,
            nonce: "nonce-c".to_string(),
        };
        let fingerprint = challenge::fingerprint(&signing_key.verifying_key().to_bytes());
        let err = gate
            .authenticate(Credential::SignedChallenge(ch), now)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
        let stored = ledger.get_principal_by_pubkey(&fingerprint).await.unwrap();
        assert_eq!(stored.unwrap().status, PrincipalStatus::Pending);
    }
}
