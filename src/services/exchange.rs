//! PKCE authorization-code exchange: credential-bound claim -> single-use code -> claim.
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::codec;
use crate::dwt::{ClaimError, Dwt};
use crate::repos::auth_code_repo::{AuthCodeStore, ConsumeOutcome, NewAuthCode};
use crate::repos::error::RepoError;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("authorization code not found")]
    CodeNotFound,
    #[error("authorization code already consumed")]
    CodeAlreadyConsumed,
    #[error("state mismatch")]
    StateMismatch,
    #[error("PKCE verifier mismatch")]
    PkceMismatch,
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
    #[error("entropy source unavailable")]
    Entropy,
    #[error("storage call timed out")]
    Timeout,
}

/// `base64(SHA256(base64decode(value)))`, used for stored code hashes and
/// PKCE challenges alike.
pub fn hash_b64_value(value: &str) -> Option<String> {
    let raw = codec::decode_b64(value).ok()?;
    Some(STANDARD.encode(codec::sha256(&raw)))
}

#[derive(Clone)]
pub struct AuthCodeExchange {
    store: Arc<dyn AuthCodeStore>,
    code_ttl: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for AuthCodeExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCodeExchange")
            .field("code_ttl", &self.code_ttl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AuthCodeExchange {
    pub fn new(store: Arc<dyn AuthCodeStore>, code_ttl: Duration, timeout: Duration) -> Self {
        Self {
            store,
            code_ttl,
            timeout,
        }
    }

    /// Returns the raw code. Only its hash is persisted.
    pub async fn issue_code(
        &self,
        claim: &Dwt,
        state: &str,
        code_challenge: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ExchangeError> {
        claim.bound_credential()?;

        let mut raw = [0u8; 32];
        getrandom::fill(&mut raw).map_err(|_| ExchangeError::Entropy)?;
        let code = STANDARD.encode(raw);
        let code_hash = STANDARD.encode(codec::sha256(&raw));

        let claims =
            serde_json::to_string(claim).map_err(|_| ClaimError::Malformed("claim encoding"))?;
        let ttl = chrono::Duration::from_std(self.code_ttl)
            .map_err(|_| ExchangeError::Storage(RepoError::Corrupt("code ttl".into())))?;

        let record = NewAuthCode {
            code_hash,
            subject: claim.subject.clone(),
            claims,
            state: state.to_string(),
            code_challenge: code_challenge.to_string(),
            expires_at: now + ttl,
        };
        tokio::time::timeout(self.timeout, self.store.insert(record))
            .await
            .map_err(|_| ExchangeError::Timeout)??;

        debug!(subject = %claim.subject, "authorization code issued");
        Ok(code)
    }

    /// Succeeds at most once per code. A wrong `state` or `code_verifier`
    /// leaves the code redeemable.
    pub async fn redeem_code(
        &self,
        code: &str,
        state: &str,
        code_verifier: &str,
        now: DateTime<Utc>,
    ) -> Result<Dwt, ExchangeError> {
        let code_hash = hash_b64_value(code).ok_or(ExchangeError::CodeNotFound)?;
        // An undecodable verifier still goes through the lookup so the code's
        // own status is reported first.
        let challenge = hash_b64_value(code_verifier);

        let outcome = tokio::time::timeout(
            self.timeout,
            self.store.consume(&code_hash, state, challenge.as_deref(), now),
        )
        .await
        .map_err(|_| ExchangeError::Timeout)??;

        let claims = match outcome {
            ConsumeOutcome::Consumed { claims, .. } => claims,
            ConsumeOutcome::NotFound => return Err(ExchangeError::CodeNotFound),
            ConsumeOutcome::AlreadyConsumed => {
                warn!(code_hash = %code_hash, "authorization code replayed");
                return Err(ExchangeError::CodeAlreadyConsumed);
            }
            ConsumeOutcome::StateMismatch => return Err(ExchangeError::StateMismatch),
            ConsumeOutcome::PkceMismatch => return Err(ExchangeError::PkceMismatch),
        };

        serde_json::from_str(&claims)
            .map_err(|_| ExchangeError::Storage(RepoError::Corrupt("auth code claims".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::auth_code_repo::MemoryAuthCodeStore;

    // Unbound claims are refused at issuance, so tests drive the store
    // directly through a pre-hashed record.
    async fn seeded(now: DateTime<Utc>) -> (AuthCodeExchange, String, String) {
        let store = Arc::new(MemoryAuthCodeStore::new());
        let code = STANDARD.encode([1u8; 32]);
        let verifier = STANDARD.encode([2u8; 32]);
        let claim = Dwt::with_nonce([3u8; 32], "alice", 1_000, [4u8; 32]);

        store
            .insert(NewAuthCode {
                code_hash: hash_b64_value(&code).unwrap(),
                subject: "alice".into(),
                claims: serde_json::to_string(&claim).unwrap(),
                state: "xyz".into(),
                code_challenge: hash_b64_value(&verifier).unwrap(),
                expires_at: now + chrono::Duration::minutes(5),
            })
            .await
            .unwrap();

        let exchange =
            AuthCodeExchange::new(store, Duration::from_secs(300), Duration::from_secs(5));
        (exchange, code, verifier)
    }

    #[tokio::test]
    async fn redeems_exactly_once() {
        let now = Utc::now();
        let (exchange, code, verifier) = seeded(now).await;

        let claim = exchange.redeem_code(&code, "xyz", &verifier, now).await.unwrap();
        assert_eq!(claim.subject, "alice");

        let err = exchange
            .redeem_code(&code, "xyz", &verifier, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::CodeAlreadyConsumed));
    }

    #[tokio::test]
    async fn wrong_verifier_with_right_state_is_pkce_mismatch() {
        let now = Utc::now();
        let (exchange, code, verifier) = seeded(now).await;
        let other = STANDARD.encode([9u8; 32]);

        let err = exchange
            .redeem_code(&code, "xyz", &other, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PkceMismatch));

        let err = exchange
            .redeem_code(&code, "nope", &verifier, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::StateMismatch));

        assert!(exchange.redeem_code(&code, "xyz", &verifier, now).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_or_garbled_code_is_not_found() {
        let now = Utc::now();
        let (exchange, _, verifier) = seeded(now).await;

        for code in [STANDARD.encode([8u8; 32]), "%%%".to_string()] {
            let err = exchange
                .redeem_code(&code, "xyz", &verifier, now)
                .await
                .unwrap_err();
            assert!(matches!(err, ExchangeError::CodeNotFound));
        }
    }

    #[tokio::test]
    async fn garbled_verifier_reports_the_code_status_first() {
        let now = Utc::now();
        let (exchange, code, verifier) = seeded(now).await;

        let err = exchange
            .redeem_code(&STANDARD.encode([8u8; 32]), "xyz", "%%%", now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::CodeNotFound));

        let err = exchange
            .redeem_code(&code, "xyz", "%%%", now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::PkceMismatch));

        exchange.redeem_code(&code, "xyz", &verifier, now).await.unwrap();
        let err = exchange
            .redeem_code(&code, "xyz", "%%%", now)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::CodeAlreadyConsumed));
    }

    #[tokio::test]
    async fn unbound_claim_gets_no_code() {
        let exchange = AuthCodeExchange::new(
            Arc::new(MemoryAuthCodeStore::new()),
            Duration::from_secs(300),
            Duration::from_secs(5),
        );
        let claim = Dwt::with_nonce([3u8; 32], "alice", 1_000, [4u8; 32]);

        let err = exchange
            .issue_code(&claim, "xyz", "challenge", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Claim(ClaimError::MissingCredentialBinding)
        ));
    }
}
