use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dwt::{CredentialBinding, Dwt, IssuerKey};
use crate::repos::credential_repo::{CredentialRecord, CredentialStore};
use crate::repos::pending_claim_repo::PendingClaimStore;
use crate::services::webauthn::{
    AssertionResponse, AttestationResponse, BridgeError, CeremonyOptions, Ceremonies,
    RelyingPartyCache, parse_client_data,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Registration,
    Assertion,
}

/// What is held per subject between begin and complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCeremony {
    pub kind: CeremonyKind,
    pub claim: Dwt,
    pub options: CeremonyOptions,
}

/// A started ceremony: options for the authenticator and the claim whose
/// hash they carry as challenge.
#[derive(Debug, Clone)]
pub struct StartedCeremony {
    pub options: CeremonyOptions,
    pub claim: Dwt,
}

#[derive(Debug, Clone)]
pub struct RegisteredCredential {
    pub credential_id: Vec<u8>,
    /// Claim with the new credential key attached; not usable for signing.
    pub claim: Dwt,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub lifetime_seconds: u64,
    pub pending_ttl: Duration,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct WebAuthnBridge {
    ceremonies: Arc<dyn Ceremonies>,
    credentials: Arc<dyn CredentialStore>,
    pending: Arc<dyn PendingClaimStore>,
    relying_parties: RelyingPartyCache,
    issuer: Arc<IssuerKey>,
    settings: BridgeSettings,
}

impl std::fmt::Debug for WebAuthnBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebAuthnBridge")
            .field("issuer", &self.issuer)
            .field("settings", &self.settings)
            .finish()
    }
}

fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

impl WebAuthnBridge {
    pub fn new(
        ceremonies: Arc<dyn Ceremonies>,
        credentials: Arc<dyn CredentialStore>,
        pending: Arc<dyn PendingClaimStore>,
        relying_parties: RelyingPartyCache,
        issuer: Arc<IssuerKey>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            ceremonies,
            credentials,
            pending,
            relying_parties,
            issuer,
            settings,
        }
    }

    async fn bounded<T, E>(&self, fut: impl Future<Output = Result<T, E>>) -> Result<T, BridgeError>
    where
        BridgeError: From<E>,
    {
        match tokio::time::timeout(self.settings.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BridgeError::Timeout),
        }
    }

    /// Mint a server-signed claim for `subject`; its hash becomes the challenge.
    fn allocate(&self, session_public_key: [u8; 32], subject: &str) -> Result<Dwt, BridgeError> {
        let mut claim = Dwt::new_challenge(
            session_public_key,
            subject,
            unix_now(),
            self.settings.lifetime_seconds,
        )?;
        claim.sign_as_issuer(&self.issuer);
        Ok(claim)
    }

    async fn hold(&self, subject: &str, pending: &PendingCeremony) -> Result<(), BridgeError> {
        let blob = serde_json::to_string(pending)
            .map_err(|_| crate::dwt::ClaimError::Malformed("pending ceremony encoding"))?;
        self.bounded(self.pending.put(subject, &blob, self.settings.pending_ttl))
            .await
    }

    /// Load the pending ceremony and check the echoed challenge against it
    /// before anything else looks at the response.
    async fn take_pending(
        &self,
        subject: &str,
        kind: CeremonyKind,
        client_data_json: &[u8],
    ) -> Result<(PendingCeremony, String), BridgeError> {
        let blob = self
            .bounded(self.pending.get(subject))
            .await?
            .ok_or(BridgeError::NoPendingCeremony)?;
        let pending: PendingCeremony = serde_json::from_str(&blob).map_err(|_| {
            crate::repos::error::RepoError::Corrupt("pending ceremony".into())
        })?;
        if pending.kind != kind {
            return Err(BridgeError::NoPendingCeremony);
        }

        let (_, echoed, _) = parse_client_data(client_data_json)?;
        if echoed != pending.claim.compute_hash().as_slice() {
            warn!(subject, "ceremony challenge does not match pending claim");
            return Err(crate::dwt::ClaimError::HashMismatch.into());
        }

        Ok((pending, blob))
    }

    async fn release(&self, subject: &str, blob: &str) -> Result<(), BridgeError> {
        if !self.bounded(self.pending.remove_if_equals(subject, blob)).await? {
            // Another completion or a newer ceremony got there first.
            return Err(BridgeError::NoPendingCeremony);
        }
        Ok(())
    }

    pub async fn begin_registration(
        &self,
        subject: &str,
        session_public_key: [u8; 32],
        origin: &str,
    ) -> Result<StartedCeremony, BridgeError> {
        let rp = self.relying_parties.get_or_insert(origin)?;
        let user = self
            .bounded(self.credentials.get_or_create_user(subject))
            .await?;
        let existing: Vec<Vec<u8>> = self
            .bounded(self.credentials.credentials_for_user(user.id))
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let claim = self.allocate(session_public_key, subject)?;
        let options = self
            .bounded(
                self.ceremonies
                    .begin_registration(&rp, &user, &existing, &claim.hash),
            )
            .await?;

        let pending = PendingCeremony {
            kind: CeremonyKind::Registration,
            claim,
            options,
        };
        self.hold(subject, &pending).await?;

        debug!(subject, origin = %rp.origin, "registration ceremony started");
        Ok(StartedCeremony {
            options: pending.options,
            claim: pending.claim,
        })
    }

    /// `session_signature` is the client's signature over the claim hash.
    pub async fn complete_registration(
        &self,
        subject: &str,
        response: &AttestationResponse,
        session_signature: Vec<u8>,
    ) -> Result<RegisteredCredential, BridgeError> {
        let (pending, blob) = self
            .take_pending(subject, CeremonyKind::Registration, &response.client_data_json)
            .await?;
        let user = self
            .bounded(self.credentials.find_user(subject))
            .await?
            .ok_or(BridgeError::UnknownSubject)?;

        let result = self
            .bounded(self.ceremonies.complete_registration(response, &pending.options))
            .await?;
        if self
            .bounded(self.credentials.credential_by_id(&result.credential_id))
            .await?
            .is_some()
        {
            return Err(BridgeError::DuplicateCredential);
        }

        let mut claim = pending.claim;
        claim.session_signature = Some(session_signature);
        claim.validate(
            &self.issuer.verifying_key(),
            unix_now(),
            self.settings.lifetime_seconds,
        )?;
        claim.attach_credential_key(result.public_key.clone())?;

        self.release(subject, &blob).await?;
        let inserted = self
            .bounded(self.credentials.insert_credential(CredentialRecord {
                id: result.credential_id.clone(),
                user_id: user.id,
                public_key: result.public_key,
                sign_count: result.sign_count,
            }))
            .await?;
        if !inserted {
            return Err(BridgeError::DuplicateCredential);
        }

        info!(subject, "credential registered");
        Ok(RegisteredCredential {
            credential_id: result.credential_id,
            claim,
        })
    }

    pub async fn begin_assertion(
        &self,
        subject: &str,
        session_public_key: [u8; 32],
        origin: &str,
    ) -> Result<StartedCeremony, BridgeError> {
        let rp = self.relying_parties.get_or_insert(origin)?;
        let user = self
            .bounded(self.credentials.find_user(subject))
            .await?
            .ok_or(BridgeError::UnknownSubject)?;
        let allowed: Vec<Vec<u8>> = self
            .bounded(self.credentials.credentials_for_user(user.id))
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        if allowed.is_empty() {
            return Err(BridgeError::UnknownCredential);
        }

        let claim = self.allocate(session_public_key, subject)?;
        let options = self
            .bounded(self.ceremonies.begin_assertion(&rp, &allowed, &claim.hash))
            .await?;

        let pending = PendingCeremony {
            kind: CeremonyKind::Assertion,
            claim,
            options,
        };
        self.hold(subject, &pending).await?;

        debug!(subject, origin = %rp.origin, "assertion ceremony started");
        Ok(StartedCeremony {
            options: pending.options,
            claim: pending.claim,
        })
    }

    /// Returns the fully bound, validated claim.
    pub async fn complete_assertion(
        &self,
        subject: &str,
        response: &AssertionResponse,
        session_signature: Vec<u8>,
    ) -> Result<Dwt, BridgeError> {
        let (pending, blob) = self
            .take_pending(subject, CeremonyKind::Assertion, &response.client_data_json)
            .await?;
        let user = self
            .bounded(self.credentials.find_user(subject))
            .await?
            .ok_or(BridgeError::UnknownSubject)?;
        let credential = self
            .bounded(self.credentials.credential_by_id(&response.id))
            .await?
            .filter(|c| c.user_id == user.id)
            .ok_or(BridgeError::UnknownCredential)?;

        let result = self
            .bounded(self.ceremonies.complete_assertion(
                response,
                &pending.options,
                &credential.public_key,
                credential.sign_count,
            ))
            .await?;

        let mut claim = pending.claim;
        claim.session_signature = Some(session_signature);
        claim.validate(
            &self.issuer.verifying_key(),
            unix_now(),
            self.settings.lifetime_seconds,
        )?;

        let (_, echoed, _) = parse_client_data(&response.client_data_json)?;
        claim.bind_credential(
            CredentialBinding {
                public_key: credential.public_key,
                signature: response.signature.clone(),
                authenticator_data: response.authenticator_data.clone(),
                client_data_json: response.client_data_json.clone(),
            },
            &echoed,
        )?;

        self.release(subject, &blob).await?;
        self.bounded(
            self.credentials
                .update_counter(&result.credential_id, result.sign_count),
        )
        .await?;

        info!(subject, "assertion bound to claim");
        Ok(claim)
    }
}
