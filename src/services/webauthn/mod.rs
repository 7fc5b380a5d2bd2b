//! WebAuthn ceremonies bound to DWT claims.
//!
//! The ceremony collaborator ([`Ceremonies`]) verifies the authenticator's
//! cryptography. The [`bridge::WebAuthnBridge`] owns the claim: it sets the
//! ceremony challenge to the claim hash, holds the pending claim per subject
//! and binds the ceremony outputs once the collaborator accepts them.

pub mod bridge;
pub mod es256;
pub mod rp_cache;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec;
use crate::dwt::ClaimError;
use crate::repos::credential_repo::UserRecord;
use crate::repos::error::RepoError;

pub use bridge::WebAuthnBridge;
pub use es256::Es256Ceremonies;
pub use rp_cache::{RelyingPartyCache, RelyingPartyConfig};

/// User entity as sent to the authenticator on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CeremonyUser {
    #[serde(with = "codec::b64url")]
    pub id: Vec<u8>,
    pub name: String,
    pub display_name: String,
}

impl From<&UserRecord> for CeremonyUser {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.user_handle(),
            name: user.name.clone(),
            display_name: user.name.clone(),
        }
    }
}

/// Options for one ceremony. Sent to the client and kept with the pending
/// claim until completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CeremonyOptions {
    #[serde(with = "codec::b64url")]
    pub challenge: Vec<u8>,
    pub rp_id: String,
    pub rp_name: String,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<CeremonyUser>,
    /// Excluded on registration, allowed on assertion.
    pub credential_ids: Vec<String>,
    pub user_verification: String,
    pub timeout_ms: u64,
}

/// Authenticator output of `navigator.credentials.create()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResponse {
    #[serde(with = "codec::b64url")]
    pub id: Vec<u8>,
    #[serde(rename = "clientDataJSON", with = "codec::b64url")]
    pub client_data_json: Vec<u8>,
    #[serde(with = "codec::b64url")]
    pub attestation_object: Vec<u8>,
}

/// Authenticator output of `navigator.credentials.get()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResponse {
    #[serde(with = "codec::b64url")]
    pub id: Vec<u8>,
    #[serde(rename = "clientDataJSON", with = "codec::b64url")]
    pub client_data_json: Vec<u8>,
    #[serde(with = "codec::b64url")]
    pub authenticator_data: Vec<u8>,
    /// DER-encoded ECDSA signature.
    #[serde(with = "codec::b64url")]
    pub signature: Vec<u8>,
    #[serde(default, with = "codec::b64url_opt")]
    pub user_handle: Option<Vec<u8>>,
}

/// A newly created credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialResult {
    pub credential_id: Vec<u8>,
    /// Compressed SEC1 P-256 point.
    pub public_key: Vec<u8>,
    pub sign_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionResult {
    pub credential_id: Vec<u8>,
    pub sign_count: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CeremonyError {
    #[error("clientDataJSON: {0}")]
    ClientData(&'static str),
    #[error("authenticator data: {0}")]
    AuthenticatorData(&'static str),
    #[error("attestation: {0}")]
    Attestation(&'static str),
    #[error("credential not allowed for this ceremony")]
    CredentialNotAllowed,
    #[error("unsupported credential algorithm")]
    UnsupportedAlgorithm,
    #[error("signature counter did not increase")]
    CounterRegression,
    #[error("credential signature invalid")]
    SignatureInvalid,
}

/// The ceremony library: verifies authenticator responses against the
/// options it produced. Challenge selection and persistence stay with the caller.
#[async_trait]
pub trait Ceremonies: Send + Sync {
    async fn begin_registration(
        &self,
        rp: &RelyingPartyConfig,
        user: &UserRecord,
        exclude_credentials: &[Vec<u8>],
        challenge: &[u8],
    ) -> Result<CeremonyOptions, CeremonyError>;

    async fn begin_assertion(
        &self,
        rp: &RelyingPartyConfig,
        allow_credentials: &[Vec<u8>],
        challenge: &[u8],
    ) -> Result<CeremonyOptions, CeremonyError>;

    async fn complete_registration(
        &self,
        response: &AttestationResponse,
        options: &CeremonyOptions,
    ) -> Result<CredentialResult, CeremonyError>;

    async fn complete_assertion(
        &self,
        response: &AssertionResponse,
        options: &CeremonyOptions,
        stored_public_key: &[u8],
        stored_sign_count: u32,
    ) -> Result<AssertionResult, CeremonyError>;
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("ceremony failed: {0}")]
    CeremonyFailed(#[from] CeremonyError),
    #[error("no pending ceremony for subject")]
    NoPendingCeremony,
    #[error("unknown subject")]
    UnknownSubject,
    #[error("unknown credential")]
    UnknownCredential,
    #[error("credential already registered")]
    DuplicateCredential,
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error("storage error: {0}")]
    Storage(#[from] RepoError),
    #[error("collaborator call timed out")]
    Timeout,
}

#[derive(Deserialize)]
struct ClientData {
    #[serde(rename = "type")]
    kind: String,
    challenge: String,
    origin: String,
}

/// Parse clientDataJSON and return `(type, decoded challenge, origin)`.
pub(crate) fn parse_client_data(
    client_data_json: &[u8],
) -> Result<(String, Vec<u8>, String), CeremonyError> {
    let data: ClientData = serde_json::from_slice(client_data_json)
        .map_err(|_| CeremonyError::ClientData("not a JSON object"))?;
    let challenge = codec::decode_b64url(&data.challenge)
        .map_err(|_| CeremonyError::ClientData("challenge is not base64url"))?;
    Ok((data.kind, challenge, data.origin))
}
