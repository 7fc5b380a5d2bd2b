use serde::Deserialize;

use crate::services::webauthn::{AssertionResponse, AttestationResponse};

/// Request body for `/registration/options` and `/assertion/options`.
#[derive(Debug, Clone, Deserialize)]
pub struct CeremonyOptionsRequest {
    pub subject: String,

    /// Base64 Ed25519 public key of the client's session key pair.
    pub session_public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationRequest {
    pub subject: String,
    /// Base64 session signature over the claim hash from the options call.
    pub session_signature: String,
    pub response: AttestationResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssertionRequest {
    pub subject: String,
    pub session_signature: String,
    pub response: AssertionResponse,

    /// Echoed back with the authorization code.
    pub state: String,
    /// `base64(SHA256(base64decode(code_verifier)))`
    pub code_challenge: String,
}
