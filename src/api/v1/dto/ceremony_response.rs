use serde::Serialize;

use crate::dwt::Dwt;
use crate::services::webauthn::CeremonyOptions;

#[derive(Debug, Clone, Serialize)]
pub struct CeremonyOptionsResponse {
    pub options: CeremonyOptions,
    /// Server-signed claim; `claim.hash` is `options.challenge`.
    pub claim: Dwt,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResponse {
    /// Base64url credential id.
    pub credential_id: String,
    pub claim: Dwt,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionCodeResponse {
    pub code: String,
    pub state: String,
}
