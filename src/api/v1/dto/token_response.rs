use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Always "Bearer"
    pub token_type: String,
    /// Seconds until the embedded claim expires.
    pub expires_in: u64,
    /// The claim in transport form, for client-side validation.
    pub dwt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyTokenResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}
