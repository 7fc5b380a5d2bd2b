use serde::Deserialize;

/// Request body for `/token`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    /// OAuth2-style grant type. Must be "authorization_code".
    pub grant_type: String,
    pub code: String,
    pub state: String,
    pub code_verifier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyTokenRequest {
    pub token: String,
}
