//! Bearer tokens carrying a credential-bound DWT.
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::codec::BASE64URL_LENIENT;
use crate::dwt::{ClaimError, Dwt, IssuerKey};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("issuer key error: {0}")]
    Key(String),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error("'{0}' does not match the embedded claim")]
    Mismatch(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
    pub jti: String,
    /// DWT transport form (base64url JSON).
    pub dwt: String,
}

/// EdDSA bearer tokens signed with the issuer key.
///
/// - Key material is not printable via Debug.
#[derive(Clone)]
pub struct BearerTokens {
    issuer: String,
    audience: String,
    lifetime_seconds: u64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer_verifying_key: VerifyingKey,
}

impl std::fmt::Debug for BearerTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerTokens")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("lifetime_seconds", &self.lifetime_seconds)
            .finish()
    }
}

impl BearerTokens {
    /// `private_key_pem` must be an Ed25519 private key in PKCS#8 PEM format,
    /// the same key that signs claim hashes.
    pub fn new(
        private_key_pem: &str,
        issuer: String,
        audience: String,
        lifetime_seconds: u64,
    ) -> Result<Self, TokenError> {
        let encoding_key = EncodingKey::from_ed_pem(private_key_pem.as_bytes()).map_err(|e| {
            warn!(error = %e, "failed to parse issuer private key PEM (expected Ed25519 PKCS#8 PEM)");
            TokenError::Key(e.to_string())
        })?;
        let issuer_verifying_key = IssuerKey::from_pkcs8_pem(private_key_pem)?.verifying_key();
        let decoding_key =
            DecodingKey::from_ed_components(&BASE64URL_LENIENT.encode(issuer_verifying_key.as_bytes()))?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_audience(&[audience.as_str()]);
        validation.leeway = 0;

        Ok(Self {
            issuer,
            audience,
            lifetime_seconds,
            encoding_key,
            decoding_key,
            validation,
            issuer_verifying_key,
        })
    }

    pub fn issuer_verifying_key(&self) -> &VerifyingKey {
        &self.issuer_verifying_key
    }

    /// The token expires with the claim it carries.
    pub fn mint(&self, claim: &Dwt, now: u64) -> Result<String, TokenError> {
        claim.bound_credential()?;

        let claims = BearerClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: claim.subject.clone(),
            exp: claim.expiration,
            iat: now,
            jti: Uuid::new_v4().to_string(),
            dwt: claim.to_transport()?,
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = Some("JWT".to_string());
        jsonwebtoken::encode(&header, &claims, &self.encoding_key).map_err(|e| {
            error!(error = %e, "failed to sign bearer token");
            TokenError::Jwt(e)
        })
    }

    /// Verify the envelope, then re-validate the embedded claim itself.
    pub fn verify(&self, token: &str, now: u64) -> Result<Dwt, TokenError> {
        let data = jsonwebtoken::decode::<BearerClaims>(token, &self.decoding_key, &self.validation)?;
        let claims = data.claims;

        let dwt = Dwt::from_transport(&claims.dwt)?;
        if claims.sub != dwt.subject {
            return Err(TokenError::Mismatch("sub"));
        }
        if claims.exp != dwt.expiration {
            return Err(TokenError::Mismatch("exp"));
        }
        dwt.validate(&self.issuer_verifying_key, now, self.lifetime_seconds)?;
        dwt.bound_credential()?;

        Ok(dwt)
    }

    pub fn is_valid(&self, token: &str, now: u64) -> bool {
        self.verify(token, now).is_ok()
    }
}

/// Read the embedded claim without verifying anything. For the token holder,
/// which cannot verify the envelope but re-checks the claim itself.
pub fn unverified_claim(token: &str) -> Result<Dwt, TokenError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or(TokenError::Mismatch("token format"))?;
    let json = crate::codec::decode_b64url(payload).map_err(ClaimError::from)?;
    let claims: BearerClaims =
        serde_json::from_slice(&json).map_err(|_| ClaimError::Malformed("bearer token payload"))?;
    Ok(Dwt::from_transport(&claims.dwt)?)
}
