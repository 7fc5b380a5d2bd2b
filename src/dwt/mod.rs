//! Decentralized Web Token: the claim set every signature in the system covers.
//!
//! All operations here are pure over the claim struct. Callers pass `now` and
//! the configured lifetime in; nothing reads the clock or configuration.

pub mod error;
pub mod keys;

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::codec::{self, BASE64URL_LENIENT};

pub use error::{ClaimError, SignatureRole};
pub use keys::IssuerKey;

/// Default claim lifetime: 12 hours.
pub const DEFAULT_LIFETIME_SECONDS: u64 = 12 * 60 * 60;

/// Length of a compressed SEC1 P-256 point.
pub const CREDENTIAL_KEY_LEN: usize = 33;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dwt {
    #[serde(with = "codec::b64_array")]
    pub session_public_key: [u8; 32],
    pub expiration: u64,
    pub subject: String,
    #[serde(with = "codec::b64_array")]
    pub nonce: [u8; 32],
    // Carried for convenience only; every check recomputes it.
    #[serde(with = "codec::b64_array")]
    pub hash: [u8; 32],

    #[serde(default, with = "codec::b64_opt", skip_serializing_if = "Option::is_none")]
    pub credential_public_key: Option<Vec<u8>>,
    #[serde(default, with = "codec::b64_opt", skip_serializing_if = "Option::is_none")]
    pub credential_signature: Option<Vec<u8>>,
    #[serde(default, with = "codec::b64_opt", skip_serializing_if = "Option::is_none")]
    pub authenticator_data: Option<Vec<u8>>,
    #[serde(
        rename = "clientDataJSON",
        default,
        with = "codec::b64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_data_json: Option<Vec<u8>>,

    #[serde(default, with = "codec::b64_opt", skip_serializing_if = "Option::is_none")]
    pub session_signature: Option<Vec<u8>>,
    #[serde(default, with = "codec::b64_opt", skip_serializing_if = "Option::is_none")]
    pub server_signature: Option<Vec<u8>>,
}

/// Raw outputs of a completed assertion ceremony.
#[derive(Debug, Clone)]
pub struct CredentialBinding {
    pub public_key: Vec<u8>,
    /// DER-encoded ECDSA signature from the authenticator.
    pub signature: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub client_data_json: Vec<u8>,
}

/// Borrowed view of a fully bound claim, as needed for on-chain arguments.
#[derive(Debug, Clone, Copy)]
pub struct BoundCredential<'a> {
    pub public_key: &'a [u8],
    pub signature: &'a [u8],
    pub authenticator_data: &'a [u8],
    pub client_data_json: &'a [u8],
}

impl Dwt {
    /// Allocate a fresh claim for a ceremony. The returned `hash` is the
    /// ceremony challenge.
    pub fn new_challenge(
        session_public_key: [u8; 32],
        subject: impl Into<String>,
        now: u64,
        lifetime_seconds: u64,
    ) -> Result<Self, ClaimError> {
        let mut nonce = [0u8; 32];
        getrandom::fill(&mut nonce).map_err(|_| ClaimError::Entropy)?;

        Ok(Self::with_nonce(
            session_public_key,
            subject,
            now.saturating_add(lifetime_seconds),
            nonce,
        ))
    }

    pub fn with_nonce(
        session_public_key: [u8; 32],
        subject: impl Into<String>,
        expiration: u64,
        nonce: [u8; 32],
    ) -> Self {
        let subject = subject.into();
        let hash = codec::compute_hash(&session_public_key, expiration, &subject, &nonce);

        Self {
            session_public_key,
            expiration,
            subject,
            nonce,
            hash,
            credential_public_key: None,
            credential_signature: None,
            authenticator_data: None,
            client_data_json: None,
            session_signature: None,
            server_signature: None,
        }
    }

    pub fn compute_hash(&self) -> [u8; 32] {
        codec::compute_hash(
            &self.session_public_key,
            self.expiration,
            &self.subject,
            &self.nonce,
        )
    }

    pub fn sign_as_issuer(&mut self, issuer: &IssuerKey) {
        self.server_signature = Some(issuer.sign_hash(&self.compute_hash()).to_vec());
    }

    /// Client side: sign the hash with the session key this claim names.
    pub fn sign_as_session(&mut self, session_key: &SigningKey) -> Result<(), ClaimError> {
        if session_key.verifying_key().to_bytes() != self.session_public_key {
            return Err(ClaimError::SignatureInvalid(SignatureRole::Session));
        }
        let sig = session_key.sign(&self.compute_hash());
        self.session_signature = Some(sig.to_bytes().to_vec());
        Ok(())
    }

    /// Both signatures over the recomputed hash, plus the expiration window.
    pub fn validate(
        &self,
        issuer: &VerifyingKey,
        now: u64,
        lifetime_seconds: u64,
    ) -> Result<(), ClaimError> {
        let hash = self.compute_hash();
        if hash != self.hash {
            return Err(ClaimError::HashMismatch);
        }

        if self.expiration < now {
            return Err(ClaimError::ExpiredClaim);
        }
        if self.expiration > now.saturating_add(lifetime_seconds) {
            return Err(ClaimError::LifetimeExceeded);
        }

        let server_ok = self
            .server_signature
            .as_deref()
            .is_some_and(|sig| keys::verify_ed25519(issuer.as_bytes(), &hash, sig));
        if !server_ok {
            return Err(ClaimError::SignatureInvalid(SignatureRole::Server));
        }

        let session_ok = self
            .session_signature
            .as_deref()
            .is_some_and(|sig| keys::verify_ed25519(&self.session_public_key, &hash, sig));
        if !session_ok {
            return Err(ClaimError::SignatureInvalid(SignatureRole::Session));
        }

        Ok(())
    }

    pub fn is_valid(&self, issuer: &VerifyingKey, now: u64, lifetime_seconds: u64) -> bool {
        self.validate(issuer, now, lifetime_seconds).is_ok()
    }

    /// Record the ceremony outputs once the WebAuthn collaborator has verified
    /// them. `echoed_challenge` is the decoded challenge from clientDataJSON.
    pub fn bind_credential(
        &mut self,
        binding: CredentialBinding,
        echoed_challenge: &[u8],
    ) -> Result<(), ClaimError> {
        if echoed_challenge != self.compute_hash().as_slice() {
            return Err(ClaimError::HashMismatch);
        }
        if self.credential_signature.is_some() {
            return Err(ClaimError::AlreadyBound);
        }
        if let Some(existing) = &self.credential_public_key
            && existing != &binding.public_key
        {
            return Err(ClaimError::AlreadyBound);
        }
        check_credential_key(&binding.public_key)?;

        self.credential_public_key = Some(binding.public_key);
        self.credential_signature = Some(binding.signature);
        self.authenticator_data = Some(binding.authenticator_data);
        self.client_data_json = Some(binding.client_data_json);
        Ok(())
    }

    /// Registration only proves a credential exists: remember its key without
    /// an authorizing signature.
    pub fn attach_credential_key(&mut self, public_key: Vec<u8>) -> Result<(), ClaimError> {
        if self.credential_public_key.is_some() {
            return Err(ClaimError::AlreadyBound);
        }
        check_credential_key(&public_key)?;
        self.credential_public_key = Some(public_key);
        Ok(())
    }

    pub fn bound_credential(&self) -> Result<BoundCredential<'_>, ClaimError> {
        match (
            self.credential_public_key.as_deref(),
            self.credential_signature.as_deref(),
            self.authenticator_data.as_deref(),
            self.client_data_json.as_deref(),
        ) {
            (Some(public_key), Some(signature), Some(authenticator_data), Some(client_data_json)) => {
                Ok(BoundCredential {
                    public_key,
                    signature,
                    authenticator_data,
                    client_data_json,
                })
            }
            _ => Err(ClaimError::MissingCredentialBinding),
        }
    }

    /// base64url(JSON) for redirects and headers.
    pub fn to_transport(&self) -> Result<String, ClaimError> {
        let json = serde_json::to_vec(self).map_err(|_| ClaimError::Malformed("claim encoding"))?;
        Ok(BASE64URL_LENIENT.encode(json))
    }

    pub fn from_transport(encoded: &str) -> Result<Self, ClaimError> {
        let json = codec::decode_b64url(encoded)?;
        serde_json::from_slice(&json).map_err(|_| ClaimError::Malformed("claim encoding"))
    }
}

fn check_credential_key(public_key: &[u8]) -> Result<(), ClaimError> {
    if public_key.len() != CREDENTIAL_KEY_LEN {
        return Err(ClaimError::Malformed("credential key must be a compressed P-256 point"));
    }
    p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| ClaimError::Malformed("credential key is not on P-256"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn signed_claim() -> (Dwt, IssuerKey, SigningKey) {
        let issuer = IssuerKey::from_seed([1u8; 32]);
        let session = SigningKey::from_bytes(&[2u8; 32]);
        let mut dwt = Dwt::new_challenge(
            session.verifying_key().to_bytes(),
            "alice",
            NOW,
            DEFAULT_LIFETIME_SECONDS,
        )
        .unwrap();
        dwt.sign_as_issuer(&issuer);
        dwt.sign_as_session(&session).unwrap();
        (dwt, issuer, session)
    }

    fn credential_key() -> Vec<u8> {
        let sk = p256::ecdsa::SigningKey::from_bytes(&[42u8; 32].into()).unwrap();
        sk.verifying_key().to_encoded_point(true).as_bytes().to_vec()
    }

    #[test]
    fn fresh_claim_validates() {
        let (dwt, issuer, _) = signed_claim();
        assert_eq!(dwt.expiration, NOW + DEFAULT_LIFETIME_SECONDS);
        assert_eq!(dwt.hash, dwt.compute_hash());
        assert_eq!(dwt.validate(&issuer.verifying_key(), NOW, DEFAULT_LIFETIME_SECONDS), Ok(()));
    }

    #[test]
    fn expired_claim_is_invalid_even_with_good_signatures() {
        let (dwt, issuer, _) = signed_claim();
        let later = dwt.expiration + 1;
        assert_eq!(
            dwt.validate(&issuer.verifying_key(), later, DEFAULT_LIFETIME_SECONDS),
            Err(ClaimError::ExpiredClaim)
        );
    }

    #[test]
    fn expiration_beyond_lifetime_is_rejected() {
        let (dwt, issuer, _) = signed_claim();
        assert_eq!(
            dwt.validate(&issuer.verifying_key(), NOW - 10, DEFAULT_LIFETIME_SECONDS),
            Err(ClaimError::LifetimeExceeded)
        );
    }

    #[test]
    fn single_bit_flip_in_either_signature_invalidates() {
        let (dwt, issuer, _) = signed_claim();
        let vk = issuer.verifying_key();

        for bit in [0usize, 7, 100, 511] {
            let mut server_flipped = dwt.clone();
            server_flipped.server_signature.as_mut().unwrap()[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(
                server_flipped.validate(&vk, NOW, DEFAULT_LIFETIME_SECONDS),
                Err(ClaimError::SignatureInvalid(SignatureRole::Server))
            );

            let mut session_flipped = dwt.clone();
            session_flipped.session_signature.as_mut().unwrap()[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(
                session_flipped.validate(&vk, NOW, DEFAULT_LIFETIME_SECONDS),
                Err(ClaimError::SignatureInvalid(SignatureRole::Session))
            );
        }
    }

    #[test]
    fn missing_signature_invalidates() {
        let (mut dwt, issuer, _) = signed_claim();
        dwt.session_signature = None;
        assert!(!dwt.is_valid(&issuer.verifying_key(), NOW, DEFAULT_LIFETIME_SECONDS));
    }

    #[test]
    fn tampered_field_does_not_validate() {
        let (mut dwt, issuer, _) = signed_claim();
        dwt.subject = "mallory".into();
        assert_eq!(
            dwt.validate(&issuer.verifying_key(), NOW, DEFAULT_LIFETIME_SECONDS),
            Err(ClaimError::HashMismatch)
        );

        // Even with the carried hash patched up, the signatures no longer match.
        dwt.hash = dwt.compute_hash();
        assert_eq!(
            dwt.validate(&issuer.verifying_key(), NOW, DEFAULT_LIFETIME_SECONDS),
            Err(ClaimError::SignatureInvalid(SignatureRole::Server))
        );
    }

    #[test]
    fn session_signature_requires_the_named_key() {
        let (mut dwt, _, _) = signed_claim();
        let other = SigningKey::from_bytes(&[3u8; 32]);
        assert_eq!(
            dwt.sign_as_session(&other),
            Err(ClaimError::SignatureInvalid(SignatureRole::Session))
        );
    }

    #[test]
    fn transport_form_preserves_every_field() {
        let (mut dwt, _, _) = signed_claim();
        let hash = dwt.hash;
        dwt.bind_credential(
            CredentialBinding {
                public_key: credential_key(),
                signature: vec![0x30, 0x44, 1, 2, 3],
                authenticator_data: vec![5u8; 37],
                client_data_json: br#"{"type":"webauthn.get"}"#.to_vec(),
            },
            &hash,
        )
        .unwrap();

        let decoded = Dwt::from_transport(&dwt.to_transport().unwrap()).unwrap();
        assert_eq!(decoded, dwt);
    }

    #[test]
    fn binding_rejects_a_foreign_challenge() {
        let (mut dwt, _, _) = signed_claim();
        let (other, _, _) = signed_claim();

        let err = dwt
            .bind_credential(
                CredentialBinding {
                    public_key: credential_key(),
                    signature: vec![1],
                    authenticator_data: vec![0u8; 37],
                    client_data_json: b"{}".to_vec(),
                },
                &other.hash,
            )
            .unwrap_err();
        assert_eq!(err, ClaimError::HashMismatch);
        assert!(dwt.credential_signature.is_none());
    }

    #[test]
    fn registration_key_alone_is_not_a_binding() {
        let (mut dwt, _, _) = signed_claim();
        dwt.attach_credential_key(credential_key()).unwrap();
        assert_eq!(
            dwt.bound_credential().unwrap_err(),
            ClaimError::MissingCredentialBinding
        );
    }

    #[test]
    fn uncompressed_credential_key_is_rejected() {
        let (mut dwt, _, _) = signed_claim();
        let sk = p256::ecdsa::SigningKey::from_bytes(&[42u8; 32].into()).unwrap();
        let uncompressed = sk.verifying_key().to_encoded_point(false).as_bytes().to_vec();
        assert!(matches!(
            dwt.attach_credential_key(uncompressed),
            Err(ClaimError::Malformed(_))
        ));
    }
}
