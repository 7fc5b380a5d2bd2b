//! Ed25519 key material for the issuer and for client sessions.
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::dwt::error::ClaimError;

/// The issuer's signing key. One key signs claim hashes and bearer tokens.
#[derive(Clone)]
pub struct IssuerKey {
    signing: SigningKey,
}

impl std::fmt::Debug for IssuerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Do not print key material
        f.debug_struct("IssuerKey")
            .field("public", &hex::encode(self.signing.verifying_key().as_bytes()))
            .finish()
    }
}

impl IssuerKey {
    /// `pem` must be an Ed25519 private key in PKCS#8 PEM format.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, ClaimError> {
        let signing = SigningKey::from_pkcs8_pem(pem)
            .map_err(|_| ClaimError::Malformed("issuer key is not an Ed25519 PKCS#8 PEM"))?;
        Ok(Self { signing })
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn sign_hash(&self, hash: &[u8; 32]) -> [u8; 64] {
        self.signing.sign(hash).to_bytes()
    }
}

/// Bare Ed25519 verification of `message` under a raw 32-byte key.
///
/// Any malformed input is reported as a failed verification.
pub fn verify_ed25519(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(pk_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify_strict(message, &sig).is_ok()
}
