//! Fixed-layout byte encoding and the claim hash chain.
//!
//! Everything in this module is shared by the server, the client signing
//! bridge and the process-side reference verifier. The stack-machine program
//! re-derives the same bytes on its own, so any change here must be mirrored
//! in `program::template`.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use p256::ecdsa::Signature as P256Signature;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// base64url that emits no padding and accepts input with or without it.
///
/// WebAuthn clients are inconsistent about challenge padding; the program's
/// `base64url_decode` op uses the same engine.
pub const BASE64URL_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("malformed DER signature")]
    InvalidDer,
    #[error("invalid base64")]
    InvalidBase64,
}

pub fn encode_u64_be(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

pub fn decode_u64_be(bytes: &[u8]) -> Result<u64, CodecError> {
    let fixed: [u8; 8] = bytes.try_into().map_err(|_| CodecError::InvalidLength {
        expected: 8,
        actual: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(fixed))
}

pub fn sha256(input: &[u8]) -> [u8; 32] {
    Sha256::digest(input).into()
}

/// `SHA256(sessionPublicKey ‖ expiration_be ‖ utf8(subject) ‖ nonce)`.
pub fn compute_hash(
    session_public_key: &[u8; 32],
    expiration: u64,
    subject: &str,
    nonce: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(session_public_key);
    hasher.update(encode_u64_be(expiration));
    hasher.update(subject.as_bytes());
    hasher.update(nonce);
    hasher.finalize().into()
}

/// The payload a WebAuthn authenticator signs: `SHA256(authenticatorData ‖ SHA256(clientDataJSON))`.
pub fn webauthn_signed_digest(authenticator_data: &[u8], client_data_json: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(authenticator_data);
    hasher.update(sha256(client_data_json));
    hasher.finalize().into()
}

/// Split a DER-encoded P-256 ECDSA signature into raw 32-byte R and S.
///
/// Components that do not fit the curve order are rejected, never truncated.
pub fn der_to_rs(der: &[u8]) -> Result<([u8; 32], [u8; 32]), CodecError> {
    let sig = P256Signature::from_der(der).map_err(|_| CodecError::InvalidDer)?;
    let (r, s) = sig.split_bytes();

    let mut r_out = [0u8; 32];
    let mut s_out = [0u8; 32];
    r_out.copy_from_slice(&r);
    s_out.copy_from_slice(&s);
    Ok((r_out, s_out))
}

pub fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CodecError> {
    bytes.try_into().map_err(|_| CodecError::InvalidLength {
        expected: N,
        actual: bytes.len(),
    })
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD.decode(s).map_err(|_| CodecError::InvalidBase64)
}

pub fn decode_b64url(s: &str) -> Result<Vec<u8>, CodecError> {
    BASE64URL_LENIENT
        .decode(s)
        .map_err(|_| CodecError::InvalidBase64)
}

/// serde: `Vec<u8>` as standard base64.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD.decode(raw).map_err(de::Error::custom)
    }
}

/// serde: `Option<Vec<u8>>` as standard base64, `null` when absent.
pub mod b64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| STANDARD.decode(r).map_err(de::Error::custom))
            .transpose()
    }
}

/// serde: `[u8; N]` as standard base64 with an exact length check.
pub mod b64_array {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let raw = String::deserialize(d)?;
        let bytes = STANDARD.decode(raw).map_err(de::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| de::Error::invalid_length(len, &"a fixed-width byte string"))
    }
}

/// serde: `Vec<u8>` as base64url (padding optional on input).
pub mod b64url {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer, de};

    use super::BASE64URL_LENIENT;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64URL_LENIENT.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        BASE64URL_LENIENT.decode(raw).map_err(de::Error::custom)
    }
}

pub mod b64url_opt {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer, de};

    use super::BASE64URL_LENIENT;

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&BASE64URL_LENIENT.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|r| BASE64URL_LENIENT.decode(r).map_err(de::Error::custom))
            .transpose()
    }
}
