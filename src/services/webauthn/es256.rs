//! Built-in ceremony verifier for ES256 (P-256) credentials with `none`
//! attestation.
use async_trait::async_trait;
use base64::Engine;
use p256::ecdsa::signature::Verifier as _;
use p256::ecdsa::{Signature, VerifyingKey};
use ciborium::Value;
use p256::{EncodedPoint, FieldBytes};

use crate::codec::{self, BASE64URL_LENIENT};
use crate::repos::credential_repo::UserRecord;
use crate::services::webauthn::{
    AssertionResponse, AssertionResult, AttestationResponse, CeremonyError, CeremonyOptions,
    CeremonyUser, Ceremonies, CredentialResult, RelyingPartyConfig, parse_client_data,
};

const FLAG_USER_PRESENT: u8 = 0x01;
const FLAG_USER_VERIFIED: u8 = 0x04;
const FLAG_ATTESTED_DATA: u8 = 0x40;

const COSE_KTY_EC2: i64 = 2;
const COSE_ALG_ES256: i64 = -7;
const COSE_CRV_P256: i64 = 1;

const CEREMONY_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct Es256Ceremonies;

impl Es256Ceremonies {
    pub fn new() -> Self {
        Self
    }
}

/// Decode one CBOR item from the front of `input`, advancing past it.
fn decode_cbor(input: &mut &[u8]) -> Option<Value> {
    ciborium::de::from_reader(input).ok()
}

fn map_entry<'a>(map: &'a Value, key: &Value) -> Option<&'a Value> {
    map.as_map()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn text_entry<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map_entry(map, &Value::Text(key.to_string()))
}

fn label_entry(map: &Value, label: i64) -> Option<&Value> {
    map_entry(map, &Value::Integer(label.into()))
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_integer().and_then(|n| i64::try_from(n).ok())
}

struct AuthenticatorData<'a> {
    rp_id_hash: &'a [u8],
    flags: u8,
    sign_count: u32,
    // (credential id, COSE key)
    attested: Option<(Vec<u8>, Value)>,
}

fn parse_authenticator_data(bytes: &[u8]) -> Result<AuthenticatorData<'_>, CeremonyError> {
    if bytes.len() < 37 {
        return Err(CeremonyError::AuthenticatorData("shorter than 37 bytes"));
    }
    let rp_id_hash = &bytes[..32];
    let flags = bytes[32];
    let sign_count = u32::from_be_bytes([bytes[33], bytes[34], bytes[35], bytes[36]]);

    let attested = if flags & FLAG_ATTESTED_DATA != 0 {
        // aaguid(16) ‖ idLen(2) ‖ id ‖ COSE key
        let rest = &bytes[37..];
        if rest.len() < 18 {
            return Err(CeremonyError::AuthenticatorData("truncated attested data"));
        }
        let id_len = usize::from(u16::from_be_bytes([rest[16], rest[17]]));
        let rest = &rest[18..];
        if rest.len() < id_len {
            return Err(CeremonyError::AuthenticatorData("truncated credential id"));
        }
        let (id, mut key_bytes) = rest.split_at(id_len);
        // Extensions, if any, follow the key.
        let key = decode_cbor(&mut key_bytes)
            .ok_or(CeremonyError::AuthenticatorData("malformed credential key"))?;
        Some((id.to_vec(), key))
    } else {
        None
    };

    Ok(AuthenticatorData {
        rp_id_hash,
        flags,
        sign_count,
        attested,
    })
}

fn check_authenticator_data(
    data: &AuthenticatorData<'_>,
    rp: &CeremonyOptions,
) -> Result<(), CeremonyError> {
    if data.rp_id_hash != codec::sha256(rp.rp_id.as_bytes()).as_slice() {
        return Err(CeremonyError::AuthenticatorData("rpIdHash mismatch"));
    }
    if data.flags & FLAG_USER_PRESENT == 0 {
        return Err(CeremonyError::AuthenticatorData("user not present"));
    }
    if data.flags & FLAG_USER_VERIFIED == 0 {
        return Err(CeremonyError::AuthenticatorData("user not verified"));
    }
    Ok(())
}

fn check_client_data(
    client_data_json: &[u8],
    expected_type: &str,
    options: &CeremonyOptions,
) -> Result<(), CeremonyError> {
    let (kind, challenge, origin) = parse_client_data(client_data_json)?;
    if kind != expected_type {
        return Err(CeremonyError::ClientData("wrong ceremony type"));
    }
    if challenge != options.challenge {
        return Err(CeremonyError::ClientData("challenge mismatch"));
    }
    if origin != options.origin {
        return Err(CeremonyError::ClientData("origin mismatch"));
    }
    Ok(())
}

/// COSE EC2 P-256 key to a compressed SEC1 point.
fn compress_cose_key(key: &Value) -> Result<Vec<u8>, CeremonyError> {
    let int = |label| label_entry(key, label).and_then(as_i64);
    if int(1) != Some(COSE_KTY_EC2) || int(3) != Some(COSE_ALG_ES256) || int(-1) != Some(COSE_CRV_P256) {
        return Err(CeremonyError::UnsupportedAlgorithm);
    }
    let coordinate = |label| {
        label_entry(key, label)
            .and_then(Value::as_bytes)
            .filter(|b| b.len() == 32)
            .ok_or(CeremonyError::Attestation("malformed EC2 coordinate"))
    };
    let x = FieldBytes::from_slice(coordinate(-2)?);
    let y = FieldBytes::from_slice(coordinate(-3)?);

    let point = EncodedPoint::from_affine_coordinates(x, y, false);
    let vk = VerifyingKey::from_encoded_point(&point)
        .map_err(|_| CeremonyError::Attestation("credential key is not on P-256"))?;
    Ok(vk.to_encoded_point(true).as_bytes().to_vec())
}

fn options(
    rp: &RelyingPartyConfig,
    user: Option<CeremonyUser>,
    credential_ids: &[Vec<u8>],
    challenge: &[u8],
) -> CeremonyOptions {
    CeremonyOptions {
        challenge: challenge.to_vec(),
        rp_id: rp.rp_id.clone(),
        rp_name: rp.rp_name.clone(),
        origin: rp.origin.clone(),
        user,
        credential_ids: credential_ids
            .iter()
            .map(|id| BASE64URL_LENIENT.encode(id))
            .collect(),
        user_verification: "required".to_string(),
        timeout_ms: CEREMONY_TIMEOUT_MS,
    }
}

fn listed(options: &CeremonyOptions, credential_id: &[u8]) -> bool {
    let encoded = BASE64URL_LENIENT.encode(credential_id);
    options.credential_ids.iter().any(|id| *id == encoded)
}

#[async_trait]
impl Ceremonies for Es256Ceremonies {
    async fn begin_registration(
        &self,
        rp: &RelyingPartyConfig,
        user: &UserRecord,
        exclude_credentials: &[Vec<u8>],
        challenge: &[u8],
    ) -> Result<CeremonyOptions, CeremonyError> {
        Ok(options(rp, Some(user.into()), exclude_credentials, challenge))
    }

    async fn begin_assertion(
        &self,
        rp: &RelyingPartyConfig,
        allow_credentials: &[Vec<u8>],
        challenge: &[u8],
    ) -> Result<CeremonyOptions, CeremonyError> {
        Ok(options(rp, None, allow_credentials, challenge))
    }

    async fn complete_registration(
        &self,
        response: &AttestationResponse,
        options: &CeremonyOptions,
    ) -> Result<CredentialResult, CeremonyError> {
        check_client_data(&response.client_data_json, "webauthn.create", options)?;

        let mut input = response.attestation_object.as_slice();
        let attestation = decode_cbor(&mut input)
            .filter(|_| input.is_empty())
            .ok_or(CeremonyError::Attestation("malformed attestation object"))?;
        if text_entry(&attestation, "fmt").and_then(Value::as_text) != Some("none") {
            return Err(CeremonyError::Attestation("unsupported attestation format"));
        }
        let auth_data = text_entry(&attestation, "authData")
            .and_then(Value::as_bytes)
            .ok_or(CeremonyError::Attestation("missing authData"))?;

        let data = parse_authenticator_data(auth_data)?;
        check_authenticator_data(&data, options)?;
        let (credential_id, key) = data
            .attested
            .as_ref()
            .ok_or(CeremonyError::AuthenticatorData("no attested credential"))?;

        if *credential_id != response.id {
            return Err(CeremonyError::Attestation("credential id mismatch"));
        }
        if listed(options, credential_id) {
            return Err(CeremonyError::CredentialNotAllowed);
        }

        Ok(CredentialResult {
            credential_id: credential_id.clone(),
            public_key: compress_cose_key(key)?,
            sign_count: data.sign_count,
        })
    }

    async fn complete_assertion(
        &self,
        response: &AssertionResponse,
        options: &CeremonyOptions,
        stored_public_key: &[u8],
        stored_sign_count: u32,
    ) -> Result<AssertionResult, CeremonyError> {
        check_client_data(&response.client_data_json, "webauthn.get", options)?;
        if !options.credential_ids.is_empty() && !listed(options, &response.id) {
            return Err(CeremonyError::CredentialNotAllowed);
        }

        let data = parse_authenticator_data(&response.authenticator_data)?;
        check_authenticator_data(&data, options)?;

        // Authenticators without a counter always report zero.
        if (data.sign_count != 0 || stored_sign_count != 0) && data.sign_count <= stored_sign_count {
            return Err(CeremonyError::CounterRegression);
        }

        let key =
            VerifyingKey::from_sec1_bytes(stored_public_key).map_err(|_| CeremonyError::SignatureInvalid)?;
        let signature =
            Signature::from_der(&response.signature).map_err(|_| CeremonyError::SignatureInvalid)?;

        let mut signed_data = response.authenticator_data.clone();
        signed_data.extend_from_slice(&codec::sha256(&response.client_data_json));
        key.verify(&signed_data, &signature)
            .map_err(|_| CeremonyError::SignatureInvalid)?;

        Ok(AssertionResult {
            credential_id: response.id.clone(),
            sign_count: data.sign_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_authenticator_data_is_rejected() {
        assert!(matches!(
            parse_authenticator_data(&[0u8; 36]),
            Err(CeremonyError::AuthenticatorData(_))
        ));
    }

    #[test]
    fn flags_and_rp_id_hash_are_checked() {
        let rp = RelyingPartyConfig::for_origin("https://a.example", "Keychain").unwrap();
        let opts = options(&rp, None, &[], &[1u8; 32]);

        let mut bytes = codec::sha256(b"a.example").to_vec();
        bytes.push(FLAG_USER_PRESENT | FLAG_USER_VERIFIED);
        bytes.extend_from_slice(&[0, 0, 0, 1]);
        let data = parse_authenticator_data(&bytes).unwrap();
        assert!(check_authenticator_data(&data, &opts).is_ok());
        assert_eq!(data.sign_count, 1);

        bytes[32] = FLAG_USER_PRESENT;
        let data = parse_authenticator_data(&bytes).unwrap();
        assert_eq!(
            check_authenticator_data(&data, &opts),
            Err(CeremonyError::AuthenticatorData("user not verified"))
        );

        bytes[0] ^= 1;
        bytes[32] = FLAG_USER_PRESENT | FLAG_USER_VERIFIED;
        let data = parse_authenticator_data(&bytes).unwrap();
        assert_eq!(
            check_authenticator_data(&data, &opts),
            Err(CeremonyError::AuthenticatorData("rpIdHash mismatch"))
        );
    }

    fn int(n: i64) -> Value {
        Value::Integer(n.into())
    }

    fn cose_key(sk: &p256::ecdsa::SigningKey) -> Value {
        let point = sk.verifying_key().to_encoded_point(false);
        Value::Map(vec![
            (int(1), int(COSE_KTY_EC2)),
            (int(3), int(COSE_ALG_ES256)),
            (int(-1), int(COSE_CRV_P256)),
            (int(-2), Value::Bytes(point.x().unwrap().to_vec())),
            (int(-3), Value::Bytes(point.y().unwrap().to_vec())),
        ])
    }

    #[test]
    fn compresses_cose_key() {
        let sk = p256::ecdsa::SigningKey::from_bytes(&[5u8; 32].into()).unwrap();
        let key = cose_key(&sk);

        let compressed = compress_cose_key(&key).unwrap();
        assert_eq!(
            compressed,
            sk.verifying_key().to_encoded_point(true).as_bytes()
        );

        let rs256 = Value::Map(vec![(int(1), int(3)), (int(3), int(-257))]);
        assert_eq!(compress_cose_key(&rs256), Err(CeremonyError::UnsupportedAlgorithm));
    }

    #[test]
    fn credential_key_is_read_ahead_of_extensions() {
        let sk = p256::ecdsa::SigningKey::from_bytes(&[6u8; 32].into()).unwrap();

        let mut bytes = codec::sha256(b"a.example").to_vec();
        bytes.push(FLAG_USER_PRESENT | FLAG_USER_VERIFIED | FLAG_ATTESTED_DATA | 0x80);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(b"abc");
        ciborium::ser::into_writer(&cose_key(&sk), &mut bytes).unwrap();
        let extensions = Value::Map(vec![(Value::Text("credProtect".into()), int(2))]);
        ciborium::ser::into_writer(&extensions, &mut bytes).unwrap();

        let data = parse_authenticator_data(&bytes).unwrap();
        let (id, key) = data.attested.unwrap();
        assert_eq!(id, b"abc");
        assert_eq!(
            compress_cose_key(&key).unwrap(),
            sk.verifying_key().to_encoded_point(true).as_bytes()
        );
    }

    #[tokio::test]
    async fn trailing_bytes_after_attestation_object_are_rejected() {
        let rp = RelyingPartyConfig::for_origin("https://a.example", "Keychain").unwrap();
        let opts = options(&rp, None, &[], &[1u8; 32]);

        let mut attestation_object = Vec::new();
        let attestation = Value::Map(vec![(Value::Text("fmt".into()), Value::Text("none".into()))]);
        ciborium::ser::into_writer(&attestation, &mut attestation_object).unwrap();
        attestation_object.push(0x00);

        let response = AttestationResponse {
            id: b"abc".to_vec(),
            client_data_json: serde_json::to_vec(&serde_json::json!({
                "type": "webauthn.create",
                "challenge": BASE64URL_LENIENT.encode([1u8; 32]),
                "origin": "https://a.example",
            }))
            .unwrap(),
            attestation_object,
        };
        assert_eq!(
            Es256Ceremonies::new().complete_registration(&response, &opts).await.unwrap_err(),
            CeremonyError::Attestation("malformed attestation object")
        );
    }
}
