#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use ciborium::Value;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::{Signer as _, SigningKey};
use p256::ecdsa::signature::Signer as _;

use keychain_auth::chain::{Address, Transaction};
use keychain_auth::codec::{self, BASE64URL_LENIENT};
use keychain_auth::dwt::{CREDENTIAL_KEY_LEN, Dwt, IssuerKey};
use keychain_auth::repos::auth_code_repo::MemoryAuthCodeStore;
use keychain_auth::repos::credential_repo::MemoryCredentialStore;
use keychain_auth::repos::pending_claim_repo::CachePendingClaimStore;
use keychain_auth::services::cache::MemoryCacheClient;
use keychain_auth::services::exchange::AuthCodeExchange;
use keychain_auth::services::token::BearerTokens;
use keychain_auth::services::webauthn::bridge::BridgeSettings;
use keychain_auth::services::webauthn::{
    AssertionResponse, AttestationResponse, CeremonyOptions, Es256Ceremonies, RelyingPartyCache,
    WebAuthnBridge,
};

pub const ORIGIN: &str = "https://wallet.example";
pub const RP_ID: &str = "wallet.example";
pub const ISSUER_SEED: [u8; 32] = [42u8; 32];
pub const LIFETIME: u64 = 43_200;
pub const ISSUER: &str = "https://auth.wallet.example";
pub const AUDIENCE: &str = "wallet";

pub const FLAG_UP: u8 = 0x01;
pub const FLAG_UV: u8 = 0x04;
const FLAG_UP_UV: u8 = FLAG_UP | FLAG_UV;
const FLAG_ATTESTED: u8 = 0x40;

pub fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap()
}

pub fn issuer_pem() -> String {
    SigningKey::from_bytes(&ISSUER_SEED)
        .to_pkcs8_pem(LineEnding::LF)
        .unwrap()
        .to_string()
}

/// Server-side components wired to in-memory stores.
pub struct Harness {
    pub bridge: WebAuthnBridge,
    pub exchange: AuthCodeExchange,
    pub tokens: BearerTokens,
}

impl Harness {
    pub fn new() -> Self {
        let pending = CachePendingClaimStore::new_with_cache(
            Arc::new(MemoryCacheClient::new()),
            "test:pending",
        );
        let bridge = WebAuthnBridge::new(
            Arc::new(Es256Ceremonies::new()),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(pending),
            RelyingPartyCache::new("Keychain"),
            Arc::new(IssuerKey::from_seed(ISSUER_SEED)),
            BridgeSettings {
                lifetime_seconds: LIFETIME,
                pending_ttl: Duration::from_secs(300),
                timeout: Duration::from_secs(5),
            },
        );
        let exchange = AuthCodeExchange::new(
            Arc::new(MemoryAuthCodeStore::new()),
            Duration::from_secs(300),
            Duration::from_secs(5),
        );
        let tokens =
            BearerTokens::new(&issuer_pem(), ISSUER.into(), AUDIENCE.into(), LIFETIME).unwrap();

        Self {
            bridge,
            exchange,
            tokens,
        }
    }
}

/// Base64 session signature over the claim hash, as the client sends it.
pub fn session_signature(session: &SigningKey, claim: &Dwt) -> Vec<u8> {
    session.sign(&claim.compute_hash()).to_bytes().to_vec()
}

pub fn session_signature_b64(session: &SigningKey, claim: &Dwt) -> String {
    STANDARD.encode(session_signature(session, claim))
}

/// A platform authenticator holding one ES256 credential.
pub struct Authenticator {
    key: p256::ecdsa::SigningKey,
    pub credential_id: Vec<u8>,
    counter: AtomicU32,
}

impl Authenticator {
    pub fn new(seed: u8, credential_id: &[u8]) -> Self {
        Self {
            key: p256::ecdsa::SigningKey::from_bytes(&[seed; 32].into()).unwrap(),
            credential_id: credential_id.to_vec(),
            counter: AtomicU32::new(0),
        }
    }

    pub fn public_key(&self) -> [u8; CREDENTIAL_KEY_LEN] {
        self.key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .try_into()
            .unwrap()
    }

    fn cose_key(&self) -> Value {
        let point = self.key.verifying_key().to_encoded_point(false);
        let int = |n: i64| Value::Integer(n.into());
        Value::Map(vec![
            (int(1), int(2)),
            (int(3), int(-7)),
            (int(-1), int(1)),
            (int(-2), Value::Bytes(point.x().unwrap().to_vec())),
            (int(-3), Value::Bytes(point.y().unwrap().to_vec())),
        ])
    }

    pub fn attest(&self, options: &CeremonyOptions) -> AttestationResponse {
        let client_data_json = client_data("webauthn.create", &options.challenge, &options.origin);

        let mut auth_data = codec::sha256(options.rp_id.as_bytes()).to_vec();
        auth_data.push(FLAG_UP_UV | FLAG_ATTESTED);
        auth_data.extend_from_slice(&0u32.to_be_bytes());
        auth_data.extend_from_slice(&[0u8; 16]);
        auth_data.extend_from_slice(&(self.credential_id.len() as u16).to_be_bytes());
        auth_data.extend_from_slice(&self.credential_id);
        ciborium::ser::into_writer(&self.cose_key(), &mut auth_data).unwrap();

        let attestation = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text("none".into())),
            (Value::Text("attStmt".into()), Value::Map(vec![])),
            (Value::Text("authData".into()), Value::Bytes(auth_data)),
        ]);

        let mut attestation_object = Vec::new();
        ciborium::ser::into_writer(&attestation, &mut attestation_object).unwrap();

        AttestationResponse {
            id: self.credential_id.clone(),
            client_data_json,
            attestation_object,
        }
    }

    /// Assert over the options' challenge.
    pub fn assert(&self, options: &CeremonyOptions) -> AssertionResponse {
        self.assert_challenge(options, &options.challenge)
    }

    /// Assert over an arbitrary challenge, as a compromised client would.
    pub fn assert_challenge(&self, options: &CeremonyOptions, challenge: &[u8]) -> AssertionResponse {
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let client_data_json = client_data("webauthn.get", challenge, &options.origin);
        let (authenticator_data, signature) = self.sign_get(&options.rp_id, count, &client_data_json);

        AssertionResponse {
            id: self.credential_id.clone(),
            client_data_json,
            authenticator_data,
            signature,
            user_handle: None,
        }
    }

    /// `(authenticatorData, DER signature)` over `authData ‖ SHA256(cdj)`.
    pub fn sign_get(&self, rp_id: &str, count: u32, client_data_json: &[u8]) -> (Vec<u8>, Vec<u8>) {
        self.sign_get_with_flags(rp_id, count, FLAG_UP_UV, client_data_json)
    }

    /// As [`Self::sign_get`], with an arbitrary flags byte under a valid signature.
    pub fn sign_get_with_flags(
        &self,
        rp_id: &str,
        count: u32,
        flags: u8,
        client_data_json: &[u8],
    ) -> (Vec<u8>, Vec<u8>) {
        let mut auth_data = codec::sha256(rp_id.as_bytes()).to_vec();
        auth_data.push(flags);
        auth_data.extend_from_slice(&count.to_be_bytes());

        let mut signed = auth_data.clone();
        signed.extend_from_slice(&codec::sha256(client_data_json));
        let signature: p256::ecdsa::Signature = self.key.sign(&signed);
        (auth_data, signature.to_der().as_bytes().to_vec())
    }
}

pub fn client_data(kind: &str, challenge: &[u8], origin: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "type": kind,
        "challenge": BASE64URL_LENIENT.encode(challenge),
        "origin": origin,
        "crossOrigin": false,
    }))
    .unwrap()
}

pub fn payment(sender: Address, first_valid: u64, last_valid: u64) -> Transaction {
    Transaction {
        sender,
        receiver: Address([9u8; 32]),
        amount: 250_000,
        fee: 1_000,
        first_valid,
        last_valid,
        note: b"coffee".to_vec(),
        close_remainder_to: None,
        rekey_to: None,
        genesis_id: "localnet-v1".into(),
    }
}
