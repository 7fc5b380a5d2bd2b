//! Process-side rendition of the verifier program.
//!
//! Written directly against the claim rules rather than by interpreting
//! bytecode, so it can be run against the interpreter to catch divergence.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature as P256Signature, VerifyingKey as P256VerifyingKey};
use thiserror::Error;

use crate::chain::{Address, Transaction};
use crate::codec;
use crate::dwt::keys::verify_ed25519;
use crate::program::template::{VerifierTemplate, Variant, WEBAUTHN_GET, args};
use crate::program::vm::MAX_VALUE_LEN;

const FLAG_USER_PRESENT: u8 = 0x01;
const FLAG_USER_VERIFIED: u8 = 0x04;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("transaction closes out the account")]
    CloseRemainderTo,
    #[error("transaction rekeys the account")]
    RekeyTo,
    #[error("missing argument {0}")]
    MissingArgument(u8),
    #[error("argument too long")]
    OversizedArgument,
    #[error("credential key is not on the allow-list")]
    CredentialNotAllowed,
    #[error("clientDataJSON is not an assertion for this origin")]
    ClientData,
    #[error("expiration argument is not 8 bytes")]
    MalformedExpiration,
    #[error("challenge does not commit to the claim")]
    ChallengeMismatch,
    #[error("user presence or verification flag not set")]
    UserNotVerified,
    #[error("credential signature invalid")]
    CredentialSignature,
    #[error("claim expires inside the transaction validity window")]
    Expired,
    #[error("session signature over the transaction invalid")]
    SessionSignature,
}

/// Every program check, in program order.
pub fn verify(
    template: &VerifierTemplate,
    txn: &Transaction,
    arguments: &[Vec<u8>],
) -> Result<(), Rejection> {
    // 1)
    if txn.close_remainder_to.unwrap_or(Address::ZERO) != Address::ZERO {
        return Err(Rejection::CloseRemainderTo);
    }
    if !template.allows_rekey() && txn.rekey_to.unwrap_or(Address::ZERO) != Address::ZERO {
        return Err(Rejection::RekeyTo);
    }

    let arg = |i: u8| arg_at(arguments, i);

    // 2)
    let credential_key: &[u8] = match template.variant() {
        Variant::SingleKey => &template.credential_keys()[0],
        Variant::MultiKey => {
            let supplied = arg(args::CREDENTIAL_PUBLIC_KEY)?;
            template
                .credential_keys()
                .iter()
                .find(|k| k.as_slice() == supplied)
                .ok_or(Rejection::CredentialNotAllowed)?
        }
    };

    let claim = ClaimArguments {
        session_public_key: arg(args::SESSION_PUBLIC_KEY)?,
        expiration: arg(args::EXPIRATION)?,
        subject: arg(args::SUBJECT)?,
        nonce: arg(args::NONCE)?,
        authenticator_data: arg(args::AUTHENTICATOR_DATA)?,
        client_data_json: arg(args::CLIENT_DATA_JSON)?,
        signature_r: arg(args::SIGNATURE_R)?,
        signature_s: arg(args::SIGNATURE_S)?,
        session_txn_signature: arg(args::SESSION_TXN_SIGNATURE)?,
    };

    verify_claim(template.origin(), credential_key, txn, &claim)
}

/// Argument vector split into named fields.
#[derive(Debug, Clone, Copy)]
pub struct ClaimArguments<'a> {
    pub session_public_key: &'a [u8],
    pub expiration: &'a [u8],
    pub subject: &'a [u8],
    pub nonce: &'a [u8],
    pub authenticator_data: &'a [u8],
    pub client_data_json: &'a [u8],
    pub signature_r: &'a [u8],
    pub signature_s: &'a [u8],
    pub session_txn_signature: &'a [u8],
}

/// Steps 3 through 7: everything that depends on the claim itself.
pub fn verify_claim(
    origin: &str,
    credential_key: &[u8],
    txn: &Transaction,
    claim: &ClaimArguments<'_>,
) -> Result<(), Rejection> {
    // 3)
    let client_data: serde_json::Value =
        serde_json::from_slice(claim.client_data_json).map_err(|_| Rejection::ClientData)?;
    let field = |name: &str| {
        client_data
            .as_object()
            .and_then(|o| o.get(name))
            .and_then(|v| v.as_str())
            .ok_or(Rejection::ClientData)
    };
    if field("type")?.as_bytes() != WEBAUTHN_GET || field("origin")? != origin {
        return Err(Rejection::ClientData);
    }
    if claim.expiration.len() != 8 {
        return Err(Rejection::MalformedExpiration);
    }
    let challenge = codec::decode_b64url(field("challenge")?).map_err(|_| Rejection::ClientData)?;

    let preimage = [
        claim.session_public_key,
        claim.expiration,
        claim.subject,
        claim.nonce,
    ]
    .concat();
    if preimage.len() > MAX_VALUE_LEN {
        return Err(Rejection::OversizedArgument);
    }
    if challenge != codec::sha256(&preimage) {
        return Err(Rejection::ChallengeMismatch);
    }

    // 4)
    let flags = *claim
        .authenticator_data
        .get(32)
        .ok_or(Rejection::UserNotVerified)?;
    if flags & FLAG_USER_PRESENT == 0 || flags & FLAG_USER_VERIFIED == 0 {
        return Err(Rejection::UserNotVerified);
    }

    // 5)
    if claim.authenticator_data.len() + 32 > MAX_VALUE_LEN {
        return Err(Rejection::OversizedArgument);
    }
    let digest = codec::webauthn_signed_digest(claim.authenticator_data, claim.client_data_json);
    if !verify_rs(credential_key, &digest, claim.signature_r, claim.signature_s) {
        return Err(Rejection::CredentialSignature);
    }

    // 6)
    let expiration =
        codec::decode_u64_be(claim.expiration).map_err(|_| Rejection::MalformedExpiration)?;
    if expiration <= txn.first_valid || expiration <= txn.last_valid {
        return Err(Rejection::Expired);
    }

    // 7)
    let txid = txn.id();
    if !verify_ed25519(claim.session_public_key, txid.as_bytes(), claim.session_txn_signature) {
        return Err(Rejection::SessionSignature);
    }

    Ok(())
}

fn arg_at(arguments: &[Vec<u8>], i: u8) -> Result<&[u8], Rejection> {
    let a = arguments
        .get(usize::from(i))
        .ok_or(Rejection::MissingArgument(i))?;
    if a.len() > MAX_VALUE_LEN {
        return Err(Rejection::OversizedArgument);
    }
    Ok(a.as_slice())
}

fn verify_rs(compressed_key: &[u8], digest: &[u8; 32], r: &[u8], s: &[u8]) -> bool {
    if compressed_key.len() != 33 || r.len() != 32 || s.len() != 32 {
        return false;
    }
    let Ok(key) = P256VerifyingKey::from_sec1_bytes(compressed_key) else {
        return false;
    };
    let Ok(sig) = P256Signature::from_slice(&[r, s].concat()) else {
        return false;
    };
    key.verify_prehash(digest, &sig).is_ok()
}
