//! Client signing bridge: turns a bearer token and the session key into
//! program-signed transactions.
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use thiserror::Error;
use tracing::{debug, error};

use crate::chain::{Address, Ledger, LedgerError, LogicSig, SignedTransaction, Transaction, TxId};
use crate::codec::{self, CodecError};
use crate::dwt::{CREDENTIAL_KEY_LEN, ClaimError, Dwt, SignatureRole};
use crate::program::{ProgramInstance, ProgramInstancer, TemplateError, Variant};
use crate::services::token::{self, TokenError};
use crate::services::webauthn::parse_client_data;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("token claim is missing {0}")]
    MissingClaim(&'static str),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("session key does not match the claim")]
    SessionKeyMismatch,
    #[error("bound credential is not on the allow-list")]
    CredentialNotAllowed,
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("transaction {txid} rejected by program: {reason}")]
    ProgramRejected { txid: TxId, reason: String },
    #[error("ledger error: {0}")]
    Ledger(LedgerError),
    #[error("ledger call timed out")]
    Timeout,
}

impl From<LedgerError> for SigningError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Rejected { txid, reason } => {
                error!(%txid, %reason, "program rejected transaction");
                SigningError::ProgramRejected { txid, reason }
            }
            other => SigningError::Ledger(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignerSettings {
    pub timeout: Duration,
    /// Rounds to wait for confirmation.
    pub max_rounds: u64,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_rounds: 4,
        }
    }
}

pub struct ClientSigner {
    claim: Dwt,
    session_key: SigningKey,
    credential_key: [u8; CREDENTIAL_KEY_LEN],
    program: ProgramInstance,
    ledger: Arc<dyn Ledger>,
    settings: SignerSettings,
}

impl std::fmt::Debug for ClientSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Do not print key material
        f.debug_struct("ClientSigner")
            .field("subject", &self.claim.subject)
            .field("address", &self.program.address)
            .finish()
    }
}

impl ClientSigner {
    /// Parse the token's claim, check it belongs to `session_key` and is
    /// credential-bound, and derive the program for the bound key and the
    /// origin the ceremony ran on.
    ///
    /// `allow_list` is the full key set of a multi-key program; empty means
    /// just the bound key.
    pub async fn initialize(
        bearer_token: &str,
        session_key: SigningKey,
        instancer: &dyn ProgramInstancer,
        allow_list: &[[u8; CREDENTIAL_KEY_LEN]],
        ledger: Arc<dyn Ledger>,
        settings: SignerSettings,
    ) -> Result<Self, SigningError> {
        let claim = token::unverified_claim(bearer_token)?;
        if claim.session_public_key != session_key.verifying_key().to_bytes() {
            return Err(SigningError::SessionKeyMismatch);
        }

        let bound = claim
            .bound_credential()
            .map_err(|_| SigningError::MissingClaim("credential binding"))?;
        let credential_key: [u8; CREDENTIAL_KEY_LEN] = codec::fixed(bound.public_key)?;
        let (_, _, origin) = parse_client_data(bound.client_data_json)
            .map_err(|_| SigningError::MissingClaim("clientDataJSON origin"))?;

        let keys = if allow_list.is_empty() {
            vec![credential_key]
        } else {
            allow_list.to_vec()
        };
        if !keys.contains(&credential_key) {
            return Err(SigningError::CredentialNotAllowed);
        }

        let program = tokio::time::timeout(settings.timeout, instancer.deploy_or_derive(&keys, &origin))
            .await
            .map_err(|_| SigningError::Timeout)??;
        debug!(subject = %claim.subject, address = %program.address, "signer initialized");

        Ok(Self {
            claim,
            session_key,
            credential_key,
            program,
            ledger,
            settings,
        })
    }

    pub fn address(&self) -> Address {
        self.program.address
    }

    pub fn program(&self) -> &ProgramInstance {
        &self.program
    }

    pub fn claim(&self) -> &Dwt {
        &self.claim
    }

    /// The program's argument vector for `txn`, in program order.
    pub fn build_args(&self, txn: &Transaction) -> Result<Vec<Vec<u8>>, SigningError> {
        let bound = self
            .claim
            .bound_credential()
            .map_err(|_| SigningError::MissingClaim("credential binding"))?;
        let (r, s) = codec::der_to_rs(bound.signature)?;
        let txid = txn.id();
        let session_txn_signature = self.session_key.sign(txid.as_bytes()).to_bytes();

        let mut args = vec![
            self.claim.session_public_key.to_vec(),
            codec::encode_u64_be(self.claim.expiration).to_vec(),
            self.claim.subject.as_bytes().to_vec(),
            self.claim.nonce.to_vec(),
            bound.authenticator_data.to_vec(),
            bound.client_data_json.to_vec(),
            r.to_vec(),
            s.to_vec(),
            session_txn_signature.to_vec(),
        ];
        if self.program.template.variant() == Variant::MultiKey {
            args.push(self.credential_key.to_vec());
        }
        Ok(args)
    }

    /// Authorize `txn` under the program, submit it and wait for confirmation.
    pub async fn sign(&self, txn: Transaction) -> Result<TxId, SigningError> {
        let args = self.build_args(&txn)?;
        let stxn = SignedTransaction {
            txn,
            lsig: LogicSig {
                program: self.program.bytecode.clone(),
                args,
            },
        };

        let txid = tokio::time::timeout(self.settings.timeout, self.ledger.submit(stxn))
            .await
            .map_err(|_| SigningError::Timeout)??;
        let round = tokio::time::timeout(
            self.settings.timeout,
            self.ledger
                .wait_for_confirmation(&txid, self.settings.max_rounds),
        )
        .await
        .map_err(|_| SigningError::Timeout)??;

        debug!(%txid, round, "transaction confirmed");
        Ok(txid)
    }
}

/// Client-side check of a claim returned by the code exchange against the
/// ceremony this client performed.
pub fn validate_issued_claims(
    issued: &Dwt,
    session_public_key: &[u8; 32],
    ceremony_hash: &[u8; 32],
    now: u64,
    lifetime_seconds: u64,
) -> Result<(), ClaimError> {
    if issued.session_public_key != *session_public_key {
        return Err(ClaimError::SignatureInvalid(SignatureRole::Session));
    }
    let hash = issued.compute_hash();
    if hash != *ceremony_hash || issued.hash != hash {
        return Err(ClaimError::HashMismatch);
    }
    if issued.expiration < now {
        return Err(ClaimError::ExpiredClaim);
    }
    if issued.expiration > now.saturating_add(lifetime_seconds) {
        return Err(ClaimError::LifetimeExceeded);
    }

    let bound = issued.bound_credential()?;
    let (_, echoed, _) = parse_client_data(bound.client_data_json)
        .map_err(|_| ClaimError::Malformed("clientDataJSON"))?;
    if echoed != hash {
        return Err(ClaimError::HashMismatch);
    }
    Ok(())
}
