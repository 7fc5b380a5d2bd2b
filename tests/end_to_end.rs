mod common;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use ed25519_dalek::SigningKey;

use keychain_auth::chain::{Ledger, LedgerError, LocalLedger, LogicSig, SignedTransaction};
use keychain_auth::dwt::{ClaimError, Dwt};
use keychain_auth::program::reference::{self, Rejection};
use keychain_auth::program::template::args;
use keychain_auth::program::{TemplateInstancer, Variant};
use keychain_auth::services::exchange::{ExchangeError, hash_b64_value};
use keychain_auth::services::webauthn::BridgeError;
use keychain_auth::signing::{ClientSigner, SignerSettings, SigningError, validate_issued_claims};

use common::*;

const SUBJECT: &str = "alice";

struct Session {
    key: SigningKey,
    spk: [u8; 32],
}

impl Session {
    fn new(seed: u8) -> Self {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let spk = key.verifying_key().to_bytes();
        Self { key, spk }
    }
}

async fn register(h: &Harness, session: &Session, authn: &Authenticator) {
    let started = h
        .bridge
        .begin_registration(SUBJECT, session.spk, ORIGIN)
        .await
        .unwrap();
    let attestation = authn.attest(&started.options);
    let registered = h
        .bridge
        .complete_registration(
            SUBJECT,
            &attestation,
            session_signature(&session.key, &started.claim),
        )
        .await
        .unwrap();
    assert_eq!(registered.credential_id, authn.credential_id);
    assert_eq!(
        registered.claim.credential_public_key.as_deref(),
        Some(authn.public_key().as_slice())
    );
    // A registration claim is not an authorization.
    assert!(registered.claim.bound_credential().is_err());
}

/// Assertion, code exchange and client-side validation; returns the bearer
/// token and the redeemed claim.
async fn log_in(h: &Harness, session: &Session, authn: &Authenticator) -> (String, Dwt) {
    let started = h
        .bridge
        .begin_assertion(SUBJECT, session.spk, ORIGIN)
        .await
        .unwrap();
    let ceremony_hash = started.claim.hash;
    assert_eq!(started.options.challenge, ceremony_hash.to_vec());

    let assertion = authn.assert(&started.options);
    let claim = h
        .bridge
        .complete_assertion(
            SUBJECT,
            &assertion,
            session_signature(&session.key, &started.claim),
        )
        .await
        .unwrap();

    let verifier = STANDARD.encode([7u8; 32]);
    let challenge = hash_b64_value(&verifier).unwrap();
    let code = h
        .exchange
        .issue_code(&claim, "state-1", &challenge, Utc::now())
        .await
        .unwrap();
    let redeemed = h
        .exchange
        .redeem_code(&code, "state-1", &verifier, Utc::now())
        .await
        .unwrap();
    assert_eq!(redeemed, claim);
    assert!(matches!(
        h.exchange
            .redeem_code(&code, "state-1", &verifier, Utc::now())
            .await,
        Err(ExchangeError::CodeAlreadyConsumed)
    ));

    let now = unix_now();
    validate_issued_claims(&redeemed, &session.spk, &ceremony_hash, now, LIFETIME).unwrap();

    let token = h.tokens.mint(&redeemed, now).unwrap();
    assert_eq!(h.tokens.verify(&token, now).unwrap(), redeemed);
    (token, redeemed)
}

fn single_key() -> TemplateInstancer {
    TemplateInstancer {
        variant: Variant::SingleKey,
        allow_rotation: false,
    }
}

fn multi_key() -> TemplateInstancer {
    TemplateInstancer {
        variant: Variant::MultiKey,
        allow_rotation: false,
    }
}

#[tokio::test]
async fn alice_signs_a_payment_with_her_bound_claim() {
    let h = Harness::new();
    let session = Session::new(1);
    let authn = Authenticator::new(11, b"alice-platform-key");

    register(&h, &session, &authn).await;
    let (token, claim) = log_in(&h, &session, &authn).await;

    let ledger = Arc::new(LocalLedger::with_round(1_000));
    let signer = ClientSigner::initialize(
        &token,
        session.key.clone(),
        &single_key(),
        &[],
        ledger.clone(),
        SignerSettings::default(),
    )
    .await
    .unwrap();
    assert_eq!(signer.claim(), &claim);
    assert_eq!(signer.program().template.origin(), ORIGIN);
    assert_eq!(signer.program().template.credential_keys(), &[authn.public_key()]);

    let txn = payment(signer.address(), 990, 1_010);
    let arguments = signer.build_args(&txn).unwrap();
    assert_eq!(arguments.len(), 9);
    assert_eq!(
        reference::verify(&signer.program().template, &txn, &arguments),
        Ok(())
    );

    let txid = signer.sign(txn.clone()).await.unwrap();
    assert_eq!(txid, txn.id());
    assert_eq!(ledger.wait_for_confirmation(&txid, 1).await.unwrap(), 1_000);
}

#[tokio::test]
async fn challenge_of_an_earlier_claim_is_refused() {
    let h = Harness::new();
    let session = Session::new(2);
    let authn = Authenticator::new(12, b"alice-key");
    register(&h, &session, &authn).await;

    let earlier = h
        .bridge
        .begin_assertion(SUBJECT, session.spk, ORIGIN)
        .await
        .unwrap();
    let started = h
        .bridge
        .begin_assertion(SUBJECT, session.spk, ORIGIN)
        .await
        .unwrap();
    assert_ne!(earlier.claim.hash, started.claim.hash);

    // Both claims were issued and server-signed; the ceremony still commits
    // to the latest one only.
    let assertion = authn.assert_challenge(&started.options, &earlier.claim.hash);

    let result = h
        .bridge
        .complete_assertion(
            SUBJECT,
            &assertion,
            session_signature(&session.key, &started.claim),
        )
        .await;
    assert!(matches!(
        result,
        Err(BridgeError::Claim(ClaimError::HashMismatch))
    ));
}

#[tokio::test]
async fn completion_without_session_signature_of_the_claim_is_refused() {
    let h = Harness::new();
    let session = Session::new(3);
    let other = Session::new(4);
    let authn = Authenticator::new(13, b"alice-key");
    register(&h, &session, &authn).await;

    let started = h
        .bridge
        .begin_assertion(SUBJECT, session.spk, ORIGIN)
        .await
        .unwrap();
    let assertion = authn.assert(&started.options);
    let result = h
        .bridge
        .complete_assertion(
            SUBJECT,
            &assertion,
            session_signature(&other.key, &started.claim),
        )
        .await;
    assert!(matches!(result, Err(BridgeError::Claim(ClaimError::SignatureInvalid(_)))));
}

#[tokio::test]
async fn validity_window_past_expiration_is_rejected_on_chain() {
    let h = Harness::new();
    let session = Session::new(5);
    let authn = Authenticator::new(14, b"alice-key");
    register(&h, &session, &authn).await;
    let (token, claim) = log_in(&h, &session, &authn).await;

    let ledger = Arc::new(LocalLedger::with_round(1_000));
    let signer = ClientSigner::initialize(
        &token,
        session.key.clone(),
        &single_key(),
        &[],
        ledger,
        SignerSettings::default(),
    )
    .await
    .unwrap();

    let txn = payment(signer.address(), 990, claim.expiration);
    let arguments = signer.build_args(&txn).unwrap();
    assert_eq!(
        reference::verify(&signer.program().template, &txn, &arguments),
        Err(Rejection::Expired)
    );
    assert!(matches!(
        signer.sign(txn).await,
        Err(SigningError::ProgramRejected { .. })
    ));
}

#[tokio::test]
async fn tampered_arguments_are_rejected_by_both_verifiers() {
    let h = Harness::new();
    let session = Session::new(6);
    let authn = Authenticator::new(15, b"alice-key");
    register(&h, &session, &authn).await;
    let (token, _) = log_in(&h, &session, &authn).await;

    let ledger = Arc::new(LocalLedger::with_round(1_000));
    let signer = ClientSigner::initialize(
        &token,
        session.key.clone(),
        &single_key(),
        &[],
        ledger.clone(),
        SignerSettings::default(),
    )
    .await
    .unwrap();
    let txn = payment(signer.address(), 990, 1_010);

    let mut arguments = signer.build_args(&txn).unwrap();
    arguments[usize::from(args::SUBJECT)] = b"mallory".to_vec();
    assert_eq!(
        reference::verify(&signer.program().template, &txn, &arguments),
        Err(Rejection::ChallengeMismatch)
    );

    let stxn = SignedTransaction {
        txn,
        lsig: LogicSig {
            program: signer.program().bytecode.clone(),
            args: arguments,
        },
    };
    assert!(matches!(
        ledger.submit(stxn).await,
        Err(LedgerError::Rejected { .. })
    ));
}

#[tokio::test]
async fn multi_key_program_accepts_listed_keys_only() {
    let h = Harness::new();
    let session = Session::new(7);
    let phone = Authenticator::new(16, b"alice-phone");
    let laptop = Authenticator::new(17, b"alice-laptop");
    let stranger = Authenticator::new(18, b"someone-else");

    register(&h, &session, &phone).await;
    register(&h, &session, &laptop).await;
    let allow_list = [phone.public_key(), laptop.public_key()];

    // Each listed credential authorizes the same address.
    let mut addresses = Vec::new();
    for authn in [&phone, &laptop] {
        let (token, _) = log_in(&h, &session, authn).await;
        let ledger = Arc::new(LocalLedger::with_round(1_000));
        let signer = ClientSigner::initialize(
            &token,
            session.key.clone(),
            &multi_key(),
            &allow_list,
            ledger,
            SignerSettings::default(),
        )
        .await
        .unwrap();

        let txn = payment(signer.address(), 990, 1_010);
        let arguments = signer.build_args(&txn).unwrap();
        assert_eq!(arguments.len(), 10);
        assert_eq!(
            reference::verify(&signer.program().template, &txn, &arguments),
            Ok(())
        );
        signer.sign(txn).await.unwrap();
        addresses.push(signer.address());
    }
    assert_eq!(addresses[0], addresses[1]);

    // A claim bound to the laptop cannot pose as an unlisted key.
    let (token, _) = log_in(&h, &session, &laptop).await;
    let ledger = Arc::new(LocalLedger::with_round(1_000));
    let signer = ClientSigner::initialize(
        &token,
        session.key.clone(),
        &multi_key(),
        &allow_list,
        ledger.clone(),
        SignerSettings::default(),
    )
    .await
    .unwrap();
    let txn = payment(signer.address(), 990, 1_010);
    let mut arguments = signer.build_args(&txn).unwrap();
    arguments[usize::from(args::CREDENTIAL_PUBLIC_KEY)] = stranger.public_key().to_vec();
    assert_eq!(
        reference::verify(&signer.program().template, &txn, &arguments),
        Err(Rejection::CredentialNotAllowed)
    );
    let stxn = SignedTransaction {
        txn,
        lsig: LogicSig {
            program: signer.program().bytecode.clone(),
            args: arguments,
        },
    };
    assert!(matches!(
        ledger.submit(stxn).await,
        Err(LedgerError::Rejected { .. })
    ));

    // The signer refuses an allow-list that leaves out its own credential.
    let result = ClientSigner::initialize(
        &token,
        session.key.clone(),
        &multi_key(),
        &[phone.public_key(), stranger.public_key()],
        Arc::new(LocalLedger::new()),
        SignerSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(SigningError::CredentialNotAllowed)));
}

#[tokio::test]
async fn signer_refuses_a_foreign_session_key() {
    let h = Harness::new();
    let session = Session::new(8);
    let authn = Authenticator::new(19, b"alice-key");
    register(&h, &session, &authn).await;
    let (token, _) = log_in(&h, &session, &authn).await;

    let result = ClientSigner::initialize(
        &token,
        SigningKey::from_bytes(&[99u8; 32]),
        &single_key(),
        &[],
        Arc::new(LocalLedger::new()),
        SignerSettings::default(),
    )
    .await;
    assert!(matches!(result, Err(SigningError::SessionKeyMismatch)));
}

#[tokio::test]
async fn second_completion_of_one_ceremony_fails() {
    let h = Harness::new();
    let session = Session::new(9);
    let authn = Authenticator::new(20, b"alice-key");
    register(&h, &session, &authn).await;

    let started = h
        .bridge
        .begin_assertion(SUBJECT, session.spk, ORIGIN)
        .await
        .unwrap();
    let signature = session_signature(&session.key, &started.claim);
    let first = authn.assert(&started.options);
    let second = authn.assert(&started.options);

    h.bridge
        .complete_assertion(SUBJECT, &first, signature.clone())
        .await
        .unwrap();
    assert!(matches!(
        h.bridge.complete_assertion(SUBJECT, &second, signature).await,
        Err(BridgeError::NoPendingCeremony)
    ));
}

#[tokio::test]
async fn duplicate_registration_of_a_credential_is_refused() {
    let h = Harness::new();
    let session = Session::new(10);
    let authn = Authenticator::new(21, b"alice-key");
    register(&h, &session, &authn).await;

    let started = h
        .bridge
        .begin_registration(SUBJECT, session.spk, ORIGIN)
        .await
        .unwrap();
    let attestation = authn.attest(&started.options);
    let result = h
        .bridge
        .complete_registration(
            SUBJECT,
            &attestation,
            session_signature(&session.key, &started.claim),
        )
        .await;
    // The ceremony itself refuses excluded credentials first.
    assert!(matches!(
        result,
        Err(BridgeError::CeremonyFailed(_)) | Err(BridgeError::DuplicateCredential)
    ));
}

#[tokio::test]
async fn rotating_program_hands_the_account_to_a_new_allow_list() {
    let h = Harness::new();
    let session = Session::new(9);
    let phone = Authenticator::new(21, b"alice-phone");
    let tablet = Authenticator::new(22, b"alice-tablet");
    register(&h, &session, &phone).await;
    register(&h, &session, &tablet).await;

    let rotating = TemplateInstancer {
        variant: Variant::MultiKey,
        allow_rotation: true,
    };
    let ledger = Arc::new(LocalLedger::with_round(1_000));
    let signer_for = |token: String, keys: Vec<[u8; 33]>| {
        let ledger = ledger.clone();
        let session_key = session.key.clone();
        async move {
            ClientSigner::initialize(
                &token,
                session_key,
                &rotating,
                &keys,
                ledger,
                SignerSettings::default(),
            )
            .await
            .unwrap()
        }
    };

    let (token, _) = log_in(&h, &session, &phone).await;
    let current = signer_for(token.clone(), vec![phone.public_key()]).await;
    let next = signer_for(token, vec![phone.public_key(), tablet.public_key()]).await;
    let account = current.address();
    assert_ne!(account, next.address());

    let mut rekey = payment(account, 990, 1_010);
    rekey.amount = 0;
    rekey.rekey_to = Some(next.address());
    current.sign(rekey).await.unwrap();
    assert_eq!(ledger.auth_address(&account), next.address());

    // The old program no longer speaks for the account.
    let spend = payment(account, 990, 1_010);
    assert!(matches!(
        current.sign(spend.clone()).await,
        Err(SigningError::ProgramRejected { .. })
    ));

    // The newly listed tablet does.
    let (token, _) = log_in(&h, &session, &tablet).await;
    let tablet_signer = signer_for(token, vec![phone.public_key(), tablet.public_key()]).await;
    assert_eq!(tablet_signer.address(), next.address());
    tablet_signer.sign(spend).await.unwrap();
}
