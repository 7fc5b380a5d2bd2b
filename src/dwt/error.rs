use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;

/// Which of the two Ed25519 signatures over a claim failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRole {
    Server,
    Session,
}

impl fmt::Display for SignatureRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureRole::Server => write!(f, "server"),
            SignatureRole::Session => write!(f, "session"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("claim expired")]
    ExpiredClaim,
    #[error("claim expiration is further out than the allowed lifetime")]
    LifetimeExceeded,
    #[error("challenge does not match the claim hash")]
    HashMismatch,
    #[error("{0} signature invalid")]
    SignatureInvalid(SignatureRole),
    #[error("claim has no credential binding")]
    MissingCredentialBinding,
    #[error("claim is already bound to a credential")]
    AlreadyBound,
    #[error("entropy source unavailable")]
    Entropy,
    #[error("malformed claim: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
