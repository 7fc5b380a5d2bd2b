//! The slice of a ledger the delegated signer needs: payment transactions,
//! their identifiers, program-derived addresses and a submission collaborator.

pub mod local;

use std::fmt;

use async_trait::async_trait;
use sha2::{Digest, Sha512_256};
use thiserror::Error;

pub use local::LocalLedger;

/// Domain separator for transaction ids.
const TX_PREFIX: &[u8] = b"TX";
/// Domain separator for program addresses.
const PROGRAM_PREFIX: &[u8] = b"Program";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub const ZERO: Address = Address([0u8; 32]);

    /// Address controlled by a program: `SHA-512/256("Program" ‖ bytecode)`.
    pub fn for_program(bytecode: &[u8]) -> Self {
        let mut hasher = Sha512_256::new();
        hasher.update(PROGRAM_PREFIX);
        hasher.update(bytecode);
        Address(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({self})")
    }
}

/// A payment, valid only between `first_valid` and `last_valid` rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Address,
    pub receiver: Address,
    pub amount: u64,
    pub fee: u64,
    pub first_valid: u64,
    pub last_valid: u64,
    pub note: Vec<u8>,
    pub close_remainder_to: Option<Address>,
    pub rekey_to: Option<Address>,
    pub genesis_id: String,
}

impl Transaction {
    /// Fixed binary layout hashed into the transaction id.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * 4 + 8 * 4 + self.note.len() + 64);
        out.extend_from_slice(&self.sender.0);
        out.extend_from_slice(&self.receiver.0);
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.fee.to_be_bytes());
        out.extend_from_slice(&self.first_valid.to_be_bytes());
        out.extend_from_slice(&self.last_valid.to_be_bytes());
        out.extend_from_slice(&(self.note.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.note);
        out.extend_from_slice(&self.close_remainder_to.unwrap_or(Address::ZERO).0);
        out.extend_from_slice(&self.rekey_to.unwrap_or(Address::ZERO).0);
        out.extend_from_slice(&(self.genesis_id.len() as u32).to_be_bytes());
        out.extend_from_slice(self.genesis_id.as_bytes());
        out
    }

    /// `SHA-512/256("TX" ‖ canonical bytes)`.
    pub fn id(&self) -> TxId {
        let mut hasher = Sha512_256::new();
        hasher.update(TX_PREFIX);
        hasher.update(self.canonical_bytes());
        TxId(hasher.finalize().into())
    }
}

/// Program-signature witness: the program itself plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicSig {
    pub program: Vec<u8>,
    pub args: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub txn: Transaction,
    pub lsig: LogicSig,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The authorizing program ran and rejected the transaction.
    #[error("transaction {txid} rejected by program: {reason}")]
    Rejected { txid: TxId, reason: String },
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("transaction {txid} not confirmed after {rounds} rounds")]
    NotConfirmed { txid: TxId, rounds: u64 },
    #[error("ledger backend error: {0}")]
    Backend(String),
}

/// Submission collaborator. Implementations must be cheap to share.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn submit(&self, stxn: SignedTransaction) -> Result<TxId, LedgerError>;

    /// Wait up to `max_rounds` rounds; returns the confirmed round.
    async fn wait_for_confirmation(&self, txid: &TxId, max_rounds: u64) -> Result<u64, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> Transaction {
        Transaction {
            sender: Address([1u8; 32]),
            receiver: Address([2u8; 32]),
            amount: 1_000,
            fee: 1_000,
            first_valid: 100,
            last_valid: 1_100,
            note: b"hello".to_vec(),
            close_remainder_to: None,
            rekey_to: None,
            genesis_id: "localnet-v1".into(),
        }
    }

    #[test]
    fn txid_commits_to_every_field() {
        let base = payment();
        let id = base.id();

        let mut close = base.clone();
        close.close_remainder_to = Some(Address([3u8; 32]));
        let mut rekey = base.clone();
        rekey.rekey_to = Some(Address([3u8; 32]));
        let mut window = base.clone();
        window.last_valid += 1;

        assert_ne!(id, close.id());
        assert_ne!(id, rekey.id());
        assert_ne!(id, window.id());
        assert_eq!(id, payment().id());
    }

    #[test]
    fn program_address_is_deterministic() {
        let a = Address::for_program(&[1, 2, 3]);
        assert_eq!(a, Address::for_program(&[1, 2, 3]));
        assert_ne!(a, Address::for_program(&[1, 2, 4]));
        assert_eq!(a.to_string().len(), 64);
    }
}
