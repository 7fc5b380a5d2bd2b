//! In-process ledger that authorizes program-signed payments by running the
//! program. Used by tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::chain::{Address, Ledger, LedgerError, SignedTransaction, TxId};
use crate::program::vm::{self, EvalContext};

#[derive(Debug, Default)]
struct LedgerState {
    round: u64,
    confirmed: HashMap<TxId, u64>,
    // account -> address whose program currently authorizes it
    auth_addresses: HashMap<Address, Address>,
}

#[derive(Debug, Default)]
pub struct LocalLedger {
    state: Mutex<LedgerState>,
}

impl LocalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_round(round: u64) -> Self {
        let ledger = Self::default();
        ledger.lock().round = round;
        ledger
    }

    pub fn current_round(&self) -> u64 {
        self.lock().round
    }

    pub fn advance_round(&self, by: u64) -> u64 {
        let mut state = self.lock();
        state.round = state.round.saturating_add(by);
        state.round
    }

    /// Address whose program must sign for `account`.
    pub fn auth_address(&self, account: &Address) -> Address {
        self.lock()
            .auth_addresses
            .get(account)
            .copied()
            .unwrap_or(*account)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Ledger for LocalLedger {
    async fn submit(&self, stxn: SignedTransaction) -> Result<TxId, LedgerError> {
        let txn = &stxn.txn;
        let txid = txn.id();
        let mut state = self.lock();

        if txn.first_valid > txn.last_valid {
            return Err(LedgerError::InvalidTransaction(
                "first_valid is after last_valid".into(),
            ));
        }
        if state.round < txn.first_valid || state.round > txn.last_valid {
            return Err(LedgerError::InvalidTransaction(format!(
                "round {} outside validity window {}..={}",
                state.round, txn.first_valid, txn.last_valid
            )));
        }
        if state.confirmed.contains_key(&txid) {
            return Err(LedgerError::InvalidTransaction(format!(
                "transaction {txid} already confirmed"
            )));
        }

        let signer = Address::for_program(&stxn.lsig.program);
        let expected = state
            .auth_addresses
            .get(&txn.sender)
            .copied()
            .unwrap_or(txn.sender);
        if signer != expected {
            tracing::warn!(%txid, %signer, %expected, "program does not control sender");
            return Err(LedgerError::Rejected {
                txid,
                reason: "program does not control the sender".into(),
            });
        }

        let ctx = EvalContext::new(txn, &stxn.lsig.args);
        let approval = vm::eval_bytecode(&stxn.lsig.program, &ctx).map_err(|e| {
            tracing::error!(%txid, error = %e, "program rejected transaction");
            LedgerError::Rejected {
                txid,
                reason: e.to_string(),
            }
        })?;

        let round = state.round;
        state.confirmed.insert(txid, round);
        if let Some(to) = txn.rekey_to.filter(|a| *a != Address::ZERO) {
            state.auth_addresses.insert(txn.sender, to);
        }

        tracing::debug!(%txid, round, cost = approval.cost, "transaction confirmed");
        Ok(txid)
    }

    async fn wait_for_confirmation(&self, txid: &TxId, max_rounds: u64) -> Result<u64, LedgerError> {
        // Submission confirms synchronously, so there is nothing to wait for.
        self.lock()
            .confirmed
            .get(txid)
            .copied()
            .ok_or(LedgerError::NotConfirmed {
                txid: *txid,
                rounds: max_rounds,
            })
    }
}
