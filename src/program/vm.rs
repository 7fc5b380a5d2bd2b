//! Deterministic, cost-metered interpreter for verifier programs.
//!
//! The machine sees only its arguments and the enclosing transaction: no clock,
//! no network, no state beyond its own stack and scratch slots.

use base64::Engine;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature as P256Signature, VerifyingKey as P256VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::chain::{Address, Transaction, TxId};
use crate::codec::BASE64URL_LENIENT;
use crate::dwt::keys::verify_ed25519;
use crate::program::opcode::{self, BytecodeError, Op, TxnField};

/// Execution budget for one program evaluation.
pub const COST_BUDGET: u64 = 20_000;

const MAX_STACK_DEPTH: usize = 1_000;
/// Longest byte string the machine will hold.
pub const MAX_VALUE_LEN: usize = 4_096;
const MAX_CALL_DEPTH: usize = 8;
const SCRATCH_SLOTS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackValue {
    Uint(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error(transparent)]
    Decode(#[from] BytecodeError),
    #[error("err opcode at {0}")]
    ErrOpcode(usize),
    #[error("assertion failed at {0}")]
    AssertFailed(usize),
    #[error("stack underflow at {0}")]
    StackUnderflow(usize),
    #[error("stack overflow at {0}")]
    StackOverflow(usize),
    #[error("type mismatch at {0}")]
    TypeMismatch(usize),
    #[error("missing argument {index} at {pc}")]
    MissingArg { pc: usize, index: u8 },
    #[error("index out of range at {0}")]
    OutOfRange(usize),
    #[error("arithmetic overflow at {0}")]
    Overflow(usize),
    #[error("value too long at {0}")]
    ValueTooLong(usize),
    #[error("invalid json at {0}")]
    BadJson(usize),
    #[error("invalid base64 at {0}")]
    BadBase64(usize),
    #[error("invalid public key at {0}")]
    InvalidKey(usize),
    #[error("call depth exceeded at {0}")]
    CallDepth(usize),
    #[error("retsub without callsub at {0}")]
    RetsubWithoutCall(usize),
    #[error("cost budget exceeded ({0})")]
    CostExceeded(u64),
    #[error("program returned false")]
    Rejected,
}

/// Everything a program may observe.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub txn: &'a Transaction,
    pub txid: TxId,
    pub args: &'a [Vec<u8>],
}

impl<'a> EvalContext<'a> {
    pub fn new(txn: &'a Transaction, args: &'a [Vec<u8>]) -> Self {
        Self {
            txn,
            txid: txn.id(),
            args,
        }
    }
}

/// Successful evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Approval {
    pub cost: u64,
}

pub fn eval_bytecode(bytecode: &[u8], ctx: &EvalContext<'_>) -> Result<Approval, VmError> {
    let ops = opcode::decode(bytecode)?;
    eval(&ops, ctx)
}

pub fn eval(ops: &[Op], ctx: &EvalContext<'_>) -> Result<Approval, VmError> {
    let mut machine = Machine {
        ctx,
        stack: Vec::new(),
        scratch: vec![StackValue::Uint(0); SCRATCH_SLOTS],
        frames: Vec::new(),
        cost: 0,
    };
    machine.run(ops)
}

struct Machine<'c, 'a> {
    ctx: &'c EvalContext<'a>,
    stack: Vec<StackValue>,
    scratch: Vec<StackValue>,
    frames: Vec<usize>,
    cost: u64,
}

impl Machine<'_, '_> {
    fn run(&mut self, ops: &[Op]) -> Result<Approval, VmError> {
        let mut pc = 0usize;

        while let Some(op) = ops.get(pc) {
            self.cost += op.cost();
            if self.cost > COST_BUDGET {
                return Err(VmError::CostExceeded(self.cost));
            }

            let mut next = pc + 1;
            match op {
                Op::Err => return Err(VmError::ErrOpcode(pc)),
                Op::Int(n) => self.push(pc, StackValue::Uint(*n))?,
                Op::PushBytes(b) => self.push(pc, StackValue::Bytes(b.clone()))?,
                Op::Arg(i) => {
                    let arg = self
                        .ctx
                        .args
                        .get(usize::from(*i))
                        .ok_or(VmError::MissingArg { pc, index: *i })?;
                    self.push(pc, StackValue::Bytes(arg.clone()))?;
                }
                Op::Txn(field) => {
                    let v = self.txn_field(*field);
                    self.push(pc, v)?;
                }
                Op::ZeroAddress => self.push(pc, StackValue::Bytes(Address::ZERO.0.to_vec()))?,
                Op::Load(i) => {
                    let v = self.scratch[usize::from(*i)].clone();
                    self.push(pc, v)?;
                }
                Op::Store(i) => {
                    let v = self.pop(pc)?;
                    self.scratch[usize::from(*i)] = v;
                }
                Op::Dup => {
                    let v = self.stack.last().cloned().ok_or(VmError::StackUnderflow(pc))?;
                    self.push(pc, v)?;
                }
                Op::Pop => {
                    self.pop(pc)?;
                }
                Op::Sha256 => {
                    let data = self.pop_bytes(pc)?;
                    self.push(pc, StackValue::Bytes(Sha256::digest(&data).to_vec()))?;
                }
                Op::Concat => {
                    let b = self.pop_bytes(pc)?;
                    let mut a = self.pop_bytes(pc)?;
                    a.extend_from_slice(&b);
                    self.push(pc, StackValue::Bytes(a))?;
                }
                Op::Len => {
                    let data = self.pop_bytes(pc)?;
                    self.push(pc, StackValue::Uint(data.len() as u64))?;
                }
                Op::Btoi => {
                    let data = self.pop_bytes(pc)?;
                    if data.len() > 8 {
                        return Err(VmError::OutOfRange(pc));
                    }
                    let n = data.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                    self.push(pc, StackValue::Uint(n))?;
                }
                Op::Extract3 => {
                    let len = self.pop_uint(pc)?;
                    let start = self.pop_uint(pc)?;
                    let data = self.pop_bytes(pc)?;
                    let end = start.checked_add(len).ok_or(VmError::OutOfRange(pc))?;
                    if end > data.len() as u64 {
                        return Err(VmError::OutOfRange(pc));
                    }
                    let slice = data[start as usize..end as usize].to_vec();
                    self.push(pc, StackValue::Bytes(slice))?;
                }
                Op::GetBit => {
                    let index = self.pop_uint(pc)?;
                    let target = self.pop(pc)?;
                    let bit = get_bit(&target, index).ok_or(VmError::OutOfRange(pc))?;
                    self.push(pc, StackValue::Uint(bit))?;
                }
                Op::Eq => {
                    let b = self.pop(pc)?;
                    let a = self.pop(pc)?;
                    let equal = match (&a, &b) {
                        (StackValue::Uint(x), StackValue::Uint(y)) => x == y,
                        (StackValue::Bytes(x), StackValue::Bytes(y)) => x == y,
                        _ => return Err(VmError::TypeMismatch(pc)),
                    };
                    self.push(pc, StackValue::Uint(equal as u64))?;
                }
                Op::Gt | Op::Lt | Op::And | Op::Add | Op::Mul => {
                    let b = self.pop_uint(pc)?;
                    let a = self.pop_uint(pc)?;
                    let v = match op {
                        Op::Gt => (a > b) as u64,
                        Op::Lt => (a < b) as u64,
                        Op::And => (a != 0 && b != 0) as u64,
                        Op::Add => a.checked_add(b).ok_or(VmError::Overflow(pc))?,
                        _ => a.checked_mul(b).ok_or(VmError::Overflow(pc))?,
                    };
                    self.push(pc, StackValue::Uint(v))?;
                }
                Op::JsonString => {
                    let key = self.pop_bytes(pc)?;
                    let json = self.pop_bytes(pc)?;
                    let value = json_string(&json, &key).ok_or(VmError::BadJson(pc))?;
                    self.push(pc, StackValue::Bytes(value))?;
                }
                Op::Base64UrlDecode => {
                    let encoded = self.pop_bytes(pc)?;
                    let decoded = BASE64URL_LENIENT
                        .decode(&encoded)
                        .map_err(|_| VmError::BadBase64(pc))?;
                    self.push(pc, StackValue::Bytes(decoded))?;
                }
                Op::EcdsaPkDecompressP256 => {
                    let compressed = self.pop_bytes(pc)?;
                    let (x, y) = decompress_p256(&compressed).ok_or(VmError::InvalidKey(pc))?;
                    self.push(pc, StackValue::Bytes(x))?;
                    self.push(pc, StackValue::Bytes(y))?;
                }
                Op::EcdsaVerifyP256 => {
                    let y = self.pop_bytes(pc)?;
                    let x = self.pop_bytes(pc)?;
                    let s = self.pop_bytes(pc)?;
                    let r = self.pop_bytes(pc)?;
                    let digest = self.pop_bytes(pc)?;
                    if digest.len() != 32 {
                        return Err(VmError::OutOfRange(pc));
                    }
                    let ok = verify_p256(&digest, &r, &s, &x, &y).ok_or(VmError::InvalidKey(pc))?;
                    self.push(pc, StackValue::Uint(ok as u64))?;
                }
                Op::Ed25519VerifyBare => {
                    let public_key = self.pop_bytes(pc)?;
                    let signature = self.pop_bytes(pc)?;
                    let data = self.pop_bytes(pc)?;
                    let ok = verify_ed25519(&public_key, &data, &signature);
                    self.push(pc, StackValue::Uint(ok as u64))?;
                }
                Op::Assert => {
                    if self.pop_uint(pc)? == 0 {
                        return Err(VmError::AssertFailed(pc));
                    }
                }
                Op::Bz(target) => {
                    if self.pop_uint(pc)? == 0 {
                        next = usize::from(*target);
                    }
                }
                Op::Bnz(target) => {
                    if self.pop_uint(pc)? != 0 {
                        next = usize::from(*target);
                    }
                }
                Op::B(target) => next = usize::from(*target),
                Op::Callsub(target) => {
                    if self.frames.len() >= MAX_CALL_DEPTH {
                        return Err(VmError::CallDepth(pc));
                    }
                    self.frames.push(pc + 1);
                    next = usize::from(*target);
                }
                Op::Retsub => {
                    next = self.frames.pop().ok_or(VmError::RetsubWithoutCall(pc))?;
                }
                Op::Return => {
                    let v = self.pop_uint(pc)?;
                    return self.finish(v);
                }
            }
            pc = next;
        }

        // Falling off the end: exactly one non-zero uint must remain.
        if self.stack.len() != 1 {
            return Err(VmError::Rejected);
        }
        let v = self.pop_uint(pc)?;
        self.finish(v)
    }

    fn finish(&self, v: u64) -> Result<Approval, VmError> {
        if v == 0 {
            return Err(VmError::Rejected);
        }
        Ok(Approval { cost: self.cost })
    }

    fn txn_field(&self, field: TxnField) -> StackValue {
        let txn = self.ctx.txn;
        match field {
            TxnField::TxId => StackValue::Bytes(self.ctx.txid.0.to_vec()),
            TxnField::FirstValid => StackValue::Uint(txn.first_valid),
            TxnField::LastValid => StackValue::Uint(txn.last_valid),
            TxnField::CloseRemainderTo => {
                StackValue::Bytes(txn.close_remainder_to.unwrap_or(Address::ZERO).0.to_vec())
            }
            TxnField::RekeyTo => StackValue::Bytes(txn.rekey_to.unwrap_or(Address::ZERO).0.to_vec()),
            TxnField::Sender => StackValue::Bytes(txn.sender.0.to_vec()),
        }
    }

    fn push(&mut self, pc: usize, v: StackValue) -> Result<(), VmError> {
        if self.stack.len() >= MAX_STACK_DEPTH {
            return Err(VmError::StackOverflow(pc));
        }
        if let StackValue::Bytes(b) = &v
            && b.len() > MAX_VALUE_LEN
        {
            return Err(VmError::ValueTooLong(pc));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self, pc: usize) -> Result<StackValue, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow(pc))
    }

    fn pop_uint(&mut self, pc: usize) -> Result<u64, VmError> {
        match self.pop(pc)? {
            StackValue::Uint(n) => Ok(n),
            StackValue::Bytes(_) => Err(VmError::TypeMismatch(pc)),
        }
    }

    fn pop_bytes(&mut self, pc: usize) -> Result<Vec<u8>, VmError> {
        match self.pop(pc)? {
            StackValue::Bytes(b) => Ok(b),
            StackValue::Uint(_) => Err(VmError::TypeMismatch(pc)),
        }
    }
}

/// Uints count bits from the least significant end; byte strings from the
/// leftmost bit of the first byte.
fn get_bit(target: &StackValue, index: u64) -> Option<u64> {
    match target {
        StackValue::Uint(n) => (index < 64).then(|| (n >> index) & 1),
        StackValue::Bytes(b) => {
            let byte = *b.get(usize::try_from(index / 8).ok()?)?;
            Some(u64::from((byte >> (7 - (index % 8))) & 1))
        }
    }
}

fn json_string(json: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    let value: serde_json::Value = serde_json::from_slice(json).ok()?;
    let key = std::str::from_utf8(key).ok()?;
    match value.as_object()?.get(key)? {
        serde_json::Value::String(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

fn decompress_p256(compressed: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    if compressed.len() != 33 {
        return None;
    }
    let key = P256VerifyingKey::from_sec1_bytes(compressed).ok()?;
    let point = key.to_encoded_point(false);
    Some((point.x()?.to_vec(), point.y()?.to_vec()))
}

/// `None` when the key itself is unusable; `Some(false)` for a bad signature.
fn verify_p256(digest: &[u8], r: &[u8], s: &[u8], x: &[u8], y: &[u8]) -> Option<bool> {
    if x.len() != 32 || y.len() != 32 {
        return None;
    }
    let point = EncodedPoint::from_affine_coordinates(
        FieldBytes::from_slice(x),
        FieldBytes::from_slice(y),
        false,
    );
    let key = P256VerifyingKey::from_encoded_point(&point).ok()?;

    if r.len() != 32 || s.len() != 32 {
        return Some(false);
    }
    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(r);
    rs[32..].copy_from_slice(s);
    let Ok(sig) = P256Signature::from_slice(&rs) else {
        return Some(false);
    };

    Some(key.verify_prehash(digest, &sig).is_ok())
}
