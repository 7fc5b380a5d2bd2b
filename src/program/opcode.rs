//! Instruction set and bytecode encoding for verifier programs.
//!
//! Bytecode is a version byte followed by instructions. Each instruction is an
//! opcode byte plus its immediates:
//! - `u8` immediates for arg/scratch indices and transaction fields
//! - `u64` immediates as 8 bytes big-endian
//! - byte-string immediates as a `u16` big-endian length then the bytes
//! - branch targets as a `u16` big-endian instruction index

use thiserror::Error;

pub const BYTECODE_VERSION: u8 = 1;

/// Transaction fields a program may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnField {
    TxId,
    FirstValid,
    LastValid,
    CloseRemainderTo,
    RekeyTo,
    Sender,
}

impl TxnField {
    fn code(self) -> u8 {
        match self {
            TxnField::TxId => 0,
            TxnField::FirstValid => 1,
            TxnField::LastValid => 2,
            TxnField::CloseRemainderTo => 3,
            TxnField::RekeyTo => 4,
            TxnField::Sender => 5,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => TxnField::TxId,
            1 => TxnField::FirstValid,
            2 => TxnField::LastValid,
            3 => TxnField::CloseRemainderTo,
            4 => TxnField::RekeyTo,
            5 => TxnField::Sender,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Fail immediately.
    Err,
    Int(u64),
    PushBytes(Vec<u8>),
    Arg(u8),
    Txn(TxnField),
    ZeroAddress,
    Load(u8),
    Store(u8),
    Dup,
    Pop,
    Sha256,
    Concat,
    Len,
    Btoi,
    /// Pops length, start, bytes.
    Extract3,
    /// Pops bit index, target. Bytes are indexed from the leftmost bit.
    GetBit,
    Eq,
    Gt,
    Lt,
    And,
    Add,
    Mul,
    /// Pops key, JSON object; pushes the string value under `key`.
    JsonString,
    Base64UrlDecode,
    /// Pops a compressed P-256 point; pushes X then Y.
    EcdsaPkDecompressP256,
    /// Pops Y, X, S, R, digest; pushes 1 if the signature verifies.
    EcdsaVerifyP256,
    /// Pops public key, signature, data; pushes 1 if the signature verifies.
    Ed25519VerifyBare,
    Assert,
    Bz(u16),
    Bnz(u16),
    B(u16),
    Callsub(u16),
    Retsub,
    Return,
}

impl Op {
    /// Opcode cost charged against the execution budget.
    pub fn cost(&self) -> u64 {
        match self {
            Op::Sha256 => 35,
            Op::JsonString => 25,
            Op::Base64UrlDecode => 8,
            Op::EcdsaPkDecompressP256 => 2400,
            Op::EcdsaVerifyP256 => 2500,
            Op::Ed25519VerifyBare => 1900,
            _ => 1,
        }
    }

    fn opcode(&self) -> u8 {
        match self {
            Op::Err => 0x00,
            Op::Int(_) => 0x01,
            Op::PushBytes(_) => 0x02,
            Op::Arg(_) => 0x03,
            Op::Txn(_) => 0x04,
            Op::ZeroAddress => 0x05,
            Op::Load(_) => 0x06,
            Op::Store(_) => 0x07,
            Op::Dup => 0x08,
            Op::Pop => 0x09,
            Op::Sha256 => 0x10,
            Op::Concat => 0x11,
            Op::Len => 0x12,
            Op::Btoi => 0x13,
            Op::Extract3 => 0x14,
            Op::GetBit => 0x15,
            Op::Eq => 0x20,
            Op::Gt => 0x21,
            Op::Lt => 0x22,
            Op::And => 0x23,
            Op::Add => 0x24,
            Op::Mul => 0x25,
            Op::JsonString => 0x30,
            Op::Base64UrlDecode => 0x31,
            Op::EcdsaPkDecompressP256 => 0x40,
            Op::EcdsaVerifyP256 => 0x41,
            Op::Ed25519VerifyBare => 0x42,
            Op::Assert => 0x50,
            Op::Bz(_) => 0x51,
            Op::Bnz(_) => 0x52,
            Op::B(_) => 0x53,
            Op::Callsub(_) => 0x54,
            Op::Retsub => 0x55,
            Op::Return => 0x56,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), BytecodeError> {
        out.push(self.opcode());
        match self {
            Op::Int(n) => out.extend_from_slice(&n.to_be_bytes()),
            Op::PushBytes(bytes) => {
                let len = u16::try_from(bytes.len()).map_err(|_| BytecodeError::ImmediateTooLong)?;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Op::Arg(i) | Op::Load(i) | Op::Store(i) => out.push(*i),
            Op::Txn(field) => out.push(field.code()),
            Op::Bz(t) | Op::Bnz(t) | Op::B(t) | Op::Callsub(t) => {
                out.extend_from_slice(&t.to_be_bytes())
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("empty program")]
    Empty,
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
    #[error("unknown transaction field {0}")]
    UnknownField(u8),
    #[error("byte immediate longer than 65535 bytes")]
    ImmediateTooLong,
    #[error("branch target {0} is outside the program")]
    BadTarget(u16),
}

pub fn encode(ops: &[Op]) -> Result<Vec<u8>, BytecodeError> {
    let mut out = vec![BYTECODE_VERSION];
    for op in ops {
        op.encode_into(&mut out)?;
    }
    Ok(out)
}

pub fn decode(bytecode: &[u8]) -> Result<Vec<Op>, BytecodeError> {
    let (&version, mut rest) = bytecode.split_first().ok_or(BytecodeError::Empty)?;
    if version != BYTECODE_VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let mut ops = Vec::new();
    let mut offset = 1usize;
    while let Some((&opcode, tail)) = rest.split_first() {
        let at = offset;
        let mut reader = Reader { buf: tail, offset: at + 1 };

        let op = match opcode {
            0x00 => Op::Err,
            0x01 => Op::Int(u64::from_be_bytes(reader.take_array::<8>()?)),
            0x02 => {
                let len = u16::from_be_bytes(reader.take_array::<2>()?) as usize;
                Op::PushBytes(reader.take(len)?.to_vec())
            }
            0x03 => Op::Arg(reader.take_array::<1>()?[0]),
            0x04 => {
                let code = reader.take_array::<1>()?[0];
                Op::Txn(TxnField::from_code(code).ok_or(BytecodeError::UnknownField(code))?)
            }
            0x05 => Op::ZeroAddress,
            0x06 => Op::Load(reader.take_array::<1>()?[0]),
            0x07 => Op::Store(reader.take_array::<1>()?[0]),
            0x08 => Op::Dup,
            0x09 => Op::Pop,
            0x10 => Op::Sha256,
            0x11 => Op::Concat,
            0x12 => Op::Len,
            0x13 => Op::Btoi,
            0x14 => Op::Extract3,
            0x15 => Op::GetBit,
            0x20 => Op::Eq,
            0x21 => Op::Gt,
            0x22 => Op::Lt,
            0x23 => Op::And,
            0x24 => Op::Add,
            0x25 => Op::Mul,
            0x30 => Op::JsonString,
            0x31 => Op::Base64UrlDecode,
            0x40 => Op::EcdsaPkDecompressP256,
            0x41 => Op::EcdsaVerifyP256,
            0x42 => Op::Ed25519VerifyBare,
            0x50 => Op::Assert,
            0x51 => Op::Bz(u16::from_be_bytes(reader.take_array::<2>()?)),
            0x52 => Op::Bnz(u16::from_be_bytes(reader.take_array::<2>()?)),
            0x53 => Op::B(u16::from_be_bytes(reader.take_array::<2>()?)),
            0x54 => Op::Callsub(u16::from_be_bytes(reader.take_array::<2>()?)),
            0x55 => Op::Retsub,
            0x56 => Op::Return,
            other => {
                return Err(BytecodeError::UnknownOpcode {
                    opcode: other,
                    offset: at,
                });
            }
        };

        ops.push(op);
        offset = reader.offset;
        rest = reader.buf;
    }

    for op in &ops {
        if let Op::Bz(t) | Op::Bnz(t) | Op::B(t) | Op::Callsub(t) = op
            && usize::from(*t) >= ops.len()
        {
            return Err(BytecodeError::BadTarget(*t));
        }
    }

    Ok(ops)
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BytecodeError> {
        if self.buf.len() < n {
            return Err(BytecodeError::Truncated(self.offset));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        self.offset += n;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], BytecodeError> {
        let head = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_it_encodes() {
        let ops = vec![
            Op::Int(42),
            Op::PushBytes(b"webauthn.get".to_vec()),
            Op::Arg(9),
            Op::Txn(TxnField::RekeyTo),
            Op::Bnz(0),
            Op::Return,
        ];
        let bytes = encode(&ops).unwrap();
        assert_eq!(bytes[0], BYTECODE_VERSION);
        assert_eq!(decode(&bytes).unwrap(), ops);
    }

    #[test]
    fn rejects_truncated_and_unknown_input() {
        assert_eq!(decode(&[]), Err(BytecodeError::Empty));
        assert_eq!(decode(&[9]), Err(BytecodeError::UnsupportedVersion(9)));
        assert_eq!(decode(&[1, 0x01, 0, 0]), Err(BytecodeError::Truncated(2)));
        assert_eq!(
            decode(&[1, 0xee]),
            Err(BytecodeError::UnknownOpcode { opcode: 0xee, offset: 1 })
        );
    }

    #[test]
    fn rejects_branch_past_the_end() {
        let bytes = encode(&[Op::B(5), Op::Return]).unwrap();
        assert_eq!(decode(&bytes), Err(BytecodeError::BadTarget(5)));
    }
}
