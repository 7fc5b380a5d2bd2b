use std::collections::HashMap;

use thiserror::Error;

use crate::program::opcode::{Op, TxnField};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    #[error("duplicate label: {0}")]
    DuplicateLabel(String),
    #[error("program has too many instructions")]
    TooLong,
}

#[derive(Debug, Clone, Copy)]
enum Jump {
    Bz,
    Bnz,
    B,
    Callsub,
}

#[derive(Debug)]
enum Slot {
    Ready(Op),
    Jump(Jump, String),
}

/// Builds an instruction list with symbolic branch targets.
#[derive(Debug, Default)]
pub struct Assembler {
    slots: Vec<Slot>,
    labels: HashMap<String, usize>,
    duplicate: Option<String>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.slots.push(Slot::Ready(op));
        self
    }

    pub fn ops(&mut self, ops: impl IntoIterator<Item = Op>) -> &mut Self {
        for op in ops {
            self.op(op);
        }
        self
    }

    pub fn int(&mut self, n: u64) -> &mut Self {
        self.op(Op::Int(n))
    }

    pub fn bytes(&mut self, b: impl Into<Vec<u8>>) -> &mut Self {
        self.op(Op::PushBytes(b.into()))
    }

    pub fn arg(&mut self, i: u8) -> &mut Self {
        self.op(Op::Arg(i))
    }

    pub fn txn(&mut self, field: TxnField) -> &mut Self {
        self.op(Op::Txn(field))
    }

    /// Pops the top value and fails the program unless it is a non-zero uint.
    pub fn assert(&mut self) -> &mut Self {
        self.op(Op::Assert)
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        if self
            .labels
            .insert(name.to_string(), self.slots.len())
            .is_some()
            && self.duplicate.is_none()
        {
            self.duplicate = Some(name.to_string());
        }
        self
    }

    pub fn bz(&mut self, label: &str) -> &mut Self {
        self.jump(Jump::Bz, label)
    }

    pub fn bnz(&mut self, label: &str) -> &mut Self {
        self.jump(Jump::Bnz, label)
    }

    pub fn b(&mut self, label: &str) -> &mut Self {
        self.jump(Jump::B, label)
    }

    pub fn callsub(&mut self, label: &str) -> &mut Self {
        self.jump(Jump::Callsub, label)
    }

    fn jump(&mut self, kind: Jump, label: &str) -> &mut Self {
        self.slots.push(Slot::Jump(kind, label.to_string()));
        self
    }

    pub fn finish(self) -> Result<Vec<Op>, AssembleError> {
        if let Some(name) = self.duplicate {
            return Err(AssembleError::DuplicateLabel(name));
        }
        if self.slots.len() > usize::from(u16::MAX) {
            return Err(AssembleError::TooLong);
        }

        self.slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Ready(op) => Ok(op),
                Slot::Jump(kind, label) => {
                    let target = *self
                        .labels
                        .get(&label)
                        .ok_or_else(|| AssembleError::UnknownLabel(label.clone()))?;
                    let target = u16::try_from(target).map_err(|_| AssembleError::TooLong)?;
                    Ok(match kind {
                        Jump::Bz => Op::Bz(target),
                        Jump::Bnz => Op::Bnz(target),
                        Jump::B => Op::B(target),
                        Jump::Callsub => Op::Callsub(target),
                    })
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_forward_and_backward_labels() {
        let mut asm = Assembler::new();
        asm.label("top")
            .int(0)
            .bnz("done")
            .b("top")
            .label("done")
            .op(Op::Return);

        let ops = asm.finish().unwrap();
        assert_eq!(
            ops,
            vec![Op::Int(0), Op::Bnz(3), Op::B(0), Op::Return]
        );
    }

    #[test]
    fn reports_label_errors() {
        let mut asm = Assembler::new();
        asm.b("nowhere");
        assert_eq!(
            asm.finish(),
            Err(AssembleError::UnknownLabel("nowhere".into()))
        );

        let mut asm = Assembler::new();
        asm.label("x").int(1).label("x");
        assert_eq!(asm.finish(), Err(AssembleError::DuplicateLabel("x".into())));
    }
}
