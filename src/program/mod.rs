//! Verifier programs: instruction set, assembler, interpreter, the
//! delegated-signature template and its process-side reference.

pub mod assembler;
pub mod opcode;
pub mod reference;
pub mod template;
pub mod vm;

pub use template::{
    ProgramInstance, ProgramInstancer, TemplateError, TemplateInstancer, Variant, VerifierTemplate,
};
pub use vm::{Approval, EvalContext, VmError};
