//! The delegated-signature verifier, parameterized by credential keys and origin.

use async_trait::async_trait;
use thiserror::Error;

use crate::chain::Address;
use crate::dwt::CREDENTIAL_KEY_LEN;
use crate::program::assembler::{AssembleError, Assembler};
use crate::program::opcode::{self, BytecodeError, Op, TxnField};

/// Deployment-time bound on the origin and on the concatenated key list.
pub const MAX_TEMPLATE_BYTES: usize = 128;
pub const MAX_CREDENTIAL_KEYS: usize = MAX_TEMPLATE_BYTES / CREDENTIAL_KEY_LEN;

pub const WEBAUTHN_GET: &[u8] = b"webauthn.get";

/// Positions of the program arguments.
pub mod args {
    pub const SESSION_PUBLIC_KEY: u8 = 0;
    pub const EXPIRATION: u8 = 1;
    pub const SUBJECT: u8 = 2;
    pub const NONCE: u8 = 3;
    pub const AUTHENTICATOR_DATA: u8 = 4;
    pub const CLIENT_DATA_JSON: u8 = 5;
    pub const SIGNATURE_R: u8 = 6;
    pub const SIGNATURE_S: u8 = 7;
    pub const SESSION_TXN_SIGNATURE: u8 = 8;
    /// Multi-key variant only.
    pub const CREDENTIAL_PUBLIC_KEY: u8 = 9;
}

// Scratch slots
const SLOT_CREDENTIAL_KEY: u8 = 0;
const SLOT_SCAN_INDEX: u8 = 1;
const SLOT_FLAGS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// One credential key baked into the program.
    SingleKey,
    /// The caller names its key; it must be on a baked-in allow-list.
    MultiKey,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("origin must be 1..={} bytes", MAX_TEMPLATE_BYTES)]
    OriginLength,
    #[error("expected 1..={} credential keys, got {}", MAX_CREDENTIAL_KEYS, .0)]
    KeyCount(usize),
    #[error("credential key {0} is not a compressed P-256 point")]
    InvalidKey(usize),
    #[error("single-key programs cannot allow rekeying")]
    RotationNeedsMultiKey,
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierTemplate {
    variant: Variant,
    credential_keys: Vec<[u8; CREDENTIAL_KEY_LEN]>,
    origin: String,
    allow_rekey: bool,
}

impl VerifierTemplate {
    pub fn single_key(
        key: [u8; CREDENTIAL_KEY_LEN],
        origin: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        Self::new(Variant::SingleKey, vec![key], origin.into())
    }

    pub fn multi_key(
        keys: Vec<[u8; CREDENTIAL_KEY_LEN]>,
        origin: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        Self::new(Variant::MultiKey, keys, origin.into())
    }

    fn new(
        variant: Variant,
        credential_keys: Vec<[u8; CREDENTIAL_KEY_LEN]>,
        origin: String,
    ) -> Result<Self, TemplateError> {
        if origin.is_empty() || origin.len() > MAX_TEMPLATE_BYTES {
            return Err(TemplateError::OriginLength);
        }
        if credential_keys.is_empty() || credential_keys.len() > MAX_CREDENTIAL_KEYS {
            return Err(TemplateError::KeyCount(credential_keys.len()));
        }
        for (i, key) in credential_keys.iter().enumerate() {
            p256::ecdsa::VerifyingKey::from_sec1_bytes(key)
                .map_err(|_| TemplateError::InvalidKey(i))?;
        }

        Ok(Self {
            variant,
            credential_keys,
            origin,
            allow_rekey: false,
        })
    }

    /// Let transactions authorized by this program rekey the account. This is
    /// how an address moves to a program with a new allow-list.
    pub fn with_rotation(mut self) -> Result<Self, TemplateError> {
        if self.variant != Variant::MultiKey {
            return Err(TemplateError::RotationNeedsMultiKey);
        }
        self.allow_rekey = true;
        Ok(self)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn credential_keys(&self) -> &[[u8; CREDENTIAL_KEY_LEN]] {
        &self.credential_keys
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn allows_rekey(&self) -> bool {
        self.allow_rekey
    }

    pub fn arg_count(&self) -> usize {
        match self.variant {
            Variant::SingleKey => 9,
            Variant::MultiKey => 10,
        }
    }

    pub fn assemble(&self) -> Result<Vec<Op>, TemplateError> {
        let mut asm = Assembler::new();

        // 1) No close-out, and no rekey unless rotation is enabled.
        asm.txn(TxnField::CloseRemainderTo)
            .op(Op::ZeroAddress)
            .op(Op::Eq)
            .assert();
        if !self.allow_rekey {
            asm.txn(TxnField::RekeyTo)
                .op(Op::ZeroAddress)
                .op(Op::Eq)
                .assert();
        }

        // 2) Which credential key signed.
        match self.variant {
            Variant::SingleKey => {
                asm.bytes(self.credential_keys[0].to_vec())
                    .op(Op::Store(SLOT_CREDENTIAL_KEY));
            }
            Variant::MultiKey => {
                asm.arg(args::CREDENTIAL_PUBLIC_KEY)
                    .op(Op::Store(SLOT_CREDENTIAL_KEY))
                    .callsub("allow_list_contains")
                    .assert();
            }
        }

        // 3) clientDataJSON is an assertion for our origin whose challenge is the claim hash.
        asm.arg(args::CLIENT_DATA_JSON)
            .bytes(&b"type"[..])
            .op(Op::JsonString)
            .bytes(WEBAUTHN_GET)
            .op(Op::Eq)
            .assert();
        asm.arg(args::CLIENT_DATA_JSON)
            .bytes(&b"origin"[..])
            .op(Op::JsonString)
            .bytes(self.origin.as_bytes())
            .op(Op::Eq)
            .assert();
        asm.arg(args::EXPIRATION)
            .op(Op::Len)
            .int(8)
            .op(Op::Eq)
            .assert();
        asm.arg(args::CLIENT_DATA_JSON)
            .bytes(&b"challenge"[..])
            .op(Op::JsonString)
            .op(Op::Base64UrlDecode)
            .arg(args::SESSION_PUBLIC_KEY)
            .arg(args::EXPIRATION)
            .op(Op::Concat)
            .arg(args::SUBJECT)
            .op(Op::Concat)
            .arg(args::NONCE)
            .op(Op::Concat)
            .op(Op::Sha256)
            .op(Op::Eq)
            .assert();

        // 4) User present (bit 0) and user verified (bit 2) of the flags byte.
        asm.arg(args::AUTHENTICATOR_DATA)
            .int(32)
            .int(1)
            .op(Op::Extract3)
            .op(Op::Store(SLOT_FLAGS));
        asm.op(Op::Load(SLOT_FLAGS)).int(7).op(Op::GetBit).assert();
        asm.op(Op::Load(SLOT_FLAGS)).int(5).op(Op::GetBit).assert();

        // 5) ECDSA P-256 over SHA256(authenticatorData ‖ SHA256(clientDataJSON)).
        asm.arg(args::AUTHENTICATOR_DATA)
            .arg(args::CLIENT_DATA_JSON)
            .op(Op::Sha256)
            .op(Op::Concat)
            .op(Op::Sha256)
            .arg(args::SIGNATURE_R)
            .arg(args::SIGNATURE_S)
            .op(Op::Load(SLOT_CREDENTIAL_KEY))
            .op(Op::EcdsaPkDecompressP256)
            .op(Op::EcdsaVerifyP256)
            .assert();

        // 6) The whole validity window ends before the claim expires.
        asm.arg(args::EXPIRATION)
            .op(Op::Btoi)
            .txn(TxnField::FirstValid)
            .op(Op::Gt)
            .assert();
        asm.arg(args::EXPIRATION)
            .op(Op::Btoi)
            .txn(TxnField::LastValid)
            .op(Op::Gt)
            .assert();

        // 7) The session key approved this exact transaction.
        asm.txn(TxnField::TxId)
            .arg(args::SESSION_TXN_SIGNATURE)
            .arg(args::SESSION_PUBLIC_KEY)
            .op(Op::Ed25519VerifyBare)
            .assert();

        asm.int(1).op(Op::Return);

        if self.variant == Variant::MultiKey {
            self.emit_allow_list(&mut asm);
        }

        Ok(asm.finish()?)
    }

    /// Linear scan of the baked-in key list, 33 bytes per entry.
    fn emit_allow_list(&self, asm: &mut Assembler) {
        let keys: Vec<u8> = self.credential_keys.concat();
        let stride = CREDENTIAL_KEY_LEN as u64;

        asm.label("allow_list_contains")
            .int(0)
            .op(Op::Store(SLOT_SCAN_INDEX))
            .label("allow_list_next")
            .op(Op::Load(SLOT_SCAN_INDEX))
            .int(self.credential_keys.len() as u64)
            .op(Op::Lt)
            .bz("allow_list_absent")
            .bytes(keys)
            .op(Op::Load(SLOT_SCAN_INDEX))
            .int(stride)
            .op(Op::Mul)
            .int(stride)
            .op(Op::Extract3)
            .op(Op::Load(SLOT_CREDENTIAL_KEY))
            .op(Op::Eq)
            .bnz("allow_list_present")
            .op(Op::Load(SLOT_SCAN_INDEX))
            .int(1)
            .op(Op::Add)
            .op(Op::Store(SLOT_SCAN_INDEX))
            .b("allow_list_next")
            .label("allow_list_absent")
            .int(0)
            .op(Op::Retsub)
            .label("allow_list_present")
            .int(1)
            .op(Op::Retsub);
    }

    pub fn instantiate(&self) -> Result<ProgramInstance, TemplateError> {
        let bytecode = opcode::encode(&self.assemble()?)?;
        let address = Address::for_program(&bytecode);
        Ok(ProgramInstance {
            template: self.clone(),
            bytecode,
            address,
        })
    }
}

/// A concrete, address-bearing program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInstance {
    pub template: VerifierTemplate,
    pub bytecode: Vec<u8>,
    pub address: Address,
}

/// Derives (and where applicable deploys) the program for a set of keys and an origin.
/// Must be deterministic and idempotent.
#[async_trait]
pub trait ProgramInstancer: Send + Sync {
    async fn deploy_or_derive(
        &self,
        credential_keys: &[[u8; CREDENTIAL_KEY_LEN]],
        origin: &str,
    ) -> Result<ProgramInstance, TemplateError>;
}

/// Derives addresses locally; no deployment step is needed for a program account.
#[derive(Debug, Clone, Copy)]
pub struct TemplateInstancer {
    pub variant: Variant,
    pub allow_rotation: bool,
}

impl TemplateInstancer {
    pub fn template(
        &self,
        credential_keys: &[[u8; CREDENTIAL_KEY_LEN]],
        origin: &str,
    ) -> Result<VerifierTemplate, TemplateError> {
        let template = match self.variant {
            Variant::SingleKey => {
                let [key] = credential_keys else {
                    return Err(TemplateError::KeyCount(credential_keys.len()));
                };
                VerifierTemplate::single_key(*key, origin)?
            }
            Variant::MultiKey => VerifierTemplate::multi_key(credential_keys.to_vec(), origin)?,
        };
        if self.allow_rotation {
            template.with_rotation()
        } else {
            Ok(template)
        }
    }
}

#[async_trait]
impl ProgramInstancer for TemplateInstancer {
    async fn deploy_or_derive(
        &self,
        credential_keys: &[[u8; CREDENTIAL_KEY_LEN]],
        origin: &str,
    ) -> Result<ProgramInstance, TemplateError> {
        self.template(credential_keys, origin)?.instantiate()
    }
}
