//! Commands and responses exchanged with the root-of-trust module.
//!
//! The module is driven strictly request/response: the client hands a
//! [`Request`] to its [`Channel`] and blocks until the matching [`Reply`]
//! (or a failure) comes back. Payloads that may carry secret material are
//! wrapped in [`Zeroizing`], so they are wiped wherever they get dropped.

use zeroize::Zeroizing;

use crate::nv::NvIndex;
use crate::policy::{HashAlgorithm, PcrSelection};
use crate::primary::PrimaryTemplate;
use crate::Result;

/// Policy digests are always SHA-256 sized.
pub type Digest = Vec<u8>;

/// Largest chunk an NV read or write may move in a single command.
pub const MAX_NV_BUFFER: usize = 1024;

/// Transient handle of a key or sealed-data object loaded into the module.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectHandle(pub u32);

/// Handle of an authorization session.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SessionHandle(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// A trial session only accumulates a digest, a policy session authorizes.
pub enum SessionKind {
    Policy,
    Trial,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum Handle {
    Object(ObjectHandle),
    Session(SessionHandle),
}

/// Response codes reported by the module, modelled on the TPM 2.0 ones.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Status {
    #[error("module failure")]
    Failure,
    #[error("value is out of range or not correct for the context")]
    Value,
    #[error("handle is not correct for the use")]
    Handle,
    #[error("structure is the wrong size")]
    Size,
    #[error("policy failure in math operation or an invalid authPolicy value")]
    PolicyFail,
    #[error("integrity check failed")]
    Integrity,
    #[error("NV index or persistent object already defined")]
    NvDefined,
    #[error("NV offset + size is out of range")]
    NvRange,
    #[error("out of memory for object contexts")]
    ObjectMemory,
    #[error("out of memory for session contexts")]
    SessionMemory,
    #[error("authorization type not supported for the command")]
    AuthType,
    #[error("the authorization HMAC check failed")]
    AuthFail,
    #[error("authorizations for objects subject to dictionary attack protection are locked out")]
    Lockout,
    #[error("command code not supported")]
    CommandCode,
}

impl Status {
    /// The numeric response code, as a TPM would put it on the wire.
    pub fn code(&self) -> u32 {
        match self {
            Status::Failure => 0x101,
            Status::Value => 0x084,
            Status::Handle => 0x08b,
            Status::Size => 0x095,
            Status::PolicyFail => 0x09d,
            Status::Integrity => 0x09f,
            Status::NvDefined => 0x14c,
            Status::NvRange => 0x146,
            Status::ObjectMemory => 0x902,
            Status::SessionMemory => 0x903,
            Status::AuthType => 0x124,
            Status::AuthFail => 0x08e,
            Status::Lockout => 0x921,
            Status::CommandCode => 0x143,
        }
    }

    /// Recognizes a TPM-layer response code, ignoring the handle, session or
    /// parameter number it may carry.
    pub fn from_code(rc: u32) -> Option<Self> {
        if rc >> 16 != 0 {
            return None;
        }
        let code = if rc & 0x080 != 0 { rc & 0x0bf } else { rc & 0x97f };
        let status = match code {
            0x101 => Status::Failure,
            0x084 => Status::Value,
            0x08b => Status::Handle,
            0x095 => Status::Size,
            0x09d => Status::PolicyFail,
            0x09f => Status::Integrity,
            0x14c => Status::NvDefined,
            0x146 => Status::NvRange,
            0x902 => Status::ObjectMemory,
            0x903 => Status::SessionMemory,
            0x124 => Status::AuthType,
            // BAD_AUTH is what objects without lockout protection report
            0x08e | 0x0a2 => Status::AuthFail,
            0x921 => Status::Lockout,
            0x143 => Status::CommandCode,
            _ => return None,
        };
        Some(status)
    }
}

#[allow(missing_docs)]
pub enum Request {
    GetRandom { count: usize },
    CreatePrimary { template: PrimaryTemplate },
    /// Seal `data` as a child of `parent`, only unsealable under `auth_policy`.
    /// `auth_value` is what a PolicyPassword session has to present.
    Create {
        parent: ObjectHandle,
        data: Zeroizing<Vec<u8>>,
        auth_value: Zeroizing<Vec<u8>>,
        auth_policy: Digest,
    },
    Load { parent: ObjectHandle, public: Vec<u8>, private: Vec<u8> },
    /// Consumes `session`, whatever the outcome. `auth_value` is only checked
    /// if the session went through PolicyPassword.
    Unseal { object: ObjectHandle, session: SessionHandle, auth_value: Zeroizing<Vec<u8>> },
    FlushContext { handle: Handle },
    StartAuthSession { kind: SessionKind },
    PolicyPcr { session: SessionHandle, selection: PcrSelection },
    /// Defers the password check to the command the session authorizes.
    PolicyPassword { session: SessionHandle },
    PolicyOr { session: SessionHandle, digests: Vec<Digest> },
    PolicyGetDigest { session: SessionHandle },
    PcrRead { selection: PcrSelection },
    PcrEvent { bank: HashAlgorithm, index: u8, data: Vec<u8> },
    NvDefineSpace { index: NvIndex, size: usize },
    NvReadPublic { index: NvIndex },
    NvWrite { index: NvIndex, offset: usize, data: Vec<u8> },
    NvRead { index: NvIndex, offset: usize, size: usize },
    NvUndefineSpace { index: NvIndex },
}

impl Request {
    /// Command name, for logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Request::GetRandom { .. } => "GetRandom",
            Request::CreatePrimary { .. } => "CreatePrimary",
            Request::Create { .. } => "Create",
            Request::Load { .. } => "Load",
            Request::Unseal { .. } => "Unseal",
            Request::FlushContext { .. } => "FlushContext",
            Request::StartAuthSession { .. } => "StartAuthSession",
            Request::PolicyPcr { .. } => "PolicyPCR",
            Request::PolicyPassword { .. } => "PolicyPassword",
            Request::PolicyOr { .. } => "PolicyOR",
            Request::PolicyGetDigest { .. } => "PolicyGetDigest",
            Request::PcrRead { .. } => "PCR_Read",
            Request::PcrEvent { .. } => "PCR_Event",
            Request::NvDefineSpace { .. } => "NV_DefineSpace",
            Request::NvReadPublic { .. } => "NV_ReadPublic",
            Request::NvWrite { .. } => "NV_Write",
            Request::NvRead { .. } => "NV_Read",
            Request::NvUndefineSpace { .. } => "NV_UndefineSpace",
        }
    }
}

#[allow(missing_docs)]
pub enum Reply {
    Random(Zeroizing<Vec<u8>>),
    CreatePrimary(ObjectHandle),
    Create { public: Vec<u8>, private: Vec<u8> },
    Load(ObjectHandle),
    Unseal(Zeroizing<Vec<u8>>),
    FlushContext,
    StartAuthSession(SessionHandle),
    PolicyUpdated,
    PolicyGetDigest(Digest),
    PcrRead(Vec<Digest>),
    PcrEvent,
    NvDefineSpace,
    NvReadPublic { size: usize },
    NvWrite,
    NvRead(Vec<u8>),
    NvUndefineSpace,
}

impl Reply {
    /// Response name, for protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Random(_) => "Random",
            Reply::CreatePrimary(_) => "CreatePrimary",
            Reply::Create { .. } => "Create",
            Reply::Load(_) => "Load",
            Reply::Unseal(_) => "Unseal",
            Reply::FlushContext => "FlushContext",
            Reply::StartAuthSession(_) => "StartAuthSession",
            Reply::PolicyUpdated => "PolicyUpdated",
            Reply::PolicyGetDigest(_) => "PolicyGetDigest",
            Reply::PcrRead(_) => "PCR_Read",
            Reply::PcrEvent => "PCR_Event",
            Reply::NvDefineSpace => "NV_DefineSpace",
            Reply::NvReadPublic { .. } => "NV_ReadPublic",
            Reply::NvWrite => "NV_Write",
            Reply::NvRead(_) => "NV_Read",
            Reply::NvUndefineSpace => "NV_UndefineSpace",
        }
    }
}

/// The single communication channel to a module.
///
/// Module-reported failures come back as [`Error::Module`](crate::Error::Module),
/// transport failures as [`Error::ModuleCommunication`](crate::Error::ModuleCommunication).
pub trait Channel {
    /// Sends one command and waits for its response.
    fn transact(&mut self, request: Request) -> Result<Reply>;
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn transact(&mut self, request: Request) -> Result<Reply> {
        (**self).transact(request)
    }
}
