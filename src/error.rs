//! Error taxonomy shared by every layer of the crate.

use crate::api::Status;
use crate::nv::NvIndex;

/// Everything that can go wrong between the module and a TOTP code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel to the module failed, or the module answered out of protocol.
    #[error("communication with the module failed: {0}")]
    ModuleCommunication(#[source] std::io::Error),

    /// Platform state or password did not reproduce the sealed policy.
    #[error("authorization policy not satisfied")]
    PolicyNotSatisfied,

    #[error("malformed key blob: {0}")]
    BlobDecode(#[from] DecodeError),

    #[error("cannot encode key blob: {0}")]
    BlobEncode(#[from] EncodeError),

    #[error("no key blob stored at NV index {0}")]
    NvNotFound(NvIndex),

    #[error("NV index {0} is already defined, clean it first")]
    NvAlreadyExists(NvIndex),

    #[error("key blob of {size} bytes exceeds the NV capacity of {max} bytes")]
    NvCapacity { size: usize, max: usize },

    #[error("{0:#010x} is not an owner NV index")]
    InvalidNvIndex(u32),

    #[error("{0:?} is not an NV index, expected hex with 0x or decimal")]
    UnparsableNvIndex(String),

    /// Rejected before any module call.
    #[error("ill-formed policy: {0}")]
    IllFormedPolicy(&'static str),

    #[error("a password is required for this operation")]
    MissingPassword,

    /// Any other status the module reported.
    #[error("module returned: {0}")]
    Module(Status),

    #[error("system clock is before the UNIX epoch")]
    Clock(#[from] std::time::SystemTimeError),
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status {
            Status::PolicyFail | Status::AuthFail => Error::PolicyNotSatisfied,
            other => Error::Module(other),
        }
    }
}

/// Why a key blob could not be decoded.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated: needed {needed} more bytes, {available} left")]
    Truncated { needed: usize, available: usize },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u16),
    #[error("unsupported key template version {0}")]
    UnsupportedTemplate(u16),
    #[error("unknown policy tag {0:#04x}")]
    UnknownPolicyTag(u8),
    #[error("unknown hash algorithm {0:#06x}")]
    UnknownHashAlgorithm(u16),
    #[error("invalid PCR selection mask {0:#010x}")]
    InvalidPcrMask(u32),
    #[error("blob carries no policy branch")]
    NoPolicyBranch,
}

/// Why a key blob could not be encoded.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("key has no policy branch")]
    NoPolicyBranch,
    #[error("field of {0} bytes does not fit a length prefix")]
    Oversized(usize),
}

/// Crate-wide result.
pub type Result<T, E = Error> = core::result::Result<T, E>;
