//! # TOTP sealed to a TPM-style root of trust, for PC.
//!
//! The TOTP secret is generated inside the root-of-trust module, sealed to
//! the current values of a set of platform configuration registers (and
//! optionally a recovery password), and kept as an opaque blob in the
//! module's non-volatile storage. A code can only be computed while the
//! platform is in the measured state it was sealed to, so comparing it with
//! the code of an authenticator app attests that the machine booted as
//! expected.
//!
//! The crate is layered like this:
//! - [`api`]: the request/response protocol of the module and its [`api::Channel`]
//! - [`client`]: a typed client over a channel, owning every session it mints
//! - [`primary`], [`policy`], [`blob`], [`nv`]: primary keys, authorization
//!   policies, the blob codec and the NV slot
//! - [`authenticator`]: the lifecycle of one sealed secret
//! - [`totp`]: RFC 6238 codes
//!
//! With the `tpm` feature, [`tpm`] carries the protocol to a TPM 2.0 through
//! the TSS enhanced system API. [`platform`] is a software module speaking
//! the same protocol in-process. It keeps its state in a file and stands in
//! for the hardware in tests and development, the way a secure element's
//! service can run on a PC.
//!
//! Outside of the core are [`cli`], [`config`] and [`enrollment`], which
//! only consume the plain bytes and codes the core hands out.

pub use error::{Error, Result};

pub mod api;
pub mod authenticator;
pub mod blob;
pub mod cli;
pub mod client;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod nv;
pub mod platform;
pub mod policy;
pub mod primary;
pub mod secret;
pub mod totp;
#[cfg(feature = "tpm")]
pub mod tpm;
