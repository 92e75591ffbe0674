//! Typed client for the root-of-trust module.
//!
//! The client owns the channel and mints every [`Session`]. Calls are
//! forwarded one at a time and never retried; a failing call surfaces as an
//! [`Error`] right away.

use std::io;

use log::debug;
use zeroize::Zeroizing;

use crate::api::{
    Channel, Digest, Handle, ObjectHandle, Reply, Request, SessionHandle, SessionKind, Status,
    MAX_NV_BUFFER,
};
use crate::nv::NvIndex;
use crate::policy::{HashAlgorithm, PcrSelection};
use crate::primary::PrimaryTemplate;
use crate::{Error, Result};

/// Sends `$request` and destructures the expected reply, anything else is a
/// protocol violation.
macro_rules! transact {
    ($client:expr, $request:expr, $reply:pat => $value:expr) => {{
        let request = $request;
        let name = request.name();
        match $client.channel.transact(request) {
            Ok($reply) => Ok($value),
            Ok(other) => Err(unexpected(name, &other)),
            Err(err) => Err(err),
        }
    }};
}

fn unexpected(command: &str, reply: &Reply) -> Error {
    Error::ModuleCommunication(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected {} reply to {}", reply.name(), command),
    ))
}

/// An authorization session. Not `Clone`: it is either consumed by one
/// unseal or handed back to [`Client::flush_session`].
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    kind: SessionKind,
}

impl Session {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}

/// Public part of an NV slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NvPublic {
    pub index: NvIndex,
    pub size: usize,
}

pub struct Client<C: Channel> {
    channel: C,
}

impl<C: Channel> Client<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    pub fn get_random(&mut self, count: usize) -> Result<Zeroizing<Vec<u8>>> {
        transact!(self, Request::GetRandom { count }, Reply::Random(bytes) => bytes)
    }

    pub fn create_primary(&mut self, template: &PrimaryTemplate) -> Result<ObjectHandle> {
        let handle = transact!(
            self,
            Request::CreatePrimary { template: *template },
            Reply::CreatePrimary(handle) => handle
        )?;
        debug!("primary object {:#010x}", handle.0);
        Ok(handle)
    }

    /// Seals `data` under `parent`; returns the public and private areas.
    /// `auth_value` is the password a PolicyPassword branch will ask for.
    pub fn seal(
        &mut self,
        parent: ObjectHandle,
        data: &[u8],
        auth_value: &[u8],
        auth_policy: &Digest,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        transact!(
            self,
            Request::Create {
                parent,
                data: Zeroizing::new(data.to_vec()),
                auth_value: Zeroizing::new(auth_value.to_vec()),
                auth_policy: auth_policy.clone(),
            },
            Reply::Create { public, private } => (public, private)
        )
    }

    pub fn load(
        &mut self,
        parent: ObjectHandle,
        public: &[u8],
        private: &[u8],
    ) -> Result<ObjectHandle> {
        let handle = transact!(
            self,
            Request::Load {
                parent,
                public: public.to_vec(),
                private: private.to_vec(),
            },
            Reply::Load(handle) => handle
        )?;
        debug!("loaded object {:#010x}", handle.0);
        Ok(handle)
    }

    /// Consumes `session`, whether or not the unseal succeeds.
    pub fn unseal(
        &mut self,
        object: ObjectHandle,
        session: Session,
        auth_value: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        transact!(
            self,
            Request::Unseal {
                object,
                session: session.handle,
                auth_value: Zeroizing::new(auth_value.to_vec()),
            },
            Reply::Unseal(data) => data
        )
    }

    pub fn start_session(&mut self, kind: SessionKind) -> Result<Session> {
        let handle = transact!(
            self,
            Request::StartAuthSession { kind },
            Reply::StartAuthSession(handle) => handle
        )?;
        debug!("{:?} session {:#010x}", kind, handle.0);
        Ok(Session { handle, kind })
    }

    pub fn policy_pcr(&mut self, session: &Session, selection: PcrSelection) -> Result<()> {
        transact!(
            self,
            Request::PolicyPcr { session: session.handle, selection },
            Reply::PolicyUpdated => ()
        )
    }

    pub fn policy_password(&mut self, session: &Session) -> Result<()> {
        transact!(
            self,
            Request::PolicyPassword { session: session.handle },
            Reply::PolicyUpdated => ()
        )
    }

    pub fn policy_or(&mut self, session: &Session, digests: &[Digest]) -> Result<()> {
        transact!(
            self,
            Request::PolicyOr { session: session.handle, digests: digests.to_vec() },
            Reply::PolicyUpdated => ()
        )
    }

    pub fn policy_digest(&mut self, session: &Session) -> Result<Digest> {
        transact!(
            self,
            Request::PolicyGetDigest { session: session.handle },
            Reply::PolicyGetDigest(digest) => digest
        )
    }

    pub fn pcr_read(&mut self, selection: PcrSelection) -> Result<Vec<Digest>> {
        transact!(self, Request::PcrRead { selection }, Reply::PcrRead(values) => values)
    }

    /// Measures `data` into one register, the way a boot stage would.
    pub fn pcr_event(&mut self, bank: HashAlgorithm, index: u8, data: &[u8]) -> Result<()> {
        transact!(
            self,
            Request::PcrEvent { bank, index, data: data.to_vec() },
            Reply::PcrEvent => ()
        )
    }

    pub fn flush_object(&mut self, object: ObjectHandle) -> Result<()> {
        transact!(
            self,
            Request::FlushContext { handle: Handle::Object(object) },
            Reply::FlushContext => ()
        )
    }

    pub fn flush_session(&mut self, session: Session) -> Result<()> {
        transact!(
            self,
            Request::FlushContext { handle: Handle::Session(session.handle) },
            Reply::FlushContext => ()
        )
    }

    /// Runs `f` with a fresh trial session, flushed afterwards on every path.
    pub fn with_trial_session<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self, &Session) -> Result<T>,
    {
        let session = self.start_session(SessionKind::Trial)?;
        let result = f(self, &session);
        let flushed = self.flush_session(session);
        let value = result?;
        flushed?;
        Ok(value)
    }

    pub fn nv_define(&mut self, index: NvIndex, size: usize) -> Result<()> {
        transact!(
            self,
            Request::NvDefineSpace { index, size },
            Reply::NvDefineSpace => ()
        )
        .map_err(|err| nv_error(err, index))
    }

    pub fn nv_read_public(&mut self, index: NvIndex) -> Result<NvPublic> {
        transact!(
            self,
            Request::NvReadPublic { index },
            Reply::NvReadPublic { size } => NvPublic { index, size }
        )
        .map_err(|err| nv_error(err, index))
    }

    /// Writes `data` from offset zero, in chunks the module accepts.
    pub fn nv_write(&mut self, index: NvIndex, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(MAX_NV_BUFFER).enumerate() {
            transact!(
                self,
                Request::NvWrite {
                    index,
                    offset: i * MAX_NV_BUFFER,
                    data: chunk.to_vec(),
                },
                Reply::NvWrite => ()
            )
            .map_err(|err| nv_error(err, index))?;
        }
        Ok(())
    }

    /// Reads the whole slot, in chunks the module accepts.
    pub fn nv_read(&mut self, index: NvIndex) -> Result<Vec<u8>> {
        let NvPublic { size, .. } = self.nv_read_public(index)?;
        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let chunk = MAX_NV_BUFFER.min(size - data.len());
            let bytes = transact!(
                self,
                Request::NvRead { index, offset: data.len(), size: chunk },
                Reply::NvRead(bytes) => bytes
            )
            .map_err(|err| nv_error(err, index))?;
            if bytes.len() != chunk {
                return Err(Error::ModuleCommunication(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "short NV read",
                )));
            }
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    pub fn nv_undefine(&mut self, index: NvIndex) -> Result<()> {
        transact!(
            self,
            Request::NvUndefineSpace { index },
            Reply::NvUndefineSpace => ()
        )
        .map_err(|err| nv_error(err, index))
    }
}

/// NV statuses carry meaning the generic mapping cannot know about.
fn nv_error(err: Error, index: NvIndex) -> Error {
    match err {
        Error::Module(Status::Handle) => Error::NvNotFound(index),
        Error::Module(Status::NvDefined) => Error::NvAlreadyExists(index),
        other => other,
    }
}
