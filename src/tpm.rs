//! [`Channel`] to a TPM 2.0, through the TSS enhanced system API.
//!
//! Every request maps onto one ESAPI command. The handles given to the
//! client are local numbers; the ESYS resources behind them are released
//! when the client flushes them, or when the channel is dropped.
//!
//! Registers are measured by the boot chain, so PCR_Event is refused here.

use core::convert::TryFrom;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::io;
use std::mem;

use log::{debug, trace, warn};
use tss_esapi::attributes::{
    NvIndexAttributesBuilder, ObjectAttributesBuilder, SessionAttributesBuilder,
};
use tss_esapi::constants::SessionType;
use tss_esapi::handles::{
    KeyHandle, NvIndexHandle, NvIndexTpmHandle, ObjectHandle as EsysHandle,
    SessionHandle as EsysSession, TpmHandle,
};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::resource_handles::{Hierarchy as TpmHierarchy, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Auth, Digest as TpmDigest, DigestList, KeyedHashScheme, MaxNvBuffer, NvPublicBuilder,
    PcrSelectionList, PcrSelectionListBuilder, PcrSlot, Private, Public, PublicBuilder,
    PublicKeyedHashParameters, SensitiveData, SymmetricCipherParameters, SymmetricDefinition,
    SymmetricDefinitionObject,
};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::{Context, TctiNameConf};
use zeroize::Zeroizing;

use crate::api::{
    Channel, Digest, Handle, ObjectHandle, Reply, Request, SessionHandle, SessionKind, Status,
};
use crate::nv::NvIndex;
use crate::policy::{HashAlgorithm, PcrSelection};
use crate::primary::{Hierarchy, PrimaryTemplate};
use crate::{Error, Result};

/// Used when neither the command line nor the environment names a TCTI.
pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";

const OBJECT_HANDLE_BASE: u32 = 0x8000_0000;
const SESSION_HANDLE_BASE: u32 = 0x0300_0000;

/// A TPM reports at most this many PCR values per read.
const PCR_READ_MAX: usize = 8;

enum Failure {
    Tss(tss_esapi::Error),
    Module(Status),
}

impl From<tss_esapi::Error> for Failure {
    fn from(err: tss_esapi::Error) -> Self {
        Failure::Tss(err)
    }
}

impl From<Status> for Failure {
    fn from(status: Status) -> Self {
        Failure::Module(status)
    }
}

fn communication(message: String) -> Error {
    Error::ModuleCommunication(io::Error::new(io::ErrorKind::Other, message))
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Module(status) => Error::from(status),
            Failure::Tss(tss_esapi::Error::TssError(rc)) => {
                let code = u32::from(rc);
                match Status::from_code(code) {
                    Some(status) => Error::from(status),
                    None => communication(format!("TPM response code {:#010x}", code)),
                }
            }
            Failure::Tss(other) => communication(other.to_string()),
        }
    }
}

struct TpmSession {
    session: AuthSession,
    kind: SessionKind,
    /// Set by PolicyPassword.
    password_required: bool,
}

pub struct Tpm {
    context: Context,
    objects: BTreeMap<u32, KeyHandle>,
    sessions: BTreeMap<u32, TpmSession>,
    next_handle: u32,
}

impl Tpm {
    /// Connects through `tcti`, else the TCTI named by the environment
    /// (`TPM2TOOLS_TCTI`, `TCTI` or `TEST_TCTI`), else [`DEFAULT_TCTI`].
    pub fn open(tcti: Option<&str>) -> Result<Self> {
        let conf = match tcti {
            Some(tcti) => TctiNameConf::from_str(tcti),
            None => TctiNameConf::from_environment_variable()
                .or_else(|_| TctiNameConf::from_str(DEFAULT_TCTI)),
        }
        .map_err(|err| Error::from(Failure::from(err)))?;
        let context = Context::new(conf).map_err(|err| Error::from(Failure::from(err)))?;
        debug!("connected to the TPM");

        Ok(Self {
            context,
            objects: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_handle: 0,
        })
    }

    fn allocate(&mut self, base: u32) -> u32 {
        self.next_handle = (self.next_handle + 1) & 0x00ff_ffff;
        base | self.next_handle
    }

    fn track_object(&mut self, key: KeyHandle) -> ObjectHandle {
        let handle = self.allocate(OBJECT_HANDLE_BASE);
        self.objects.insert(handle, key);
        ObjectHandle(handle)
    }

    fn object(&self, handle: ObjectHandle) -> Result<KeyHandle, Failure> {
        Ok(*self.objects.get(&handle.0).ok_or(Status::Handle)?)
    }

    fn policy_session(&self, handle: SessionHandle) -> Result<PolicySession, Failure> {
        let session = self.sessions.get(&handle.0).ok_or(Status::Handle)?;
        Ok(PolicySession::try_from(session.session)?)
    }

    fn flush(&mut self, handle: EsysHandle) {
        if let Err(err) = self.context.flush_context(handle) {
            warn!("could not flush TPM context: {}", err);
        }
    }

    fn close(&mut self, mut handle: EsysHandle) {
        if let Err(err) = self.context.tr_close(&mut handle) {
            debug!("could not close ESYS resource: {}", err);
        }
    }

    fn nv_handle(&mut self, index: NvIndex) -> Result<NvIndexHandle, Failure> {
        let tpm_handle = NvIndexTpmHandle::new(index.value())?;
        let object = self
            .context
            .tr_from_tpm_public(TpmHandle::NvIndex(tpm_handle))?;
        Ok(NvIndexHandle::from(object))
    }

    fn execute(&mut self, request: Request) -> Result<Reply, Failure> {
        match request {
            Request::GetRandom { count } => {
                let random = self.context.get_random(count)?;
                Ok(Reply::Random(Zeroizing::new(random.value().to_vec())))
            }

            Request::CreatePrimary { template } => {
                let public = primary_public(&template)?;
                let hierarchy = match template.hierarchy {
                    Hierarchy::Owner => TpmHierarchy::Owner,
                    Hierarchy::Null => TpmHierarchy::Null,
                };
                let primary = self.context.execute_with_nullauth_session(|ctx| {
                    ctx.create_primary(hierarchy, public, None, None, None, None)
                })?;
                Ok(Reply::CreatePrimary(self.track_object(primary.key_handle)))
            }

            Request::Create {
                parent,
                data,
                auth_value,
                auth_policy,
            } => {
                let parent = self.object(parent)?;
                let public = sealed_data_public(auth_policy)?;
                let auth = if auth_value.is_empty() {
                    None
                } else {
                    Some(Auth::try_from(auth_value.to_vec())?)
                };
                let sensitive = SensitiveData::try_from(data.to_vec())?;
                let created = self.context.execute_with_nullauth_session(|ctx| {
                    ctx.create(parent, public, auth, Some(sensitive), None, None)
                })?;
                Ok(Reply::Create {
                    public: created.out_public.marshall()?,
                    private: created.out_private.value().to_vec(),
                })
            }

            Request::Load {
                parent,
                public,
                private,
            } => {
                let parent = self.object(parent)?;
                let public = Public::unmarshall(&public)?;
                let private = Private::try_from(private)?;
                let key = self
                    .context
                    .execute_with_nullauth_session(|ctx| ctx.load(parent, private, public))?;
                Ok(Reply::Load(self.track_object(key)))
            }

            Request::Unseal {
                object,
                session,
                auth_value,
            } => {
                // consumed whatever happens next
                let session = self.sessions.remove(&session.0).ok_or(Status::Handle)?;
                let unsealed = self.unseal(object, &session, &auth_value);
                self.flush(EsysHandle::from(EsysSession::from(session.session)));
                unsealed
            }

            Request::FlushContext { handle } => {
                let esys = match handle {
                    Handle::Object(object) => {
                        let key = self.objects.remove(&object.0).ok_or(Status::Handle)?;
                        EsysHandle::from(key)
                    }
                    Handle::Session(session) => {
                        let session = self.sessions.remove(&session.0).ok_or(Status::Handle)?;
                        EsysHandle::from(EsysSession::from(session.session))
                    }
                };
                self.context.flush_context(esys)?;
                Ok(Reply::FlushContext)
            }

            Request::StartAuthSession { kind } => {
                let session_type = match kind {
                    SessionKind::Policy => SessionType::Policy,
                    SessionKind::Trial => SessionType::Trial,
                };
                let session = self
                    .context
                    .start_auth_session(
                        None,
                        None,
                        None,
                        session_type,
                        SymmetricDefinition::AES_128_CFB,
                        HashingAlgorithm::Sha256,
                    )?
                    .ok_or(Status::Failure)?;
                let (attributes, mask) = SessionAttributesBuilder::new()
                    .with_continue_session(true)
                    .with_encrypt(true)
                    .build();
                self.context
                    .tr_sess_set_attributes(session, attributes, mask)?;

                let handle = self.allocate(SESSION_HANDLE_BASE);
                self.sessions.insert(
                    handle,
                    TpmSession {
                        session,
                        kind,
                        password_required: false,
                    },
                );
                Ok(Reply::StartAuthSession(SessionHandle(handle)))
            }

            Request::PolicyPcr { session, selection } => {
                if selection.is_empty() {
                    return Err(Status::Value.into());
                }
                let policy = self.policy_session(session)?;
                let indices: Vec<u8> = selection.indices().collect();
                let list = pcr_selection_list(selection.bank(), &indices)?;
                // an empty digest makes the TPM use the current values
                self.context
                    .policy_pcr(policy, TpmDigest::default(), list)?;
                Ok(Reply::PolicyUpdated)
            }

            Request::PolicyPassword { session } => {
                let policy = self.policy_session(session)?;
                self.context.policy_password(policy)?;
                if let Some(session) = self.sessions.get_mut(&session.0) {
                    session.password_required = true;
                }
                Ok(Reply::PolicyUpdated)
            }

            Request::PolicyOr { session, digests } => {
                let policy = self.policy_session(session)?;
                let mut list = DigestList::new();
                for digest in digests {
                    list.add(TpmDigest::try_from(digest)?)?;
                }
                self.context.policy_or(policy, list)?;
                Ok(Reply::PolicyUpdated)
            }

            Request::PolicyGetDigest { session } => {
                let policy = self.policy_session(session)?;
                let digest = self.context.policy_get_digest(policy)?;
                Ok(Reply::PolicyGetDigest(digest.value().to_vec()))
            }

            Request::PcrRead { selection } => Ok(Reply::PcrRead(self.pcr_read(&selection)?)),

            Request::PcrEvent { .. } => Err(Status::CommandCode.into()),

            Request::NvDefineSpace { index, size } => {
                let attributes = NvIndexAttributesBuilder::new()
                    .with_owner_write(true)
                    .with_owner_read(true)
                    .build()?;
                let public = NvPublicBuilder::new()
                    .with_nv_index(NvIndexTpmHandle::new(index.value())?)
                    .with_index_name_algorithm(HashingAlgorithm::Sha256)
                    .with_index_attributes(attributes)
                    .with_data_area_size(size)
                    .build()?;
                let handle = self.context.execute_with_nullauth_session(|ctx| {
                    ctx.nv_define_space(Provision::Owner, None, public)
                })?;
                self.close(handle.into());
                Ok(Reply::NvDefineSpace)
            }

            Request::NvReadPublic { index } => {
                let handle = self.nv_handle(index)?;
                let public = self.context.nv_read_public(handle);
                self.close(handle.into());
                let (public, _) = public?;
                Ok(Reply::NvReadPublic {
                    size: public.data_size(),
                })
            }

            Request::NvWrite {
                index,
                offset,
                data,
            } => {
                let offset = u16::try_from(offset).map_err(|_| Status::NvRange)?;
                let data = MaxNvBuffer::try_from(data)?;
                let handle = self.nv_handle(index)?;
                let written = self.context.execute_with_nullauth_session(|ctx| {
                    ctx.nv_write(NvAuth::Owner, handle, data, offset)
                });
                self.close(handle.into());
                written?;
                Ok(Reply::NvWrite)
            }

            Request::NvRead {
                index,
                offset,
                size,
            } => {
                let offset = u16::try_from(offset).map_err(|_| Status::NvRange)?;
                let size = u16::try_from(size).map_err(|_| Status::Size)?;
                let handle = self.nv_handle(index)?;
                let read = self.context.execute_with_nullauth_session(|ctx| {
                    ctx.nv_read(NvAuth::Owner, handle, size, offset)
                });
                self.close(handle.into());
                Ok(Reply::NvRead(read?.value().to_vec()))
            }

            Request::NvUndefineSpace { index } => {
                let handle = self.nv_handle(index)?;
                let undefined = self.context.execute_with_nullauth_session(|ctx| {
                    ctx.nv_undefine_space(Provision::Owner, handle)
                });
                if undefined.is_err() {
                    self.close(handle.into());
                }
                undefined?;
                Ok(Reply::NvUndefineSpace)
            }
        }
    }

    fn unseal(
        &mut self,
        object: ObjectHandle,
        session: &TpmSession,
        auth_value: &[u8],
    ) -> Result<Reply, Failure> {
        if session.kind == SessionKind::Trial {
            return Err(Status::AuthType.into());
        }
        let object = self.object(object)?;
        if session.password_required {
            self.context
                .tr_set_auth(object.into(), Auth::try_from(auth_value.to_vec())?)?;
        }
        let data = self
            .context
            .execute_with_session(Some(session.session), |ctx| ctx.unseal(object.into()))?;
        Ok(Reply::Unseal(Zeroizing::new(data.value().to_vec())))
    }

    fn pcr_read(&mut self, selection: &PcrSelection) -> Result<Vec<Digest>, Failure> {
        let indices: Vec<u8> = selection.indices().collect();
        let mut values = Vec::with_capacity(indices.len());
        for chunk in indices.chunks(PCR_READ_MAX) {
            let list = pcr_selection_list(selection.bank(), chunk)?;
            let (_, _, digests) = self.context.pcr_read(list)?;
            if digests.value().len() != chunk.len() {
                return Err(Status::Size.into());
            }
            values.extend(digests.value().iter().map(|digest| digest.value().to_vec()));
        }
        Ok(values)
    }
}

impl Channel for Tpm {
    fn transact(&mut self, request: Request) -> Result<Reply> {
        let name = request.name();
        trace!("{}", name);
        self.execute(request).map_err(|failure| {
            let err = Error::from(failure);
            debug!("{} failed: {}", name, err);
            err
        })
    }
}

impl Drop for Tpm {
    fn drop(&mut self) {
        for (_, key) in mem::take(&mut self.objects) {
            self.flush(key.into());
        }
        for (_, session) in mem::take(&mut self.sessions) {
            self.flush(EsysHandle::from(EsysSession::from(session.session)));
        }
    }
}

fn hashing_algorithm(bank: HashAlgorithm) -> HashingAlgorithm {
    match bank {
        HashAlgorithm::Sha1 => HashingAlgorithm::Sha1,
        HashAlgorithm::Sha256 => HashingAlgorithm::Sha256,
    }
}

fn pcr_selection_list(bank: HashAlgorithm, indices: &[u8]) -> tss_esapi::Result<PcrSelectionList> {
    let slots = indices
        .iter()
        .map(|index| PcrSlot::try_from(1u32 << index))
        .collect::<tss_esapi::Result<Vec<_>>>()?;
    PcrSelectionListBuilder::new()
        .with_selection(hashing_algorithm(bank), &slots)
        .build()
}

/// The TPM's storage key for a template version: a restricted AES-128-CFB
/// decryption key, derived afresh from the hierarchy seed on every use.
fn primary_public(template: &PrimaryTemplate) -> Result<Public, Failure> {
    if template.version != 1 {
        return Err(Status::Value.into());
    }
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_st_clear(false)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_decrypt(true)
        .with_restricted(true)
        .build()?;

    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::SymCipher)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_symmetric_cipher_parameters(SymmetricCipherParameters::new(
            SymmetricDefinitionObject::AES_128_CFB,
        ))
        .with_symmetric_cipher_unique_identifier(TpmDigest::default())
        .build()?)
}

/// A sealed-data object usable only through its policy. Its auth value is
/// subject to the TPM's dictionary attack protection.
fn sealed_data_public(auth_policy: Digest) -> Result<Public, Failure> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(false)
        .build()?;

    Ok(PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes)
        .with_auth_policy(TpmDigest::try_from(auth_policy)?)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
        .with_keyed_hash_unique_identifier(TpmDigest::default())
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_become_pcr_slots() {
        let list = pcr_selection_list(HashAlgorithm::Sha256, &[0, 2, 23]).unwrap();
        assert_eq!(list.get_selections().len(), 1);
        assert!(pcr_selection_list(HashAlgorithm::Sha1, &[24]).is_err());
    }

    #[test]
    fn unknown_template_version_is_refused() {
        let mut template = PrimaryTemplate::for_version(1).unwrap();
        assert!(primary_public(&template).is_ok());
        template.version = 2;
        assert!(matches!(
            primary_public(&template).map_err(Error::from),
            Err(Error::Module(Status::Value))
        ));
    }

    #[test]
    fn status_failures_keep_their_meaning() {
        assert!(matches!(
            Error::from(Failure::Module(Status::AuthFail)),
            Error::PolicyNotSatisfied
        ));
        assert!(matches!(
            Error::from(Failure::Module(Status::CommandCode)),
            Error::Module(Status::CommandCode)
        ));
    }
}
