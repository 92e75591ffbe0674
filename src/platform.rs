//! In-process software root-of-trust module, for PC.
//!
//! Behaves like the subset of a TPM 2.0 this crate drives: an owner
//! hierarchy whose seed persists in a [`store::Store`], two PCR banks,
//! owner NV indices, and a small number of transient object and session
//! slots. Policy digests are extended exactly the way a TPM extends them,
//! so a digest built in a trial session is reproduced by a policy session
//! only under the same register values. A password is the sealed object's
//! auth value: PolicyPassword only records that the unseal must present it.
//!
//! Everything, owner seed included, sits in the state image in the clear.
//! Whoever reads the image can open every sealed object, so this module is
//! for tests and development, never a substitute for a TPM.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::path::Path;

use chacha20::ChaCha8Rng;
use log::{debug, trace, warn};
use rand_core::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::api::{
    Channel, Digest, Handle, ObjectHandle, Reply, Request, SessionHandle, SessionKind, Status,
    MAX_NV_BUFFER,
};
use crate::nv::{NvIndex, NV_CAPACITY};
use crate::policy::{HashAlgorithm, PcrSelection, MAX_BRANCHES, MAX_PASSWORD_LEN, PCR_COUNT};
use crate::primary::{Hierarchy, PrimaryTemplate};
use crate::{Error, Result};

mod crypto;
pub mod store;

use store::{FileStore, PersistentState, Store};

/// Transient object slots.
pub const MAX_OBJECTS: usize = 3;
/// Authorization session slots.
pub const MAX_SESSIONS: usize = 3;
/// Largest secret a sealed-data object may hold.
pub const MAX_SEALED_DATA: usize = 128;

const OBJECT_HANDLE_BASE: u32 = 0x8000_0000;
const SESSION_HANDLE_BASE: u32 = 0x0300_0000;

// command codes, as hashed into policy digests
const CC_POLICY_AUTH_VALUE: u32 = 0x0000_016b;
const CC_POLICY_OR: u32 = 0x0000_0171;
const CC_POLICY_PCR: u32 = 0x0000_017f;

const POLICY_DIGEST_LEN: usize = 32;

/// Opens the module state at `state_path`, creating it on first use.
pub fn init_platform(state_path: impl AsRef<Path>) -> Result<Platform<FileStore>> {
    let rng = ChaCha8Rng::from_rng(rand_core::OsRng).map_err(|err| {
        Error::ModuleCommunication(io::Error::new(io::ErrorKind::Other, err.to_string()))
    })?;
    let store = FileStore::new(state_path.as_ref());
    Platform::new(store, rng)
}

enum Object {
    Primary {
        key: Zeroizing<[u8; 32]>,
        template_version: u16,
    },
    SealedData {
        auth_policy: Digest,
        auth_value: Zeroizing<Vec<u8>>,
        data: Zeroizing<Vec<u8>>,
    },
}

struct SessionState {
    kind: SessionKind,
    digest: Digest,
    /// Set by PolicyPassword.
    password_required: bool,
}

/// Public area of a sealed-data object. Safe to disclose.
#[derive(Deserialize, Serialize)]
struct PublicArea {
    name_algorithm: HashAlgorithm,
    auth_policy: Digest,
    template_version: u16,
    /// Binds the public area to the sensitive data.
    unique: Vec<u8>,
}

#[derive(Deserialize, Serialize)]
struct Sensitive {
    obfuscation: Vec<u8>,
    auth_value: Vec<u8>,
    data: Vec<u8>,
}

impl Sensitive {
    fn unique(&self) -> Digest {
        crypto::sha256(&[&self.obfuscation, &self.auth_value, &self.data])
    }
}

impl Drop for Sensitive {
    fn drop(&mut self) {
        self.obfuscation.zeroize();
        self.auth_value.zeroize();
        self.data.zeroize();
    }
}

pub struct Platform<S: Store> {
    rng: ChaCha8Rng,
    store: S,
    state: PersistentState,
    /// Regenerated on every start, never persisted.
    null_seed: Zeroizing<[u8; 32]>,
    objects: BTreeMap<u32, Object>,
    sessions: BTreeMap<u32, SessionState>,
    next_handle: u32,
}

impl<S: Store> Platform<S> {
    /// Restores the state found in `store`, or provisions a fresh one.
    pub fn new(mut store: S, mut rng: ChaCha8Rng) -> Result<Self> {
        let state = match store.load().map_err(Error::ModuleCommunication)? {
            Some(image) => PersistentState::decode(&image).map_err(Error::ModuleCommunication)?,
            None => {
                let state = PersistentState::fresh(&mut rng);
                store
                    .save(&state.encode().map_err(Error::ModuleCommunication)?)
                    .map_err(Error::ModuleCommunication)?;
                state
            }
        };

        let mut null_seed = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut *null_seed);

        Ok(Self {
            rng,
            store,
            state,
            null_seed,
            objects: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_handle: 0,
        })
    }

    pub fn loaded_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drops all transient state and hands back the store, like a power cycle.
    pub fn into_store(self) -> S {
        self.store
    }

    fn persist(&mut self) -> Result<()> {
        let image = self.state.encode().map_err(Error::ModuleCommunication)?;
        self.store.save(&image).map_err(Error::ModuleCommunication)
    }

    fn allocate(&mut self, base: u32) -> u32 {
        self.next_handle = (self.next_handle + 1) & 0x00ff_ffff;
        base | self.next_handle
    }

    fn load_object(&mut self, object: Object) -> Result<ObjectHandle, Status> {
        if self.objects.len() >= MAX_OBJECTS {
            return Err(Status::ObjectMemory);
        }
        let handle = self.allocate(OBJECT_HANDLE_BASE);
        self.objects.insert(handle, object);
        Ok(ObjectHandle(handle))
    }

    fn primary_key(&self, parent: ObjectHandle) -> Result<(&[u8; 32], u16), Status> {
        match self.objects.get(&parent.0) {
            Some(Object::Primary {
                key,
                template_version,
            }) => Ok((&**key, *template_version)),
            _ => Err(Status::Handle),
        }
    }

    fn session_mut(&mut self, session: SessionHandle) -> Result<&mut SessionState, Status> {
        self.sessions.get_mut(&session.0).ok_or(Status::Handle)
    }

    fn pcr_values(&self, selection: &PcrSelection) -> Vec<Digest> {
        let bank = self.state.pcrs.bank(selection.bank());
        selection
            .indices()
            .map(|index| bank[index as usize].clone())
            .collect()
    }

    fn execute(&mut self, request: Request) -> Result<Reply, Status> {
        match request {
            Request::GetRandom { count } => {
                if count > 64 {
                    return Err(Status::Value);
                }
                let mut bytes = Zeroizing::new(vec![0u8; count]);
                self.rng.fill_bytes(&mut bytes);
                Ok(Reply::Random(bytes))
            }

            Request::CreatePrimary { template } => self.create_primary(&template),

            Request::Create {
                parent,
                data,
                auth_value,
                auth_policy,
            } => self.create(parent, &data, &auth_value, auth_policy),

            Request::Load {
                parent,
                public,
                private,
            } => self.load(parent, &public, &private),

            Request::Unseal {
                object,
                session,
                auth_value: presented,
            } => {
                // consumed whatever happens next
                let session = self.sessions.remove(&session.0).ok_or(Status::Handle)?;
                match self.objects.get(&object.0) {
                    Some(Object::SealedData {
                        auth_policy,
                        auth_value,
                        data,
                    }) => {
                        if session.kind == SessionKind::Trial {
                            return Err(Status::AuthType);
                        }
                        if session.digest != *auth_policy {
                            return Err(Status::PolicyFail);
                        }
                        if session.password_required
                            && crypto::sha256(&[&presented]) != crypto::sha256(&[&auth_value])
                        {
                            return Err(Status::AuthFail);
                        }
                        Ok(Reply::Unseal(data.clone()))
                    }
                    _ => Err(Status::Handle),
                }
            }

            Request::FlushContext { handle } => {
                let flushed = match handle {
                    Handle::Object(object) => self.objects.remove(&object.0).is_some(),
                    Handle::Session(session) => self.sessions.remove(&session.0).is_some(),
                };
                if flushed {
                    Ok(Reply::FlushContext)
                } else {
                    Err(Status::Handle)
                }
            }

            Request::StartAuthSession { kind } => {
                if self.sessions.len() >= MAX_SESSIONS {
                    return Err(Status::SessionMemory);
                }
                let handle = self.allocate(SESSION_HANDLE_BASE);
                self.sessions.insert(
                    handle,
                    SessionState {
                        kind,
                        digest: vec![0; POLICY_DIGEST_LEN],
                        password_required: false,
                    },
                );
                Ok(Reply::StartAuthSession(SessionHandle(handle)))
            }

            Request::PolicyPcr { session, selection } => {
                if selection.is_empty() {
                    return Err(Status::Value);
                }
                let values = self.pcr_values(&selection);
                let parts: Vec<&[u8]> = values.iter().map(|value| &value[..]).collect();
                let pcr_digest = crypto::sha256(&parts);

                let session = self.session_mut(session)?;
                session.digest = crypto::sha256(&[
                    &session.digest,
                    &CC_POLICY_PCR.to_be_bytes(),
                    &selection.marshal(),
                    &pcr_digest,
                ]);
                Ok(Reply::PolicyUpdated)
            }

            Request::PolicyPassword { session } => {
                let session = self.session_mut(session)?;
                // same digest as PolicyAuthValue, as on a TPM
                session.digest =
                    crypto::sha256(&[&session.digest, &CC_POLICY_AUTH_VALUE.to_be_bytes()]);
                session.password_required = true;
                Ok(Reply::PolicyUpdated)
            }

            Request::PolicyOr { session, digests } => {
                if digests.len() < 2 || digests.len() > MAX_BRANCHES {
                    return Err(Status::Value);
                }
                if digests.iter().any(|digest| digest.len() != POLICY_DIGEST_LEN) {
                    return Err(Status::Size);
                }
                let session = self.session_mut(session)?;
                // a trial session only computes, it proves nothing
                if session.kind == SessionKind::Policy && !digests.contains(&session.digest) {
                    return Err(Status::PolicyFail);
                }
                let zeros = [0u8; POLICY_DIGEST_LEN];
                let command_code = CC_POLICY_OR.to_be_bytes();
                let mut parts: Vec<&[u8]> = Vec::with_capacity(digests.len() + 2);
                parts.push(&zeros);
                parts.push(&command_code);
                parts.extend(digests.iter().map(|digest| &digest[..]));
                session.digest = crypto::sha256(&parts);
                Ok(Reply::PolicyUpdated)
            }

            Request::PolicyGetDigest { session } => {
                let session = self.session_mut(session)?;
                Ok(Reply::PolicyGetDigest(session.digest.clone()))
            }

            Request::PcrRead { selection } => Ok(Reply::PcrRead(self.pcr_values(&selection))),

            Request::PcrEvent { bank, index, data } => {
                if index >= PCR_COUNT {
                    return Err(Status::Value);
                }
                let event = crypto::hash(bank, &[&data]);
                let register = &mut self.state.pcrs.bank_mut(bank)[index as usize];
                *register = crypto::hash(bank, &[&register[..], &event]);
                Ok(Reply::PcrEvent)
            }

            Request::NvDefineSpace { index, size } => {
                if size == 0 || size > NV_CAPACITY {
                    return Err(Status::Size);
                }
                if self.state.nv.contains_key(&index.value()) {
                    return Err(Status::NvDefined);
                }
                self.state.nv.insert(index.value(), vec![0; size]);
                Ok(Reply::NvDefineSpace)
            }

            Request::NvReadPublic { index } => {
                let slot = self.nv_slot(index)?;
                Ok(Reply::NvReadPublic { size: slot.len() })
            }

            Request::NvWrite {
                index,
                offset,
                data,
            } => {
                if data.len() > MAX_NV_BUFFER {
                    return Err(Status::Size);
                }
                let slot = self.state.nv.get_mut(&index.value()).ok_or(Status::Handle)?;
                let end = offset.checked_add(data.len()).ok_or(Status::NvRange)?;
                if end > slot.len() {
                    return Err(Status::NvRange);
                }
                slot[offset..end].copy_from_slice(&data);
                Ok(Reply::NvWrite)
            }

            Request::NvRead {
                index,
                offset,
                size,
            } => {
                if size > MAX_NV_BUFFER {
                    return Err(Status::Size);
                }
                let slot = self.nv_slot(index)?;
                let end = offset.checked_add(size).ok_or(Status::NvRange)?;
                if end > slot.len() {
                    return Err(Status::NvRange);
                }
                Ok(Reply::NvRead(slot[offset..end].to_vec()))
            }

            Request::NvUndefineSpace { index } => {
                self.state
                    .nv
                    .remove(&index.value())
                    .ok_or(Status::Handle)?;
                Ok(Reply::NvUndefineSpace)
            }
        }
    }

    fn nv_slot(&self, index: NvIndex) -> Result<&Vec<u8>, Status> {
        self.state.nv.get(&index.value()).ok_or(Status::Handle)
    }

    fn create_primary(&mut self, template: &PrimaryTemplate) -> Result<Reply, Status> {
        let seed: &[u8] = match template.hierarchy {
            Hierarchy::Owner => &self.state.owner_seed,
            Hierarchy::Null => &*self.null_seed,
        };
        let context = postcard::to_allocvec(template).map_err(|_| Status::Value)?;
        let key = crypto::derive_key(seed, b"primary", &context)?;

        let handle = self.load_object(Object::Primary {
            key,
            template_version: template.version,
        })?;
        Ok(Reply::CreatePrimary(handle))
    }

    fn create(
        &mut self,
        parent: ObjectHandle,
        data: &[u8],
        auth_value: &[u8],
        auth_policy: Digest,
    ) -> Result<Reply, Status> {
        if data.is_empty() || data.len() > MAX_SEALED_DATA {
            return Err(Status::Size);
        }
        if auth_policy.len() != POLICY_DIGEST_LEN || auth_value.len() > MAX_PASSWORD_LEN {
            return Err(Status::Size);
        }

        let mut obfuscation = vec![0u8; 32];
        let mut nonce = [0u8; crypto::NONCE_LEN];
        self.rng.fill_bytes(&mut obfuscation);
        self.rng.fill_bytes(&mut nonce);

        let (key, template_version) = self.primary_key(parent)?;
        let sensitive = Sensitive {
            obfuscation,
            auth_value: auth_value.to_vec(),
            data: data.to_vec(),
        };
        let public = PublicArea {
            name_algorithm: HashAlgorithm::Sha256,
            auth_policy,
            template_version,
            unique: sensitive.unique(),
        };

        let public = postcard::to_allocvec(&public).map_err(|_| Status::Failure)?;
        let plaintext =
            Zeroizing::new(postcard::to_allocvec(&sensitive).map_err(|_| Status::Failure)?);
        let private = crypto::seal(key, nonce, &public, &plaintext)?;

        Ok(Reply::Create { public, private })
    }

    fn load(
        &mut self,
        parent: ObjectHandle,
        public: &[u8],
        private: &[u8],
    ) -> Result<Reply, Status> {
        let (key, template_version) = self.primary_key(parent)?;
        let area: PublicArea = postcard::from_bytes(public).map_err(|_| Status::Value)?;
        if area.template_version != template_version {
            return Err(Status::Integrity);
        }

        let plaintext = crypto::open(key, public, private)?;
        let mut sensitive: Sensitive =
            postcard::from_bytes(&plaintext).map_err(|_| Status::Integrity)?;
        if sensitive.unique() != area.unique {
            return Err(Status::Integrity);
        }

        let handle = self.load_object(Object::SealedData {
            auth_policy: area.auth_policy,
            auth_value: Zeroizing::new(mem::take(&mut sensitive.auth_value)),
            data: Zeroizing::new(mem::take(&mut sensitive.data)),
        })?;
        Ok(Reply::Load(handle))
    }
}

impl<S: Store> Channel for Platform<S> {
    fn transact(&mut self, request: Request) -> Result<Reply> {
        let name = request.name();
        let persistent = matches!(
            request,
            Request::PcrEvent { .. }
                | Request::NvDefineSpace { .. }
                | Request::NvWrite { .. }
                | Request::NvUndefineSpace { .. }
        );
        trace!("{}", name);

        // a change only takes effect once it is saved
        let snapshot = if persistent {
            Some(self.state.clone())
        } else {
            None
        };

        let reply = self.execute(request).map_err(|status| {
            debug!("{} failed: {} ({:#05x})", name, status, status.code());
            Error::from(status)
        })?;

        if let Some(snapshot) = snapshot {
            if let Err(err) = self.persist() {
                warn!("{} could not be saved, reverting it: {}", name, err);
                self.state = snapshot;
                return Err(err);
            }
        }
        Ok(reply)
    }
}
