//! Authorization policies a secret is sealed under, and how to satisfy them.
//!
//! A sealed key carries one or more *branches*. Each branch is an
//! [`AuthPolicy`]: either the current values of a set of platform
//! measurement registers, or a password. With a single branch the object's
//! authorization digest is that branch's digest; with several, the module's
//! PolicyOR folds the branch digests into one, and unsealing replays exactly
//! one branch followed by the same PolicyOR.
//!
//! The password itself never enters a digest. It becomes the sealed object's
//! auth value, and the password branch only asks the module to check it at
//! unseal time, so a key blob reveals nothing to guess a password against.
//!
//! Digests are computed by the module itself, with trial sessions at seal
//! time and real policy sessions at unseal time.

use core::fmt;
use core::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::api::{Channel, Digest};
use crate::client::{Client, Session};
use crate::error::DecodeError;
use crate::secret::Password;
use crate::{Error, Result};

/// Number of platform configuration registers per bank.
pub const PCR_COUNT: u8 = 24;

/// PolicyOR accepts at most this many branches.
pub const MAX_BRANCHES: usize = 8;

/// An auth value is at most as long as a SHA-256 digest.
pub const MAX_PASSWORD_LEN: usize = 32;

/// Hash algorithm of a PCR bank, or of a primary object's name.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// TPM algorithm identifier.
    pub fn id(&self) -> u16 {
        match self {
            HashAlgorithm::Sha1 => 0x0004,
            HashAlgorithm::Sha256 => 0x000b,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            0x0004 => Some(HashAlgorithm::Sha1),
            0x000b => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha1 => f.write_str("sha1"),
            HashAlgorithm::Sha256 => f.write_str("sha256"),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            _ => Err(Error::IllFormedPolicy("unknown PCR bank")),
        }
    }
}

/// A set of register indices within one PCR bank.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PcrSelection {
    bank: HashAlgorithm,
    mask: u32,
}

impl PcrSelection {
    /// Fails for indices beyond [`PCR_COUNT`]. An empty set is representable,
    /// but no policy will be built from it.
    pub fn new(bank: HashAlgorithm, indices: impl IntoIterator<Item = u8>) -> Result<Self> {
        let mut mask = 0u32;
        for index in indices {
            if index >= PCR_COUNT {
                return Err(Error::IllFormedPolicy("PCR index out of range"));
            }
            mask |= 1 << index;
        }
        Ok(Self { bank, mask })
    }

    pub fn from_mask(bank: HashAlgorithm, mask: u32) -> Result<Self, DecodeError> {
        if mask >> PCR_COUNT != 0 {
            return Err(DecodeError::InvalidPcrMask(mask));
        }
        Ok(Self { bank, mask })
    }

    pub fn bank(&self) -> HashAlgorithm {
        self.bank
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn contains(&self, index: u8) -> bool {
        index < PCR_COUNT && self.mask & (1 << index) != 0
    }

    /// Selected indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u8> + '_ {
        (0..PCR_COUNT).filter(move |index| self.contains(*index))
    }

    /// `TPML_PCR_SELECTION` image with a single bank, as hashed into PolicyPCR.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&self.bank.id().to_be_bytes());
        out.push(3);
        out.extend_from_slice(&self.mask.to_le_bytes()[..3]);
        out
    }
}

/// PCRs 0, 2, 4 and 6 of the SHA-256 bank: firmware, option ROMs, boot
/// loader and platform-specific code.
impl Default for PcrSelection {
    fn default() -> Self {
        Self {
            bank: HashAlgorithm::Sha256,
            mask: 0b0101_0101,
        }
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.bank)?;
        for (i, index) in self.indices().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", index)?;
        }
        Ok(())
    }
}

/// One way of authorizing an unseal.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthPolicy {
    /// The listed registers must hold the values they held at seal time.
    PlatformState(PcrSelection),
    /// The caller must present this password.
    Password(Password),
}

impl AuthPolicy {
    /// What gets recorded in a key blob about this branch.
    pub fn kind(&self) -> BranchKind {
        match self {
            AuthPolicy::PlatformState(selection) => BranchKind::PlatformState(*selection),
            AuthPolicy::Password(_) => BranchKind::Password,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            AuthPolicy::PlatformState(selection) if selection.is_empty() => {
                Err(Error::IllFormedPolicy("empty PCR selection"))
            }
            AuthPolicy::Password(password) if password.is_empty() => {
                Err(Error::IllFormedPolicy("empty password"))
            }
            AuthPolicy::Password(password) if password.len() > MAX_PASSWORD_LEN => {
                Err(Error::IllFormedPolicy("password longer than 32 bytes"))
            }
            _ => Ok(()),
        }
    }
}

/// The branches a new secret gets sealed under.
#[derive(Clone, Debug, PartialEq)]
pub struct SealPolicy {
    branches: Vec<AuthPolicy>,
}

impl SealPolicy {
    pub fn platform(selection: PcrSelection) -> Self {
        Self {
            branches: vec![AuthPolicy::PlatformState(selection)],
        }
    }

    pub fn password(password: Password) -> Self {
        Self {
            branches: vec![AuthPolicy::Password(password)],
        }
    }

    pub fn with_password(self, password: Password) -> Self {
        self.with_branch(AuthPolicy::Password(password))
    }

    pub fn with_branch(mut self, branch: AuthPolicy) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn branches(&self) -> &[AuthPolicy] {
        &self.branches
    }

    /// The password of the password branch, which the sealed object takes
    /// as its auth value.
    pub fn password_branch(&self) -> Option<&Password> {
        self.branches.iter().find_map(|branch| match branch {
            AuthPolicy::Password(password) => Some(password),
            AuthPolicy::PlatformState(_) => None,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.branches.is_empty() || self.branches.len() > MAX_BRANCHES {
            return Err(Error::IllFormedPolicy("a key needs between 1 and 8 policy branches"));
        }
        let platform = self
            .branches
            .iter()
            .filter(|branch| matches!(branch, AuthPolicy::PlatformState(_)))
            .count();
        if platform > 1 || self.branches.len() - platform > 1 {
            return Err(Error::IllFormedPolicy("duplicate policy branch"));
        }
        self.branches.iter().try_for_each(AuthPolicy::validate)
    }
}

/// Branch kind as persisted: PCR selections are public, passwords are not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BranchKind {
    PlatformState(PcrSelection),
    Password,
}

/// A branch as recorded in a key blob, with the digest it had at seal time.
/// A password branch's digest is the same for every password.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicyBranch {
    pub kind: BranchKind,
    pub digest: Digest,
}

/// Everything needed to replay a sealed key's policy, minus the secrets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicyDescriptor {
    pub branches: Vec<PolicyBranch>,
}

impl PolicyDescriptor {
    /// The PCR selection of the platform-state branch, if there is one.
    pub fn platform_state(&self) -> Option<PcrSelection> {
        self.branches.iter().find_map(|branch| match branch.kind {
            BranchKind::PlatformState(selection) => Some(selection),
            BranchKind::Password => None,
        })
    }

    pub fn has_password(&self) -> bool {
        self.branches
            .iter()
            .any(|branch| branch.kind == BranchKind::Password)
    }

    fn digests(&self) -> Vec<Digest> {
        self.branches
            .iter()
            .map(|branch| branch.digest.clone())
            .collect()
    }
}

/// Extends `session` by one branch, without any PolicyOR.
fn apply<C: Channel>(client: &mut Client<C>, session: &Session, policy: &AuthPolicy) -> Result<()> {
    match policy {
        AuthPolicy::PlatformState(selection) => client.policy_pcr(session, *selection),
        AuthPolicy::Password(_) => client.policy_password(session),
    }
}

/// Digest of a single branch, evaluated in a trial session against the
/// module's current state.
pub fn build_digest<C: Channel>(client: &mut Client<C>, policy: &AuthPolicy) -> Result<Digest> {
    policy.validate()?;
    client.with_trial_session(|client, session| {
        apply(client, session, policy)?;
        client.policy_digest(session)
    })
}

/// Builds every branch of `policy`. Returns the digest to seal under, and
/// the descriptor to persist next to the sealed object.
pub fn compose<C: Channel>(
    client: &mut Client<C>,
    policy: &SealPolicy,
) -> Result<(Digest, PolicyDescriptor)> {
    policy.validate()?;

    let mut branches = Vec::with_capacity(policy.branches().len());
    for branch in policy.branches() {
        let digest = build_digest(client, branch)?;
        debug!("branch {:?}: {}", branch.kind(), delog::hex_str!(&digest[..]));
        branches.push(PolicyBranch {
            kind: branch.kind(),
            digest,
        });
    }
    let descriptor = PolicyDescriptor { branches };

    let auth_policy = match descriptor.branches.as_slice() {
        [single] => single.digest.clone(),
        _ => {
            let digests = descriptor.digests();
            client.with_trial_session(|client, session| {
                client.policy_or(session, &digests)?;
                client.policy_digest(session)
            })?
        }
    };

    Ok((auth_policy, descriptor))
}

/// Replays `policy` on a real policy session, ready for one unseal.
pub fn satisfy<C: Channel>(
    client: &mut Client<C>,
    session: &Session,
    policy: &AuthPolicy,
    descriptor: &PolicyDescriptor,
) -> Result<()> {
    policy.validate()?;
    apply(client, session, policy)?;
    if descriptor.branches.len() > 1 {
        client.policy_or(session, &descriptor.digests())?;
    }
    Ok(())
}
