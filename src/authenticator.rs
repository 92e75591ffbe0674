//! The TOTP authenticator: lifecycle of one sealed secret.
//!
//! Blob-level operations (`*_key`, [`store`](Authenticator::store),
//! [`load`](Authenticator::load), [`delete`](Authenticator::delete)) work on
//! a [`SealedKeyBlob`] in memory. Index-level operations (`generate`,
//! `calculate`, `reseal`, `recover`, `clean`) are what the command line
//! exposes and keep the NV slot consistent.
//!
//! Every module interaction runs through the scoped helpers of
//! [`primary`](crate::primary) and [`Client`], so transient objects and
//! sessions are released on every path, including failures.

use log::{debug, info, warn};

use crate::api::{Channel, SessionKind};
use crate::blob::SealedKeyBlob;
use crate::client::Client;
use crate::nv::{self, NvIndex};
use crate::policy::{self, AuthPolicy, SealPolicy};
use crate::primary::{with_object, with_primary, TEMPLATE_VERSION};
use crate::secret::{Password, Secret, SECRET_LEN};
use crate::totp::{self, TotpCode};
use crate::{Error, Result};

/// The core "app", sealing its TOTP secret to the root-of-trust module.
pub struct Authenticator<C: Channel> {
    client: Client<C>,
}

impl<C: Channel> Authenticator<C> {
    /// Constructor, consumes the channel to the module
    pub fn new(channel: C) -> Self {
        Self {
            client: Client::new(channel),
        }
    }

    pub fn client(&self) -> &Client<C> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client<C> {
        &mut self.client
    }

    pub fn into_client(self) -> Client<C> {
        self.client
    }

    /// Draws a fresh secret from the module and seals it under `policy`.
    pub fn generate_key(&mut self, policy: &SealPolicy) -> Result<(Secret, SealedKeyBlob)> {
        let secret = Secret::new(self.client.get_random(SECRET_LEN)?);
        let blob = self.seal_secret(&secret, policy)?;
        Ok((secret, blob))
    }

    /// Unseals through the platform-state branch and computes the code for `timestamp`.
    pub fn calculate_key(&mut self, blob: &SealedKeyBlob, timestamp: u64) -> Result<TotpCode> {
        let selection = blob
            .policy
            .platform_state()
            .ok_or(Error::IllFormedPolicy("key has no platform-state branch"))?;
        let secret = self.unseal_secret(blob, &AuthPolicy::PlatformState(selection))?;
        Ok(totp::calculate(secret.as_bytes(), timestamp))
    }

    /// Unseals through the password branch, bypassing the platform state.
    pub fn recover_key(&mut self, blob: &SealedKeyBlob, password: &Password) -> Result<Secret> {
        if !blob.policy.has_password() {
            return Err(Error::IllFormedPolicy("key has no password branch"));
        }
        self.unseal_secret(blob, &AuthPolicy::Password(password.clone()))
    }

    /// Same secret, new policy. The old blob stays valid until it is deleted.
    pub fn reseal_key(
        &mut self,
        blob: &SealedKeyBlob,
        password: &Password,
        policy: &SealPolicy,
    ) -> Result<SealedKeyBlob> {
        let secret = self.recover_key(blob, password)?;
        self.seal_secret(&secret, policy)
    }

    pub fn store(&mut self, index: NvIndex, blob: &SealedKeyBlob) -> Result<()> {
        let bytes = blob.encode()?;
        nv::store(&mut self.client, index, &bytes)
    }

    /// Falls back to the blob staged for `index` if a reseal was interrupted
    /// after it deleted `index`.
    pub fn load(&mut self, index: NvIndex) -> Result<SealedKeyBlob> {
        let bytes = match nv::load(&mut self.client, index) {
            Ok(bytes) => bytes,
            Err(Error::NvNotFound(_)) => match nv::load_staged(&mut self.client, index)? {
                Some(bytes) => {
                    warn!(
                        "NV index {} is empty, using the blob staged at {}",
                        index,
                        index.staging()
                    );
                    bytes
                }
                None => return Err(Error::NvNotFound(index)),
            },
            Err(err) => return Err(err),
        };
        Ok(SealedKeyBlob::decode(&bytes)?)
    }

    pub fn delete(&mut self, index: NvIndex) -> Result<()> {
        nv::delete(&mut self.client, index)
    }

    /// Fails with [`Error::NvAlreadyExists`] if `index` holds a key.
    pub fn generate(
        &mut self,
        index: NvIndex,
        policy: &SealPolicy,
    ) -> Result<(Secret, SealedKeyBlob)> {
        if nv::exists(&mut self.client, index)? || nv::staged_exists(&mut self.client, index)? {
            return Err(Error::NvAlreadyExists(index));
        }
        let (secret, blob) = self.generate_key(policy)?;
        self.store(index, &blob)?;
        Ok((secret, blob))
    }

    pub fn calculate(&mut self, index: NvIndex, timestamp: u64) -> Result<TotpCode> {
        let blob = self.load(index)?;
        self.calculate_key(&blob, timestamp)
    }

    pub fn recover(&mut self, index: NvIndex, password: &Password) -> Result<Secret> {
        let blob = self.load(index)?;
        self.recover_key(&blob, password)
    }

    /// Replaces the key at `index` with one sealed under `policy`.
    ///
    /// The new blob is staged first, so at every point one of the two slots
    /// holds a blob of the secret. Fails with [`Error::NvAlreadyExists`] for
    /// [`NvIndex::staging`] if another key lives there.
    pub fn reseal(
        &mut self,
        index: NvIndex,
        password: &Password,
        policy: &SealPolicy,
    ) -> Result<SealedKeyBlob> {
        let blob = self.load(index)?;
        let resealed = self.reseal_key(&blob, password, policy)?;

        if !nv::exists(&mut self.client, index)? {
            // an earlier reseal died mid-swap, the staged blob is the only copy
            self.store(index, &resealed)?;
            nv::unstage(&mut self.client, index)?;
            info!("completed interrupted reseal of NV index {}", index);
            return Ok(resealed);
        }

        if nv::unstage(&mut self.client, index)? {
            warn!("discarded a stale blob staged at {}", index.staging());
        }
        nv::stage(&mut self.client, index, &resealed.encode()?)?;
        nv::delete(&mut self.client, index)?;
        self.store(index, &resealed)?;
        nv::unstage(&mut self.client, index)?;

        info!("resealed key at NV index {}", index);
        Ok(resealed)
    }

    /// Deletes the key at `index`, and any blob staged for it.
    pub fn clean(&mut self, index: NvIndex) -> Result<()> {
        let staged = nv::unstage(&mut self.client, index)?;
        if staged {
            warn!("removed a blob staged at {}", index.staging());
        }
        match nv::delete(&mut self.client, index) {
            Err(Error::NvNotFound(_)) if staged => Ok(()),
            other => other,
        }
    }

    fn seal_secret(&mut self, secret: &Secret, policy: &SealPolicy) -> Result<SealedKeyBlob> {
        let (auth_policy, descriptor) = policy::compose(&mut self.client, policy)?;
        let auth_value = policy.password_branch().map(Password::as_bytes).unwrap_or_default();
        let (public, private) = with_primary(&mut self.client, TEMPLATE_VERSION, |client, primary| {
            client.seal(primary, secret.as_bytes(), auth_value, &auth_policy)
        })?;
        info!(
            "sealed a {}-byte secret under {} policy branch(es)",
            secret.len(),
            descriptor.branches.len()
        );

        Ok(SealedKeyBlob {
            public,
            private,
            policy: descriptor,
            key_template_version: TEMPLATE_VERSION,
        })
    }

    fn unseal_secret(&mut self, blob: &SealedKeyBlob, branch: &AuthPolicy) -> Result<Secret> {
        debug!("unsealing through the {:?} branch", branch.kind());
        let auth_value: &[u8] = match branch {
            AuthPolicy::Password(password) => password.as_bytes(),
            AuthPolicy::PlatformState(_) => &[],
        };
        with_primary(&mut self.client, blob.key_template_version, |client, primary| {
            with_object(client, primary, &blob.public, &blob.private, |client, object| {
                let session = client.start_session(SessionKind::Policy)?;
                if let Err(err) = policy::satisfy(client, &session, branch, &blob.policy) {
                    if let Err(flush) = client.flush_session(session) {
                        warn!("could not flush policy session: {}", flush);
                    }
                    return Err(err);
                }
                client.unseal(object, session, auth_value).map(Secret::new)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use core::convert::TryFrom;

    use super::*;
    use crate::policy::{HashAlgorithm, PcrSelection};
    use crate::platform::{store::RamStore, Platform};

    use chacha20::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn authenticator() -> Authenticator<Platform<RamStore>> {
        let platform = Platform::new(RamStore::default(), ChaCha8Rng::seed_from_u64(11)).unwrap();
        Authenticator::new(platform)
    }

    fn assert_no_leaks(authenticator: &Authenticator<Platform<RamStore>>) {
        assert_eq!(authenticator.client().channel().loaded_objects(), 0);
        assert_eq!(authenticator.client().channel().active_sessions(), 0);
    }

    #[test]
    fn generated_secret_is_fresh_and_sized() {
        let mut authenticator = authenticator();
        let policy = SealPolicy::platform(PcrSelection::default());

        let (first, blob) = authenticator.generate_key(&policy).unwrap();
        let (second, _) = authenticator.generate_key(&policy).unwrap();
        assert_eq!(first.len(), SECRET_LEN);
        assert_ne!(first, second);
        assert_eq!(blob.key_template_version, TEMPLATE_VERSION);
        assert_no_leaks(&authenticator);
    }

    #[test]
    fn calculate_needs_a_platform_branch() {
        let mut authenticator = authenticator();
        let (_, blob) = authenticator
            .generate_key(&SealPolicy::password(Password::from("x")))
            .unwrap();

        assert!(matches!(
            authenticator.calculate_key(&blob, 59),
            Err(Error::IllFormedPolicy(_))
        ));
    }

    #[test]
    fn recover_needs_a_password_branch() {
        let mut authenticator = authenticator();
        let (_, blob) = authenticator
            .generate_key(&SealPolicy::platform(PcrSelection::default()))
            .unwrap();

        assert!(matches!(
            authenticator.recover_key(&blob, &Password::from("x")),
            Err(Error::IllFormedPolicy(_))
        ));
    }

    #[test]
    fn failed_unseal_releases_everything() {
        let mut authenticator = authenticator();
        let policy = SealPolicy::platform(PcrSelection::default()).with_password(Password::from("x"));
        let (_, blob) = authenticator.generate_key(&policy).unwrap();

        assert!(matches!(
            authenticator.recover_key(&blob, &Password::from("y")),
            Err(Error::PolicyNotSatisfied)
        ));
        assert_no_leaks(&authenticator);

        authenticator
            .client_mut()
            .pcr_event(HashAlgorithm::Sha256, 0, b"firmware update")
            .unwrap();
        assert!(matches!(
            authenticator.calculate_key(&blob, 59),
            Err(Error::PolicyNotSatisfied)
        ));
        assert_no_leaks(&authenticator);

        let mut corrupt = blob.clone();
        corrupt.private[16] ^= 0x80;
        assert!(authenticator.recover_key(&corrupt, &Password::from("x")).is_err());
        assert_no_leaks(&authenticator);
    }

    #[test]
    fn generate_refuses_an_occupied_index() {
        let mut authenticator = authenticator();
        let index = NvIndex::try_from(0x0100_0001).unwrap();
        let policy = SealPolicy::platform(PcrSelection::default());

        authenticator.generate(index, &policy).unwrap();
        assert!(matches!(
            authenticator.generate(index, &policy),
            Err(Error::NvAlreadyExists(i)) if i == index
        ));
    }

    #[test]
    fn clean_removes_a_staged_blob_too() {
        let mut authenticator = authenticator();
        let index = NvIndex::DEFAULT;
        let (_, blob) = authenticator
            .generate_key(&SealPolicy::platform(PcrSelection::default()))
            .unwrap();

        authenticator.store(index, &blob).unwrap();
        nv::stage(authenticator.client_mut(), index, &blob.encode().unwrap()).unwrap();
        authenticator.clean(index).unwrap();

        assert!(matches!(authenticator.load(index), Err(Error::NvNotFound(i)) if i == index));
        assert!(!nv::exists(authenticator.client_mut(), index.staging()).unwrap());
        assert!(matches!(authenticator.clean(index), Err(Error::NvNotFound(_))));
    }

    #[test]
    fn neighbouring_key_is_not_a_staged_blob() {
        let mut authenticator = authenticator();
        let policy = SealPolicy::platform(PcrSelection::default()).with_password(Password::from("x"));
        let index = NvIndex::try_from(0x0100_0001).unwrap();
        let neighbour = NvIndex::try_from(0x0120_0001).unwrap();
        assert_eq!(index.staging(), neighbour);

        let (neighbours_secret, _) = authenticator.generate(neighbour, &policy).unwrap();
        let expected = totp::calculate(neighbours_secret.as_bytes(), 59);

        assert!(matches!(authenticator.calculate(index, 59), Err(Error::NvNotFound(i)) if i == index));
        assert!(matches!(authenticator.clean(index), Err(Error::NvNotFound(i)) if i == index));
        assert_eq!(authenticator.calculate(neighbour, 59).unwrap(), expected);

        let (secret, _) = authenticator.generate(index, &policy).unwrap();
        assert!(matches!(
            authenticator.reseal(index, &Password::from("x"), &policy),
            Err(Error::NvAlreadyExists(i)) if i == neighbour
        ));
        authenticator.clean(index).unwrap();

        assert!(matches!(authenticator.recover(index, &Password::from("x")), Err(Error::NvNotFound(_))));
        assert_eq!(authenticator.calculate(neighbour, 59).unwrap(), expected);
        assert_ne!(secret, neighbours_secret);
        assert_no_leaks(&authenticator);
    }
}
