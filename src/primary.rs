//! Derivation of the primary storage key that parents every sealed secret.
//!
//! The primary is never persisted: the module recomputes it from its seed and
//! the template each time, so the template must stay fixed for a given
//! version. Blobs record the version they were sealed under.

use serde::{Deserialize, Serialize};

use crate::api::{Channel, ObjectHandle};
use crate::client::Client;
use crate::error::DecodeError;
use crate::policy::HashAlgorithm;
use crate::Result;

/// Template version used for new keys.
pub const TEMPLATE_VERSION: u16 = 1;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Hierarchy {
    /// Seed survives reboots and only changes when the owner clears the module.
    Owner,
    /// Seed is regenerated on every module reset.
    Null,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SymmetricAlgorithm {
    ChaCha20Poly1305,
}

/// Public template of a primary storage key.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PrimaryTemplate {
    pub version: u16,
    pub hierarchy: Hierarchy,
    pub algorithm: SymmetricAlgorithm,
    pub key_bits: u16,
    pub name_algorithm: HashAlgorithm,
}

impl PrimaryTemplate {
    pub fn for_version(version: u16) -> Result<Self, DecodeError> {
        match version {
            1 => Ok(Self {
                version,
                hierarchy: Hierarchy::Owner,
                algorithm: SymmetricAlgorithm::ChaCha20Poly1305,
                key_bits: 256,
                name_algorithm: HashAlgorithm::Sha256,
            }),
            other => Err(DecodeError::UnsupportedTemplate(other)),
        }
    }
}

pub fn derive_primary<C: Channel>(client: &mut Client<C>, version: u16) -> Result<ObjectHandle> {
    let template = PrimaryTemplate::for_version(version)?;
    client.create_primary(&template)
}

/// Runs `f` with the primary of `version` loaded, flushing it afterwards.
pub fn with_primary<C, T, F>(client: &mut Client<C>, version: u16, f: F) -> Result<T>
where
    C: Channel,
    F: FnOnce(&mut Client<C>, ObjectHandle) -> Result<T>,
{
    let primary = derive_primary(client, version)?;
    with_flush(client, primary, f)
}

/// Loads a sealed object under `parent` and runs `f` with it, flushing it afterwards.
pub fn with_object<C, T, F>(
    client: &mut Client<C>,
    parent: ObjectHandle,
    public: &[u8],
    private: &[u8],
    f: F,
) -> Result<T>
where
    C: Channel,
    F: FnOnce(&mut Client<C>, ObjectHandle) -> Result<T>,
{
    let object = client.load(parent, public, private)?;
    with_flush(client, object, f)
}

fn with_flush<C, T, F>(client: &mut Client<C>, object: ObjectHandle, f: F) -> Result<T>
where
    C: Channel,
    F: FnOnce(&mut Client<C>, ObjectHandle) -> Result<T>,
{
    let result = f(client, object);
    let flushed = client.flush_object(object);
    let value = result?;
    flushed?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{store::RamStore, Platform};
    use crate::Error;

    use chacha20::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn unknown_template_is_rejected_before_the_module() {
        let platform = Platform::new(RamStore::default(), ChaCha8Rng::seed_from_u64(1)).unwrap();
        let mut client = Client::new(platform);

        assert!(matches!(
            derive_primary(&mut client, 7),
            Err(Error::BlobDecode(DecodeError::UnsupportedTemplate(7)))
        ));
        assert_eq!(client.channel().loaded_objects(), 0);
    }

    #[test]
    fn primary_is_flushed_after_use() {
        let platform = Platform::new(RamStore::default(), ChaCha8Rng::seed_from_u64(1)).unwrap();
        let mut client = Client::new(platform);

        let seen = with_primary(&mut client, TEMPLATE_VERSION, |client, primary| {
            assert_eq!(client.channel().loaded_objects(), 1);
            Ok(primary)
        })
        .unwrap();
        assert_eq!(client.channel().loaded_objects(), 0);

        let failed: Result<()> = with_primary(&mut client, TEMPLATE_VERSION, |_, _| {
            Err(Error::PolicyNotSatisfied)
        });
        assert!(matches!(failed, Err(Error::PolicyNotSatisfied)));
        assert_eq!(client.channel().loaded_objects(), 0);
        assert_ne!(seen.0, 0);
    }
}
