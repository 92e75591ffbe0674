//! The module's non-volatile slot holding the current key blob.
//!
//! Replacing a blob takes two steps, [`delete`] then [`store`]: `store`
//! never overwrites.
//!
//! While a blob is being replaced, its successor is [`stage`]d in the slot at
//! [`NvIndex::staging`]. That slot is an ordinary owner index which may hold
//! another key, so a staged blob carries a header naming the index it
//! belongs to, and only a matching header makes it a staged copy.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;

use log::{debug, info, warn};

use crate::api::Channel;
use crate::client::Client;
use crate::{Error, Result};

/// Largest blob a slot may hold.
pub const NV_CAPACITY: usize = 2048;

const STAGED_MAGIC: [u8; 4] = *b"STGD";
const STAGED_HEADER_LEN: usize = 8;

/// Address of an NV slot in the owner range `0x01000000..=0x01FFFFFF`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NvIndex(u32);

impl NvIndex {
    /// Slot used when none is given.
    pub const DEFAULT: NvIndex = NvIndex(0x0180_94af);

    const STAGING_BIT: u32 = 0x0020_0000;

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Slot a replacement blob is staged in while this one is rewritten.
    /// See [`stage`].
    pub fn staging(&self) -> NvIndex {
        NvIndex(self.0 ^ Self::STAGING_BIT)
    }
}

impl Default for NvIndex {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u32> for NvIndex {
    type Error = Error;

    fn try_from(index: u32) -> Result<Self> {
        if index >> 24 == 0x01 {
            Ok(NvIndex(index))
        } else {
            Err(Error::InvalidNvIndex(index))
        }
    }
}

/// Accepts `0x`-prefixed hex or plain decimal.
impl FromStr for NvIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse(),
        };
        let index = parsed.map_err(|_| Error::UnparsableNvIndex(s.to_string()))?;
        NvIndex::try_from(index)
    }
}

impl fmt::Display for NvIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Defines a slot sized to `blob` and writes it. Fails with
/// [`Error::NvAlreadyExists`] if the slot is defined.
pub fn store<C: Channel>(client: &mut Client<C>, index: NvIndex, blob: &[u8]) -> Result<()> {
    if blob.len() > NV_CAPACITY {
        return Err(Error::NvCapacity {
            size: blob.len(),
            max: NV_CAPACITY,
        });
    }

    client.nv_define(index, blob.len())?;
    if let Err(err) = client.nv_write(index, blob) {
        // no half-written slot may survive
        warn!("writing NV index {} failed, undefining it again", index);
        if let Err(undefine) = client.nv_undefine(index) {
            warn!("could not undefine NV index {}: {}", index, undefine);
        }
        return Err(err);
    }

    info!("stored {} bytes at NV index {}", blob.len(), index);
    Ok(())
}

/// Fails with [`Error::NvNotFound`] if the slot is undefined.
pub fn load<C: Channel>(client: &mut Client<C>, index: NvIndex) -> Result<Vec<u8>> {
    let blob = client.nv_read(index)?;
    debug!("read {} bytes from NV index {}", blob.len(), index);
    Ok(blob)
}

/// Fails with [`Error::NvNotFound`] if the slot is already undefined.
pub fn delete<C: Channel>(client: &mut Client<C>, index: NvIndex) -> Result<()> {
    client.nv_undefine(index)?;
    info!("deleted NV index {}", index);
    Ok(())
}

pub fn exists<C: Channel>(client: &mut Client<C>, index: NvIndex) -> Result<bool> {
    match client.nv_read_public(index) {
        Ok(_) => Ok(true),
        Err(Error::NvNotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

fn staged_header(index: NvIndex) -> [u8; STAGED_HEADER_LEN] {
    let mut header = [0u8; STAGED_HEADER_LEN];
    header[..4].copy_from_slice(&STAGED_MAGIC);
    header[4..].copy_from_slice(&index.value().to_be_bytes());
    header
}

/// Stores `blob` at `index.staging()` as the replacement of `index`. Fails
/// with [`Error::NvAlreadyExists`] for the staging index if anything is
/// there, staged copy or not.
pub fn stage<C: Channel>(client: &mut Client<C>, index: NvIndex, blob: &[u8]) -> Result<()> {
    let mut record = staged_header(index).to_vec();
    record.extend_from_slice(blob);
    store(client, index.staging(), &record)
}

/// The blob staged for `index`, if the staging slot holds one.
pub fn load_staged<C: Channel>(client: &mut Client<C>, index: NvIndex) -> Result<Option<Vec<u8>>> {
    let staging = index.staging();
    let record = match load(client, staging) {
        Ok(record) => record,
        Err(Error::NvNotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    if record.len() < STAGED_HEADER_LEN || record[..STAGED_HEADER_LEN] != staged_header(index) {
        debug!("NV index {} is not staged for {}", staging, index);
        return Ok(None);
    }
    Ok(Some(record[STAGED_HEADER_LEN..].to_vec()))
}

pub fn staged_exists<C: Channel>(client: &mut Client<C>, index: NvIndex) -> Result<bool> {
    Ok(load_staged(client, index)?.is_some())
}

/// Deletes the blob staged for `index`. Leaves any other content of the
/// staging slot alone; returns whether something was deleted.
pub fn unstage<C: Channel>(client: &mut Client<C>, index: NvIndex) -> Result<bool> {
    if !staged_exists(client, index)? {
        return Ok(false);
    }
    delete(client, index.staging())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::store::{FlakyStore, RamStore};
    use crate::platform::Platform;

    use chacha20::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn client() -> Client<Platform<RamStore>> {
        let platform = Platform::new(RamStore::default(), ChaCha8Rng::seed_from_u64(3)).unwrap();
        Client::new(platform)
    }

    fn flaky_client(failing: Vec<usize>) -> Client<Platform<FlakyStore>> {
        let platform =
            Platform::new(FlakyStore::failing(failing), ChaCha8Rng::seed_from_u64(3)).unwrap();
        Client::new(platform)
    }

    #[test]
    fn index_parsing() {
        assert_eq!("0x018094AF".parse::<NvIndex>().unwrap(), NvIndex::DEFAULT);
        assert_eq!("16777217".parse::<NvIndex>().unwrap().value(), 0x0100_0001);
        assert!(matches!(
            NvIndex::try_from(0x8100_0001),
            Err(Error::InvalidNvIndex(0x8100_0001))
        ));
        assert!(matches!(
            "slot".parse::<NvIndex>(),
            Err(Error::UnparsableNvIndex(ref text)) if text == "slot"
        ));
        assert_eq!(
            "0xzz".parse::<NvIndex>().unwrap_err().to_string(),
            "\"0xzz\" is not an NV index, expected hex with 0x or decimal"
        );
        assert_eq!(NvIndex::DEFAULT.to_string(), "0x018094af");
    }

    #[test]
    fn staging_slot_is_distinct_and_involutive() {
        let index = NvIndex::DEFAULT;
        assert_ne!(index.staging(), index);
        assert_eq!(index.staging().staging(), index);
        assert!(NvIndex::try_from(index.staging().value()).is_ok());
    }

    #[test]
    fn store_does_not_overwrite() {
        let mut client = client();
        let index = NvIndex::DEFAULT;

        store(&mut client, index, b"first").unwrap();
        assert!(matches!(
            store(&mut client, index, b"second"),
            Err(Error::NvAlreadyExists(_))
        ));
        assert_eq!(load(&mut client, index).unwrap(), b"first");
    }

    #[test]
    fn second_delete_reports_not_found() {
        let mut client = client();
        let index = NvIndex::DEFAULT;

        store(&mut client, index, b"blob").unwrap();
        assert!(exists(&mut client, index).unwrap());
        delete(&mut client, index).unwrap();
        assert!(!exists(&mut client, index).unwrap());
        assert!(matches!(delete(&mut client, index), Err(Error::NvNotFound(_))));
        assert!(matches!(load(&mut client, index), Err(Error::NvNotFound(_))));
    }

    #[test]
    fn oversized_blob_is_refused_up_front() {
        let mut client = client();
        let blob = vec![0u8; NV_CAPACITY + 1];

        assert!(matches!(
            store(&mut client, NvIndex::DEFAULT, &blob),
            Err(Error::NvCapacity { .. })
        ));
        assert!(!exists(&mut client, NvIndex::DEFAULT).unwrap());
    }

    #[test]
    fn failed_define_leaves_no_slot() {
        // save 1 provisions the module, save 2 persists the definition
        let mut client = flaky_client(vec![2]);
        let index = NvIndex::DEFAULT;

        assert!(matches!(
            store(&mut client, index, b"blob"),
            Err(Error::ModuleCommunication(_))
        ));
        assert!(!exists(&mut client, index).unwrap());
        assert!(matches!(load(&mut client, index), Err(Error::NvNotFound(_))));

        store(&mut client, index, b"blob").unwrap();
        assert_eq!(load(&mut client, index).unwrap(), b"blob");
    }

    #[test]
    fn failed_write_is_rolled_back() {
        // save 3 persists the write
        let mut client = flaky_client(vec![3]);
        let index = NvIndex::DEFAULT;

        assert!(matches!(
            store(&mut client, index, b"blob"),
            Err(Error::ModuleCommunication(_))
        ));
        assert!(!exists(&mut client, index).unwrap());

        // nor does the slot come back after a restart
        let store = client.into_channel().into_store();
        let mut client = Client::new(Platform::new(store, ChaCha8Rng::seed_from_u64(4)).unwrap());
        assert!(!exists(&mut client, index).unwrap());
    }

    #[test]
    fn staged_blob_is_found_only_for_its_index() {
        let mut client = client();
        let index = NvIndex::try_from(0x0100_0001).unwrap();

        assert_eq!(load_staged(&mut client, index).unwrap(), None);
        stage(&mut client, index, b"next").unwrap();
        assert!(exists(&mut client, index.staging()).unwrap());
        assert_eq!(load_staged(&mut client, index).unwrap(), Some(b"next".to_vec()));
        assert!(!staged_exists(&mut client, index.staging()).unwrap());

        assert!(unstage(&mut client, index).unwrap());
        assert!(!exists(&mut client, index.staging()).unwrap());
        assert!(!unstage(&mut client, index).unwrap());
    }

    #[test]
    fn key_in_the_staging_slot_is_left_alone() {
        let mut client = client();
        let index = NvIndex::try_from(0x0100_0001).unwrap();
        let neighbour = NvIndex::try_from(0x0120_0001).unwrap();
        assert_eq!(index.staging(), neighbour);

        store(&mut client, neighbour, b"someone else's key").unwrap();
        assert_eq!(load_staged(&mut client, index).unwrap(), None);
        assert!(!unstage(&mut client, index).unwrap());
        assert!(matches!(
            stage(&mut client, index, b"next"),
            Err(Error::NvAlreadyExists(i)) if i == neighbour
        ));
        assert_eq!(load(&mut client, neighbour).unwrap(), b"someone else's key");
    }
}
