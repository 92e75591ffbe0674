//! Persistent state of the software module.
//!
//! The whole state (owner seed, PCR banks, NV slots) is one `postcard`
//! image. It lives in a file for real use, or in RAM for tests.
use std::{collections::BTreeMap, fs, io, path::PathBuf};

use log::info;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::policy::{HashAlgorithm, PCR_COUNT};

/// Where the module keeps its state image between runs.
pub trait Store {
    /// `None` if nothing was saved yet.
    fn load(&mut self) -> io::Result<Option<Vec<u8>>>;
    fn save(&mut self, image: &[u8]) -> io::Result<()>;
}

/// State image in a single file, replaced atomically on every save.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            path: state_path.into(),
        }
    }
}

impl Store for FileStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(image) => Ok(Some(image)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn save(&mut self, image: &[u8]) -> io::Result<()> {
        use std::io::Write;

        let mut staging = self.path.clone().into_os_string();
        staging.push(".new");
        let staging = PathBuf::from(staging);

        let mut file = fs::File::create(&staging)?;
        file.write_all(image)?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)
    }
}

/// Volatile state, lost with the value.
#[derive(Clone, Default)]
pub struct RamStore {
    image: Option<Vec<u8>>,
}

impl Store for RamStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.image.clone())
    }

    fn save(&mut self, image: &[u8]) -> io::Result<()> {
        self.image = Some(image.to_vec());
        Ok(())
    }
}

/// Volatile state whose saves fail on demand, counted from 1.
#[cfg(test)]
#[derive(Default)]
pub struct FlakyStore {
    image: Option<Vec<u8>>,
    saves: usize,
    failing: Vec<usize>,
}

#[cfg(test)]
impl FlakyStore {
    pub fn failing(failing: Vec<usize>) -> Self {
        Self {
            failing,
            ..Self::default()
        }
    }
}

#[cfg(test)]
impl Store for FlakyStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.image.clone())
    }

    fn save(&mut self, image: &[u8]) -> io::Result<()> {
        self.saves += 1;
        if self.failing.contains(&self.saves) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.image = Some(image.to_vec());
        Ok(())
    }
}

/// Registers of both banks, all zero after a reset.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PcrBanks {
    sha1: Vec<Vec<u8>>,
    sha256: Vec<Vec<u8>>,
}

impl PcrBanks {
    fn reset() -> Self {
        Self {
            sha1: vec![vec![0; HashAlgorithm::Sha1.digest_len()]; PCR_COUNT as usize],
            sha256: vec![vec![0; HashAlgorithm::Sha256.digest_len()]; PCR_COUNT as usize],
        }
    }

    pub fn bank(&self, algorithm: HashAlgorithm) -> &[Vec<u8>] {
        match algorithm {
            HashAlgorithm::Sha1 => &self.sha1,
            HashAlgorithm::Sha256 => &self.sha256,
        }
    }

    pub fn bank_mut(&mut self, algorithm: HashAlgorithm) -> &mut [Vec<u8>] {
        match algorithm {
            HashAlgorithm::Sha1 => &mut self.sha1,
            HashAlgorithm::Sha256 => &mut self.sha256,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct PersistentState {
    pub owner_seed: [u8; 32],
    pub pcrs: PcrBanks,
    /// NV slot contents by index.
    pub nv: BTreeMap<u32, Vec<u8>>,
}

impl PersistentState {
    pub fn fresh(rng: &mut impl RngCore) -> Self {
        let mut owner_seed = [0u8; 32];
        rng.fill_bytes(&mut owner_seed);
        info!("Created new module state");
        Self {
            owner_seed,
            pcrs: PcrBanks::reset(),
            nv: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }

    pub fn decode(image: &[u8]) -> io::Result<Self> {
        let state: Self = postcard::from_bytes(image)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let banks_ok = [HashAlgorithm::Sha1, HashAlgorithm::Sha256]
            .iter()
            .all(|alg| {
                let bank = state.pcrs.bank(*alg);
                bank.len() == PCR_COUNT as usize
                    && bank.iter().all(|pcr| pcr.len() == alg.digest_len())
            });
        if !banks_ok {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt PCR banks in module state",
            ));
        }
        Ok(state)
    }
}

impl Drop for PersistentState {
    fn drop(&mut self) {
        self.owner_seed.zeroize();
    }
}
