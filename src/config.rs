//! Settings of one invocation, built once by the command line.

use std::path::PathBuf;

use crate::nv::NvIndex;
use crate::policy::{PcrSelection, SealPolicy};
use crate::secret::Password;

pub const DEFAULT_STATE_FILE: &str = "tpm-totp.state";

/// The module requests go to.
#[derive(Clone, Debug, PartialEq)]
pub enum Backend {
    /// A TPM 2.0, reached through `tcti` or the TCTI the environment names.
    Tpm { tcti: Option<String> },
    /// The in-process software module, for tests and development.
    Simulator { state_file: PathBuf },
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Tpm { tcti: None }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub nv_index: NvIndex,
    /// Registers a new key is bound to.
    pub pcrs: PcrSelection,
    /// Adds a password branch to new keys; required by reseal and recover.
    pub password: Option<Password>,
    /// Also print the time the code was computed for.
    pub show_time: bool,
    pub verbose: bool,
    pub backend: Backend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nv_index: NvIndex::DEFAULT,
            pcrs: PcrSelection::default(),
            password: None,
            show_time: false,
            verbose: false,
            backend: Backend::default(),
        }
    }
}

impl Config {
    /// Platform-state branch over `pcrs`, plus a password branch if one is set.
    pub fn seal_policy(&self) -> SealPolicy {
        let policy = SealPolicy::platform(self.pcrs);
        match &self.password {
            Some(password) => policy.with_password(password.clone()),
            None => policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AuthPolicy;

    #[test]
    fn password_adds_a_branch() {
        let mut config = Config::default();
        assert_eq!(config.seal_policy().branches().len(), 1);

        config.password = Some(Password::from("x"));
        let policy = config.seal_policy();
        assert_eq!(policy.branches().len(), 2);
        assert_eq!(policy.branches()[0], AuthPolicy::PlatformState(PcrSelection::default()));
    }

    #[test]
    fn hardware_is_the_default_backend() {
        assert_eq!(Config::default().backend, Backend::Tpm { tcti: None });
    }
}
