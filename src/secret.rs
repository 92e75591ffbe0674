//! Secret material that only ever lives transiently in process memory.

use core::fmt;

use zeroize::Zeroizing;

/// Length of a freshly generated TOTP secret (the HMAC-SHA1 block size
/// recommendation of RFC 4226).
pub const SECRET_LEN: usize = 20;

/// A TOTP secret in plaintext. Wiped on drop, redacted in `Debug`.
#[derive(Clone, PartialEq)]
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    pub fn new(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for Secret {
    fn from(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {}])", self.0.len())
    }
}

/// The recovery password of a sealed key.
#[derive(Clone, PartialEq)]
pub struct Password(Zeroizing<Vec<u8>>);

impl Password {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Password {
    fn from(password: &str) -> Self {
        Self(Zeroizing::new(password.as_bytes().to_vec()))
    }
}

impl From<&[u8]> for Password {
    fn from(password: &[u8]) -> Self {
        Self(Zeroizing::new(password.to_vec()))
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_shows_material() {
        let secret = Secret::from(&b"12345678901234567890"[..]);
        let password = Password::from("hunter2");

        assert_eq!(format!("{:?}", secret), "Secret([REDACTED; 20])");
        assert!(!format!("{:?}", password).contains("hunter2"));
    }
}
