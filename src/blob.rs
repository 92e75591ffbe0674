//! Portable encoding of a sealed key.
//!
//! ```text
//! u16  format version
//! u16  key template version
//! u16  length | public area
//! u16  length | private area
//! u8   branch count
//!      per branch: u8 tag (1 = platform state, 2 = password)
//!                  tag 1 only: u16 bank algorithm | u32 register mask
//!                  u16 length | branch digest
//! ```
//!
//! All integers are big-endian. Every length is checked against what is
//! left before it is consumed, and the input must be consumed exactly.

use crate::error::{DecodeError, EncodeError};
use crate::policy::{BranchKind, HashAlgorithm, PcrSelection, PolicyBranch, PolicyDescriptor};

/// Format version written by [`SealedKeyBlob::encode`].
pub const BLOB_VERSION: u16 = 1;

const TAG_PLATFORM_STATE: u8 = 1;
const TAG_PASSWORD: u8 = 2;

/// A sealed secret, as persisted.
///
/// `public` may be disclosed; `private` is ciphertext only the sealing
/// module can open.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SealedKeyBlob {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
    pub policy: PolicyDescriptor,
    pub key_template_version: u16,
}

impl SealedKeyBlob {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Writer::default();
        out.u16(BLOB_VERSION);
        out.u16(self.key_template_version);
        out.sized(&self.public)?;
        out.sized(&self.private)?;

        let count = self.policy.branches.len();
        if count == 0 {
            return Err(EncodeError::NoPolicyBranch);
        }
        if count > u8::MAX as usize {
            return Err(EncodeError::Oversized(count));
        }
        out.u8(count as u8);
        for branch in &self.policy.branches {
            match branch.kind {
                BranchKind::PlatformState(selection) => {
                    out.u8(TAG_PLATFORM_STATE);
                    out.u16(selection.bank().id());
                    out.u32(selection.mask());
                }
                BranchKind::Password => out.u8(TAG_PASSWORD),
            }
            out.sized(&branch.digest)?;
        }
        Ok(out.0)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut input = Reader(bytes);
        let version = input.u16()?;
        if version != BLOB_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let key_template_version = input.u16()?;
        let public = input.sized()?.to_vec();
        let private = input.sized()?.to_vec();

        let count = input.u8()?;
        if count == 0 {
            return Err(DecodeError::NoPolicyBranch);
        }
        let mut branches = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let kind = match input.u8()? {
                TAG_PLATFORM_STATE => {
                    let id = input.u16()?;
                    let bank =
                        HashAlgorithm::from_id(id).ok_or(DecodeError::UnknownHashAlgorithm(id))?;
                    BranchKind::PlatformState(PcrSelection::from_mask(bank, input.u32()?)?)
                }
                TAG_PASSWORD => BranchKind::Password,
                tag => return Err(DecodeError::UnknownPolicyTag(tag)),
            };
            let digest = input.sized()?.to_vec();
            branches.push(PolicyBranch { kind, digest });
        }

        if !input.0.is_empty() {
            return Err(DecodeError::TrailingBytes(input.0.len()));
        }

        Ok(Self {
            public,
            private,
            policy: PolicyDescriptor { branches },
            key_template_version,
        })
    }
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn sized(&mut self, field: &[u8]) -> Result<(), EncodeError> {
        if field.len() > u16::MAX as usize {
            return Err(EncodeError::Oversized(field.len()));
        }
        self.u16(field.len() as u16);
        self.0.extend_from_slice(field);
        Ok(())
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.0.len() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.0.len(),
            });
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn sized(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> SealedKeyBlob {
        SealedKeyBlob {
            public: vec![0xaa; 48],
            private: vec![0xbb; 90],
            policy: PolicyDescriptor {
                branches: vec![
                    PolicyBranch {
                        kind: BranchKind::PlatformState(PcrSelection::default()),
                        digest: vec![1; 32],
                    },
                    PolicyBranch {
                        kind: BranchKind::Password,
                        digest: vec![2; 32],
                    },
                ],
            },
            key_template_version: 1,
        }
    }

    #[test]
    fn decodes_what_it_encodes() {
        let blob = blob();
        let bytes = blob.encode().unwrap();
        assert_eq!(SealedKeyBlob::decode(&bytes).unwrap(), blob);

        let mut single = blob;
        single.policy.branches.truncate(1);
        let bytes = single.encode().unwrap();
        assert_eq!(SealedKeyBlob::decode(&bytes).unwrap(), single);
    }

    #[test]
    fn layout_starts_with_versions_and_lengths() {
        let bytes = blob().encode().unwrap();
        assert_eq!(&bytes[..6], &[0, 1, 0, 1, 0, 48]);
        assert_eq!(bytes.len(), 2 + 2 + (2 + 48) + (2 + 90) + 1 + (1 + 6 + 2 + 32) + (1 + 2 + 32));
    }

    #[test]
    fn every_truncation_fails() {
        let bytes = blob().encode().unwrap();
        for len in 0..bytes.len() {
            assert!(
                matches!(
                    SealedKeyBlob::decode(&bytes[..len]),
                    Err(DecodeError::Truncated { .. })
                ),
                "prefix of {} bytes decoded",
                len
            );
        }
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut bytes = blob().encode().unwrap();
        bytes.push(0);
        assert_eq!(SealedKeyBlob::decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn inflated_length_prefix_fails() {
        let mut bytes = blob().encode().unwrap();
        // public area claims one byte more than it has
        bytes[5] = 49;
        assert!(SealedKeyBlob::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_version_and_tag_are_explicit() {
        let mut bytes = blob().encode().unwrap();
        bytes[1] = 2;
        assert_eq!(SealedKeyBlob::decode(&bytes), Err(DecodeError::UnsupportedVersion(2)));

        let mut bytes = blob().encode().unwrap();
        let tag = 2 + 2 + 50 + 92 + 1;
        assert_eq!(bytes[tag], TAG_PLATFORM_STATE);
        bytes[tag] = 9;
        assert_eq!(SealedKeyBlob::decode(&bytes), Err(DecodeError::UnknownPolicyTag(9)));
    }

    #[test]
    fn blob_without_branches_is_refused() {
        let mut empty = blob();
        empty.policy.branches.clear();
        assert_eq!(empty.encode(), Err(EncodeError::NoPolicyBranch));
    }

    #[test]
    fn oversized_area_is_an_encode_error() {
        let mut huge = blob();
        huge.private = vec![0; u16::MAX as usize + 1];
        assert_eq!(huge.encode(), Err(EncodeError::Oversized(u16::MAX as usize + 1)));
    }
}
