//! Primitives of the software module.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::api::Status;
use crate::policy::HashAlgorithm;

pub const NONCE_LEN: usize = 12;

/// Hash of the concatenation of `parts`.
pub fn hash(algorithm: HashAlgorithm, parts: &[&[u8]]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha1 => {
            let mut hasher = Sha1::new();
            parts.iter().for_each(|part| hasher.update(part));
            hasher.finalize().to_vec()
        }
        HashAlgorithm::Sha256 => sha256(parts),
    }
}

pub fn sha256(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    parts.iter().for_each(|part| hasher.update(part));
    hasher.finalize().to_vec()
}

/// HMAC-SHA256 keyed by `seed` over `label || 0x00 || context`.
pub fn derive_key(seed: &[u8], label: &[u8], context: &[u8]) -> Result<Zeroizing<[u8; 32]>, Status> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(seed).map_err(|_| Status::Failure)?;
    mac.update(label);
    mac.update(&[0]);
    mac.update(context);

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

/// `nonce || ciphertext || tag`, with `aad` authenticated alongside.
pub fn seal(key: &[u8; 32], nonce: [u8; NONCE_LEN], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Status> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| Status::Failure)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Inverse of [`seal`]; any tampering, or the wrong key, is an integrity failure.
pub fn open(key: &[u8; 32], aad: &[u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, Status> {
    if sealed.len() < NONCE_LEN {
        return Err(Status::Integrity);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| Status::Integrity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_abc() {
        let digest = sha256(&[&b"a"[..], &b"bc"[..]]);
        assert_eq!(&digest[..4], &[0xba, 0x78, 0x16, 0xbf]);
        assert_eq!(&digest[28..], &[0xf2, 0x00, 0x15, 0xad]);
        assert_eq!(hash(HashAlgorithm::Sha1, &[&b"abc"[..]])[..4], [0xa9, 0x99, 0x3e, 0x36]);
    }

    #[test]
    fn tampering_is_detected() {
        let key = [7u8; 32];
        let mut sealed = seal(&key, [1; NONCE_LEN], b"public", b"secret").unwrap();
        assert_eq!(&open(&key, b"public", &sealed).unwrap()[..], b"secret");

        assert_eq!(open(&key, b"other", &sealed), Err(Status::Integrity));
        assert_eq!(open(&[8u8; 32], b"public", &sealed), Err(Status::Integrity));
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert_eq!(open(&key, b"public", &sealed), Err(Status::Integrity));
        assert_eq!(open(&key, b"public", &sealed[..4]), Err(Status::Integrity));
    }

    #[test]
    fn derived_keys_depend_on_every_input() {
        let key = derive_key(&[1; 32], b"primary", b"template").unwrap();
        assert_eq!(key, derive_key(&[1; 32], b"primary", b"template").unwrap());
        assert_ne!(key, derive_key(&[2; 32], b"primary", b"template").unwrap());
        assert_ne!(key, derive_key(&[1; 32], b"primary", b"other").unwrap());
    }
}
