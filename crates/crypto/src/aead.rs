//! AEAD: AES-256-GCM.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;
use crate::keys::KEY_LEN;

/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AEAD authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Generate a random 12-byte nonce. Used during encryption only.
pub fn nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut n = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut n).map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(n)
}

/// Encrypt. Returns ciphertext with the tag appended.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Decrypt)
}

/// Encrypt, returning the ciphertext body and the detached 16-byte tag.
pub fn seal_detached(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN]), CryptoError> {
    let mut ct = seal(key, nonce, plaintext)?;
    let split = ct.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&ct[split..]);
    ct.truncate(split);
    Ok((ct, tag))
}

/// Decrypt a combined ciphertext (tag appended). `Decrypt` on tag mismatch.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ct_and_tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ct_and_tag)
        .map_err(|_| CryptoError::Decrypt)
}

/// Decrypt a ciphertext body with a detached tag.
pub fn open_detached(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    open(key, nonce, &combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [3u8; KEY_LEN];
        let n = nonce().unwrap();
        let ct = seal(&key, &n, b"hello").unwrap();
        assert_eq!(open(&key, &n, &ct).unwrap(), b"hello");
    }

    #[test]
    fn detached_matches_combined() {
        let key = [5u8; KEY_LEN];
        let n = nonce().unwrap();
        let (ct, tag) = seal_detached(&key, &n, b"payload").unwrap();
        assert_eq!(ct.len(), b"payload".len());
        assert_eq!(open_detached(&key, &n, &ct, &tag).unwrap(), b"payload");
    }

    #[test]
    fn tamper_fails() {
        let key = [8u8; KEY_LEN];
        let n = nonce().unwrap();
        let mut ct = seal(&key, &n, b"secret").unwrap();
        ct[0] ^= 0xA5;
        assert!(matches!(open(&key, &n, &ct), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn wrong_key_fails() {
        let n = nonce().unwrap();
        let ct = seal(&[1u8; KEY_LEN], &n, b"secret").unwrap();
        assert!(open(&[2u8; KEY_LEN], &n, &ct).is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_any_plaintext(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = [0x42u8; KEY_LEN];
            let n = nonce().unwrap();
            let (ct, tag) = seal_detached(&key, &n, &data).unwrap();
            prop_assert_eq!(open_detached(&key, &n, &ct, &tag).unwrap(), data);
        }
    }
}
