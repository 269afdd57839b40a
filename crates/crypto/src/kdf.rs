//! Password KDF (Argon2id) and HKDF-SHA256 sub-key derivation.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;
use crate::keys::{MasterKey, KEY_LEN};

/// Argon2id salt length in bytes.
pub const SALT_LEN: usize = 16;

// m=64 MiB, t=3, p=1 per the box key hierarchy.
const ARGON2_M_KIB: u32 = 64 * 1024;
const ARGON2_T: u32 = 3;
const ARGON2_P: u32 = 1;

/// Derive the 32-byte master key from a password and a per-box salt.
pub fn derive_master_key(password: &[u8], salt: &[u8; SALT_LEN]) -> Result<MasterKey, CryptoError> {
    let params = Params::new(ARGON2_M_KIB, ARGON2_T, ARGON2_P, Some(KEY_LEN))
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_LEN];
    argon
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(MasterKey::from_bytes(out))
}

/// Fresh random KDF salt.
pub fn random_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(salt)
}

/// HKDF-SHA256 expand of `ikm` into a 32-byte sub-key under `info`.
pub fn subkey(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut out = [0u8; KEY_LEN];
    hk.expand(info, &mut out).map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{INFO_DEK_WRAP, INFO_WIRE_V1};

    #[test]
    fn same_password_same_salt_same_key() {
        let salt = [7u8; SALT_LEN];
        let a = derive_master_key(b"p@ss", &salt).unwrap();
        let b = derive_master_key(b"p@ss", &salt).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_salt_different_key() {
        let a = derive_master_key(b"p@ss", &[1u8; SALT_LEN]).unwrap();
        let b = derive_master_key(b"p@ss", &[2u8; SALT_LEN]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn info_strings_separate_subkeys() {
        let ikm = [9u8; 32];
        let wrap = subkey(&ikm, None, INFO_DEK_WRAP).unwrap();
        let wire = subkey(&ikm, None, INFO_WIRE_V1).unwrap();
        assert_ne!(wrap, wire);
    }
}
