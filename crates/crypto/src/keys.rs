//! Key material types and the DEK wrap/unwrap scheme.
//!
//! `wrapped_dek = nonce(12) || AES-256-GCM(wrap_key, nonce, dek)` where
//! `wrap_key = HKDF(master, info="dek-wrap")`.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::{self, NONCE_LEN};
use crate::error::CryptoError;
use crate::kdf::subkey;
use crate::{INFO_DEK_WRAP, INFO_WIRE_V1};

/// Symmetric key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Password-derived master key. Zeroized on drop; never persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Wrap raw bytes (the KDF output).
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Per-box data-encryption key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek([u8; KEY_LEN]);

impl std::fmt::Debug for Dek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dek(REDACTED)")
    }
}

impl Dek {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Fresh random 32-byte DEK for a new box.
pub fn generate_dek() -> Result<Dek, CryptoError> {
    let mut bytes = [0u8; KEY_LEN];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok(Dek(bytes))
}

/// Wrap a DEK under the master key. Output layout: `nonce || ct+tag`.
pub fn wrap_dek(master: &MasterKey, dek: &Dek) -> Result<Vec<u8>, CryptoError> {
    let mut wrap_key = subkey(master.as_bytes(), None, INFO_DEK_WRAP)?;
    let nonce = aead::nonce()?;
    let ct = aead::seal(&wrap_key, &nonce, dek.as_bytes());
    wrap_key.zeroize();
    let ct = ct?;
    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Unwrap a DEK. `Decrypt` means wrong password or a tampered row.
pub fn unwrap_dek(master: &MasterKey, wrapped: &[u8]) -> Result<Dek, CryptoError> {
    if wrapped.len() <= NONCE_LEN {
        return Err(CryptoError::Decrypt);
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&wrapped[..NONCE_LEN]);
    let mut wrap_key = subkey(master.as_bytes(), None, INFO_DEK_WRAP)?;
    let pt = aead::open(&wrap_key, &nonce, &wrapped[NONCE_LEN..]);
    wrap_key.zeroize();
    let mut pt = pt?;
    if pt.len() != KEY_LEN {
        pt.zeroize();
        return Err(CryptoError::Decrypt);
    }
    let mut bytes = [0u8; KEY_LEN];
    bytes.copy_from_slice(&pt);
    pt.zeroize();
    Ok(Dek(bytes))
}

/// Session wire key: `HKDF(code-bytes, salt = client_nonce || server_nonce,
/// info = "wire-v1")`. Authenticates a peer session; never persisted.
pub fn wire_key(
    code: &str,
    client_nonce: &[u8; 16],
    server_nonce: &[u8; 16],
) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut salt = [0u8; 32];
    salt[..16].copy_from_slice(client_nonce);
    salt[16..].copy_from_slice(server_nonce);
    subkey(code.as_bytes(), Some(&salt), INFO_WIRE_V1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::derive_master_key;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let master = derive_master_key(b"p@ss", &[4u8; 16]).unwrap();
        let dek = generate_dek().unwrap();
        let wrapped = wrap_dek(&master, &dek).unwrap();
        let back = unwrap_dek(&master, &wrapped).unwrap();
        assert_eq!(back.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn wrong_password_fails_unwrap() {
        let master = derive_master_key(b"p@ss", &[4u8; 16]).unwrap();
        let other = derive_master_key(b"wrong", &[4u8; 16]).unwrap();
        let dek = generate_dek().unwrap();
        let wrapped = wrap_dek(&master, &dek).unwrap();
        assert!(matches!(unwrap_dek(&other, &wrapped), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn truncated_wrapped_dek_rejected() {
        let master = derive_master_key(b"p@ss", &[4u8; 16]).unwrap();
        assert!(unwrap_dek(&master, &[0u8; 8]).is_err());
    }

    #[test]
    fn wire_key_depends_on_both_nonces() {
        let a = wire_key("QWER", &[1u8; 16], &[2u8; 16]).unwrap();
        let b = wire_key("QWER", &[1u8; 16], &[3u8; 16]).unwrap();
        let c = wire_key("ZZZZ", &[1u8; 16], &[2u8; 16]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
