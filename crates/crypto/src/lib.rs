//! Crypto primitives for ShadowBox.
//!
//! One Argon2id-derived master key per (password, box salt); HKDF-SHA256
//! sub-keys for DEK wrapping and wire authentication; AES-256-GCM for every
//! ciphertext. Nonces are always fresh OS entropy, never derived, so a key
//! never sees a repeated nonce.

#![deny(unsafe_code)]

mod aead;
mod error;
mod kdf;
mod keys;

pub use aead::{nonce, open, open_detached, seal, seal_detached, NONCE_LEN, TAG_LEN};
pub use error::CryptoError;
pub use kdf::{derive_master_key, random_salt, subkey, SALT_LEN};
pub use keys::{generate_dek, unwrap_dek, wire_key, wrap_dek, Dek, MasterKey, KEY_LEN};

/// HKDF info string for the DEK wrap key.
pub const INFO_DEK_WRAP: &[u8] = b"dek-wrap";
/// HKDF info string for the session wire key.
pub const INFO_WIRE_V1: &[u8] = b"wire-v1";
