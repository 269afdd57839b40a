//! Crypto failure modes. Callers map these into the core taxonomy: a
//! `Decrypt` during DEK unwrap is an auth failure, the same error on a blob
//! read is an integrity failure.

use thiserror::Error;

/// Errors from the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Argon2id rejected its parameters or ran out of memory.
    #[error("kdf failure: {0}")]
    Kdf(String),
    /// AEAD tag mismatch: wrong key or tampered ciphertext.
    #[error("decrypt failure: bad tag")]
    Decrypt,
    /// The OS RNG failed to produce bytes.
    #[error("entropy failure: {0}")]
    Entropy(String),
}
