//! Cryptographic primitives for the passcode lock.
//!
//! This module provides:
//! - Argon2id key derivation from a local passcode
//! - AES-256-GCM encryption of stored values
//! - Zeroization of key material on drop

pub mod cipher;
pub mod kdf;

pub use cipher::{decrypt_to_string, encrypt_string};
pub use kdf::{Argon2Verifier, AuthParams, DerivedKeys, PasscodeVerifier};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed - wrong key or tampered data")]
    DecryptionFailed,

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
