//! Passcode lock layer for the StackNotes client.
//!
//! This library owns the local lock state of the application:
//! - Passcode key derivation and verification (Argon2id)
//! - Encrypted local key/value storage with per-item storage modes
//! - The visibility-driven auto-lock state machine and idle timer
//!
//! It deliberately does not own account authentication, the sync protocol,
//! or any UI lifecycle. Those are injected at the seams (`KeyStore`,
//! `PasscodeVerifier`, `SyncTrigger`) by the hosting shell.

pub mod autolock;
pub mod crypto;
pub mod passcode;
pub mod storage;
pub mod sync;

pub use autolock::{AutoLockInterval, IntervalOption, LockDeadline};
pub use crypto::{Argon2Verifier, AuthParams, DerivedKeys, PasscodeVerifier};
pub use passcode::{LockState, PasscodeManager};
pub use storage::{KeyStore, LocalKeyStore, StorageMode};
pub use sync::{NoopSync, SyncTrigger};

use thiserror::Error;

/// Result type for lock-layer operations
pub type Result<T> = std::result::Result<T, LockError>;

/// General error type for the lock layer
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage keys are not set")]
    MissingStorageKeys,

    #[error("Malformed record under '{key}': {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
