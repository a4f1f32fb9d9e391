//! Argon2id key derivation for the local passcode.
//!
//! A candidate passcode plus the stored public parameters (salt, costs,
//! version) deterministically produce 64 bytes of key material, split into
//! a master key (storage encryption) and a verifier (compared against the
//! hash persisted alongside the parameters). The parameters are safe to
//! store in plaintext; only the verifier hash ever leaves this module, and
//! the master key is zeroized on drop.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{CryptoError, Result};

/// Version tag written into freshly generated parameter records.
pub const CURRENT_PARAMS_VERSION: &str = "002";

/// Records written before versioning was introduced carry no tag.
fn legacy_version() -> String {
    "001".to_string()
}

/// Public parameters needed to re-derive keys from a passcode.
///
/// Persisted unencrypted; nothing here is secret. `hash` is the base64
/// verifier a successful derivation must reproduce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    /// Identifier minted when the passcode was set
    pub identifier: Uuid,

    /// Salt for key derivation (16 bytes)
    pub salt: [u8; 16],

    /// Argon2 memory cost in KiB
    pub mem_cost: u32,

    /// Argon2 time cost (iterations)
    pub time_cost: u32,

    /// Argon2 parallelism (lanes)
    pub parallelism: u32,

    /// Protocol version of the record
    #[serde(default = "legacy_version")]
    pub version: String,

    /// Base64 verifier hash, absent only on a record that was never committed
    #[serde(default)]
    pub hash: Option<String>,
}

/// Key material derived from a passcode. Held in memory only while the
/// application is unlocked; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    master: [u8; 32],
    verifier: [u8; 32],
}

impl DerivedKeys {
    /// The key local storage values are encrypted under
    pub fn master_key(&self) -> &[u8; 32] {
        &self.master
    }

    /// Base64 encoding of the verifier half, for persisting in `AuthParams`
    pub fn verifier_b64(&self) -> String {
        BASE64.encode(self.verifier)
    }

    /// Constant-time comparison against a stored base64 verifier hash
    pub fn matches(&self, stored_hash: &str) -> bool {
        let Ok(stored) = BASE64.decode(stored_hash) else {
            return false;
        };
        if stored.len() != self.verifier.len() {
            return false;
        }
        self.verifier.as_slice().ct_eq(&stored).into()
    }
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKeys { .. }")
    }
}

/// Derives and generates passcode key material.
///
/// The seam exists so the controller never depends on a concrete KDF;
/// tests inject cheap parameters through the same interface.
pub trait PasscodeVerifier: Send + Sync {
    /// Re-derive keys from a candidate passcode and stored parameters
    fn derive_keys(&self, candidate: &str, params: &AuthParams) -> Result<DerivedKeys>;

    /// Generate fresh keys and parameters for a new passcode
    fn generate_keys_and_params(
        &self,
        identifier: Uuid,
        candidate: &str,
    ) -> Result<(DerivedKeys, AuthParams)>;
}

/// Argon2id-backed verifier
#[derive(Debug, Clone)]
pub struct Argon2Verifier {
    mem_cost: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for Argon2Verifier {
    fn default() -> Self {
        // Interactive-login tier. A local passcode is entered far more often
        // than an account password, so costs sit below a vault-grade KDF.
        Self {
            mem_cost: 65_536,
            time_cost: 3,
            parallelism: 1,
        }
    }
}

impl Argon2Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom cost parameters. Tests use small values to stay fast.
    pub fn with_costs(mem_cost: u32, time_cost: u32, parallelism: u32) -> Self {
        Self {
            mem_cost,
            time_cost,
            parallelism,
        }
    }

    fn derive(&self, candidate: &str, params: &AuthParams) -> Result<DerivedKeys> {
        let argon_params = Params::new(
            params.mem_cost,
            params.time_cost,
            params.parallelism,
            Some(64),
        )
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

        let mut output = [0u8; 64];
        argon2
            .hash_password_into(candidate.as_bytes(), &params.salt, &mut output)
            .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

        let mut master = [0u8; 32];
        let mut verifier = [0u8; 32];
        master.copy_from_slice(&output[..32]);
        verifier.copy_from_slice(&output[32..]);
        output.zeroize();

        Ok(DerivedKeys { master, verifier })
    }
}

impl PasscodeVerifier for Argon2Verifier {
    fn derive_keys(&self, candidate: &str, params: &AuthParams) -> Result<DerivedKeys> {
        self.derive(candidate, params)
    }

    fn generate_keys_and_params(
        &self,
        identifier: Uuid,
        candidate: &str,
    ) -> Result<(DerivedKeys, AuthParams)> {
        let params = AuthParams {
            identifier,
            salt: rand::random(),
            mem_cost: self.mem_cost,
            time_cost: self.time_cost,
            parallelism: self.parallelism,
            version: CURRENT_PARAMS_VERSION.to_string(),
            hash: None,
        };

        let keys = self.derive(candidate, &params)?;
        Ok((keys, params))
    }
}
