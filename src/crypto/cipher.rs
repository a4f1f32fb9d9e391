//! AES-256-GCM encryption of stored string values.
//!
//! Storage values are strings, so the wire form here is a string too:
//! base64(nonce || ciphertext || auth tag), with a fresh random 12-byte
//! nonce per encryption. Keys come from the passcode KDF.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::crypto::{CryptoError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypt a string value under the given key.
///
/// Returns base64(nonce || ciphertext). The GCM auth tag is included in
/// the ciphertext produced by the cipher.
pub fn encrypt_string(key: &[u8; 32], plaintext: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(out))
}

/// Decrypt a value produced by [`encrypt_string`].
///
/// Fails if the key is wrong or the data has been modified; GCM
/// authentication makes the two indistinguishable.
pub fn decrypt_to_string(key: &[u8; 32], encoded: &str) -> Result<String> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| CryptoError::MalformedCiphertext(format!("bad base64: {}", e)))?;

    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::MalformedCiphertext(format!(
            "too short: {} bytes",
            raw.len()
        )));
    }

    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new(key.into());
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::MalformedCiphertext(format!("not UTF-8: {}", e)))
}
