//! AES-256-GCM sealing for credential payloads.
//!
//! Each payload is encrypted with a fresh random IV. The master key is a
//! base64-encoded 32-byte secret supplied through the environment and held
//! in memory only.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the IV in bytes (96 bits, standard for GCM)
const IV_SIZE: usize = 12;

/// An encrypted payload plus the IV used to produce it, both base64-encoded
/// for storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: String,
    pub iv: String,
}

/// Decodes and validates the base64 master key (must be exactly 32 bytes).
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Encrypts a plaintext payload under the master key with a random IV.
///
/// The IV is generated fresh for every call and must be stored alongside the
/// ciphertext; it is required for decryption and never reused.
pub fn seal(plaintext: &str, key: &[u8]) -> Result<Sealed> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let iv_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(&iv_bytes, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(Sealed {
        ciphertext: BASE64.encode(&ciphertext_bytes),
        iv: BASE64.encode(iv_bytes),
    })
}

/// Decrypts a sealed payload. Fails if the key or IV is wrong, or if the
/// ciphertext was tampered with (GCM is authenticated).
pub fn open(sealed: &Sealed, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let ciphertext_bytes = BASE64
        .decode(&sealed.ciphertext)
        .context("Failed to decode ciphertext")?;
    let iv_bytes = BASE64.decode(&sealed.iv).context("Failed to decode IV")?;

    if iv_bytes.len() != IV_SIZE {
        return Err(anyhow!(
            "Invalid IV size: expected {}, got {}",
            IV_SIZE,
            iv_bytes.len()
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let plaintext_bytes = cipher
        .decrypt(Nonce::from_slice(&iv_bytes), ciphertext_bytes.as_ref())
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext_bytes).context("Decrypted data is not valid UTF-8")
}
