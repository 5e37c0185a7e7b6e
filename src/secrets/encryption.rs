//! AES-256-GCM sealing for secret values.
//!
//! Each value is sealed with a fresh random nonce; the stored form is
//! `base64(nonce):base64(ciphertext)` so a single column carries everything
//! needed to unseal.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Master key size in bytes (256 bits).
const KEY_SIZE: usize = 32;

/// GCM standard nonce size in bytes (96 bits).
const NONCE_SIZE: usize = 12;

/// Decodes and length-checks a base64-encoded master key.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("failed to decode base64 master key")?;
    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "master key must be {} bytes (256 bits), got {}",
            KEY_SIZE,
            key_bytes.len()
        ));
    }
    Ok(key_bytes)
}

/// Generates a fresh random master key, base64-encoded. Utility for initial
/// deployment; the key itself lives in the environment, never on disk.
pub fn generate_key() -> String {
    use rand::RngCore;
    let mut key = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    BASE64.encode(key)
}

/// Seals a plaintext value: `base64(nonce):base64(ciphertext)`.
pub fn seal(plaintext: &str, key: &[u8]) -> Result<String> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("failed to create cipher: {e}"))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("encryption failed: {e}"))?;
    Ok(format!("{}:{}", BASE64.encode(nonce), BASE64.encode(ciphertext)))
}

/// Unseals a value produced by [`seal`]. Fails on a wrong key, corrupted
/// data, or tampering (GCM is authenticated).
pub fn unseal(sealed: &str, key: &[u8]) -> Result<String> {
    let (nonce_b64, ciphertext_b64) = sealed
        .split_once(':')
        .ok_or_else(|| anyhow!("malformed sealed value: missing nonce separator"))?;
    let nonce_bytes = BASE64.decode(nonce_b64).context("failed to decode nonce")?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!(
            "invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        ));
    }
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .context("failed to decode ciphertext")?;

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("failed to create cipher: {e}"))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| anyhow!("decryption failed (wrong key or corrupted data): {e}"))?;
    String::from_utf8(plaintext).context("decrypted value is not valid UTF-8")
}
