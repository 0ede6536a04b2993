// =====================================================
// CRYPTO MODULE
// Key management and credential encryption/decryption
// =====================================================

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use std::fs;
use std::path::Path;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Loads the base64 key stored at `path`, generating and persisting a new one
/// on first start.
pub fn load_or_create_key(path: &Path) -> Result<Vec<u8>, String> {
    if path.exists() {
        let encoded = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read key file {}: {}", path.display(), e))?;
        let key = BASE64
            .decode(encoded.trim())
            .map_err(|e| format!("Failed to decode key file: {}", e))?;
        if key.len() != KEY_LEN {
            return Err(format!(
                "Key file {} holds {} bytes, expected {}",
                path.display(),
                key.len(),
                KEY_LEN
            ));
        }
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create key directory: {}", e))?;
        }
    }

    log::info!("Generating new credential encryption key at {}", path.display());
    let key = generate_new_key();
    fs::write(path, BASE64.encode(&key))
        .map_err(|e| format!("Failed to save key to file: {}", e))?;
    Ok(key)
}

pub fn generate_new_key() -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    rand::thread_rng().fill(&mut key[..]);
    key
}

pub fn encrypt_secret_with_key(secret: &str, key: &[u8]) -> Result<String, String> {
    if secret.is_empty() {
        return Ok(String::new());
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| format!("Failed to create cipher: {}", e))?;

    let mut rng = rand::thread_rng();
    let nonce_bytes: [u8; NONCE_LEN] = rng.gen();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, secret.as_bytes())
        .map_err(|e| format!("Encryption failed: {}", e))?;

    let mut combined = nonce_bytes.to_vec();
    combined.extend(ciphertext);

    Ok(BASE64.encode(combined))
}

pub fn decrypt_secret_with_key(encrypted: &str, key: &[u8]) -> Result<String, String> {
    if encrypted.is_empty() {
        return Ok(String::new());
    }

    let combined = BASE64
        .decode(encrypted)
        .map_err(|e| format!("Base64 decode failed: {}", e))?;

    if combined.len() < NONCE_LEN {
        return Err("Invalid encrypted data".to_string());
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| format!("Failed to create cipher: {}", e))?;

    let nonce = Nonce::from_slice(&combined[..NONCE_LEN]);
    let ciphertext = &combined[NONCE_LEN..];

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| format!("Decryption failed: {}", e))?;

    String::from_utf8(plaintext).map_err(|e| format!("UTF-8 conversion failed: {}", e))
}
