use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::{AgentError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub fn load_or_create_key(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        let data = fs::read(path)?;
        if data.len() != KEY_LEN {
            return Err(AgentError::Crypto("invalid key length".to_string()));
        }
        return Ok(data);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    fs::write(path, &key)?;
    Ok(key)
}

/// Seals short secrets (tokens) for the settings table.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    pub fn new(key_bytes: &[u8]) -> Result<Self> {
        if key_bytes.len() != KEY_LEN {
            return Err(AgentError::Crypto("invalid key length".to_string()));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| AgentError::Crypto("encryption failed".to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(output))
    }

    pub fn open(&self, payload: &str) -> Result<String> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|_| AgentError::Crypto("invalid base64 payload".to_string()))?;
        if decoded.len() <= NONCE_LEN {
            return Err(AgentError::Crypto("payload too small".to_string()));
        }

        let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| AgentError::Crypto("decryption failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|_| AgentError::Crypto("invalid token data".to_string()))
    }
}

pub fn md5_file_hex(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut file = fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0_u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
