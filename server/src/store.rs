//! Encrypted key/JSON store.
//!
//! On disk the store is a JSON object mapping each name to
//! `hex(nonce || AES-256-GCM ciphertext)`. The key is the SHA-256 digest of
//! the configured secret. Every change is written to a temporary file and
//! renamed over the previous one before the call returns.

use crate::error::StoreError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use log::{debug, info};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const NONCE_SIZE: usize = 12;

pub struct Store {
    path: Option<PathBuf>,
    key: [u8; 32],
    entries: Mutex<BTreeMap<String, String>>,
}

impl Store {
    /// Opens (or creates on first write) the store at `path`.
    pub fn open(path: &Path, secret: &str) -> Result<Self, StoreError> {
        let key = derive_key(secret);
        let mut entries = BTreeMap::new();

        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let encrypted: BTreeMap<String, String> = serde_json::from_str(&text)?;
            for (name, blob) in encrypted {
                let plaintext = decrypt(&key, &hex::decode(&blob)?)
                    .ok_or_else(|| StoreError::Decrypt(name.clone()))?;
                let payload =
                    String::from_utf8(plaintext).map_err(|_| StoreError::Decrypt(name.clone()))?;
                entries.insert(name, payload);
            }
            info!("Loaded {} entries from {}", entries.len(), path.display());
        }

        Ok(Self {
            path: Some(path.to_path_buf()),
            key,
            entries: Mutex::new(entries),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            key: derive_key(""),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Inserts or replaces `name`. `payload` must be a JSON document.
    pub fn add_or_update(&self, name: &str, payload: &str) -> Result<(), StoreError> {
        serde_json::from_str::<serde_json::Value>(payload)?;
        let mut entries = self.entries.lock();
        entries.insert(name.to_string(), payload.to_string());
        self.flush(&entries)
    }

    pub fn get_by_name(&self, name: &str) -> Option<String> {
        self.entries.lock().get(name).cloned()
    }

    pub fn get_all(&self) -> Vec<(String, String)> {
        self.entries
            .lock()
            .iter()
            .map(|(name, payload)| (name.clone(), payload.clone()))
            .collect()
    }

    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        if entries.remove(name).is_none() {
            return Ok(false);
        }
        self.flush(&entries)?;
        Ok(true)
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut encrypted = BTreeMap::new();
        for (name, payload) in entries {
            let blob = encrypt(&self.key, payload.as_bytes())?;
            encrypted.insert(name.as_str(), hex::encode(blob));
        }
        let document = serde_json::to_string_pretty(&encrypted)?;

        let temp = path.with_extension("tmp");
        std::fs::write(&temp, document)?;
        std::fs::rename(&temp, path)?;
        debug!("Flushed {} entries to {}", entries.len(), path.display());
        Ok(())
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Encrypt)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| StoreError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(key: &[u8; 32], blob: &[u8]) -> Option<Vec<u8>> {
    if blob.len() < NONCE_SIZE {
        return None;
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext).ok()
}
