//! Encrypted per-user state vault.
//!
//! Worker state blobs are written as one file per user, named by the
//! SHA-256 of the user id so filenames never leak identifiers. Contents
//! are sealed with ChaCha20-Poly1305 AEAD under a random key stored next
//! to the blobs with 0600 permissions; each seal uses a fresh 12-byte
//! nonce prepended to the ciphertext, hex-encoded on disk. The Poly1305
//! tag rejects tampered blobs at open time.
//!
//! Setting `encrypt = false` in config stores plaintext, for debugging.

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// File-backed state vault used by the worker for SAVE_STATE / LOAD_STATE.
#[derive(Debug, Clone)]
pub struct FileVault {
    dir: PathBuf,
    key_path: PathBuf,
    encrypt: bool,
}

impl FileVault {
    pub fn new(dir: &Path, encrypt: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            key_path: dir.join(".vault_key"),
            encrypt,
        }
    }

    fn blob_path(&self, user_id: &str) -> PathBuf {
        let digest = Sha256::digest(user_id.as_bytes());
        self.dir.join(format!("{}.state", hex::encode(digest)))
    }

    /// Seal and persist one user's state blob, replacing any previous one.
    pub fn store(&self, user_id: &str, data: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create vault directory {}", self.dir.display()))?;
        let sealed = self.seal(data)?;
        fs::write(self.blob_path(user_id), sealed)
            .with_context(|| format!("Failed to write state blob for user {user_id}"))?;
        Ok(())
    }

    /// Load and open one user's state blob. `None` when the user has no
    /// saved state yet.
    pub fn fetch(&self, user_id: &str) -> Result<Option<String>> {
        let path = self.blob_path(user_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state blob for user {user_id}"))
            }
        };
        Ok(Some(self.open(&raw)?))
    }

    /// Remove one user's state blob. Missing blobs are not an error.
    pub fn delete(&self, user_id: &str) -> Result<()> {
        match fs::remove_file(self.blob_path(user_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to delete state blob for user {user_id}"))
            }
        }
    }

    fn seal(&self, plaintext: &str) -> Result<String> {
        if !self.encrypt {
            return Ok(plaintext.to_string());
        }

        let key_bytes = self.load_or_create_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Vault encryption failed: {e}"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(hex::encode(blob))
    }

    fn open(&self, raw: &str) -> Result<String> {
        if !self.encrypt {
            return Ok(raw.to_string());
        }

        let blob = hex::decode(raw.trim()).context("State blob is corrupt (bad hex)")?;
        anyhow::ensure!(blob.len() > NONCE_LEN, "State blob too short (missing nonce)");

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let key_bytes = self.load_or_create_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow::anyhow!("Vault decryption failed: wrong key or tampered blob"))?;
        String::from_utf8(plaintext).context("Decrypted state blob is not valid UTF-8")
    }

    fn load_or_create_key(&self) -> Result<Vec<u8>> {
        if self.key_path.exists() {
            let hex_key =
                fs::read_to_string(&self.key_path).context("Failed to read vault key file")?;
            let key = hex::decode(hex_key.trim()).context("Vault key file is corrupt")?;
            anyhow::ensure!(key.len() == KEY_LEN, "Vault key has the wrong length");
            return Ok(key);
        }

        let mut key = vec![0u8; KEY_LEN];
        use chacha20poly1305::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut key);

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create vault directory {}", self.dir.display()))?;
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.key_path)
        {
            Ok(mut key_file) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    key_file
                        .set_permissions(fs::Permissions::from_mode(0o600))
                        .context("Failed to set vault key permissions")?;
                }
                key_file
                    .write_all(hex::encode(&key).as_bytes())
                    .context("Failed to write vault key file")?;
                key_file.sync_all().context("Failed to fsync vault key file")?;
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Concurrent creator won the race; read the existing key.
                let hex_key = fs::read_to_string(&self.key_path)
                    .context("Failed to read concurrently created vault key")?;
                hex::decode(hex_key.trim()).context("Vault key file is corrupt")
            }
            Err(e) => Err(e).context("Failed to create vault key file"),
        }
    }
}
