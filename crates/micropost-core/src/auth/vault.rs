//! Encrypted-at-rest credential vault.
//!
//! All keys live in one JSON map that is sealed with ChaCha20-Poly1305 and
//! written to a single file. The 256-bit key comes either from the OS keychain
//! (generated on first write) or from a passphrase stretched with Argon2 using a
//! random salt kept in the vault header. The derived key is cached per salt.
//!
//! Writes go to a sibling temp file that is renamed over the vault, so a
//! process killed mid-write leaves the previous vault intact. File, keychain
//! and key-derivation work runs on the blocking pool.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use argon2::Argon2;
use async_trait::async_trait;
use base64::prelude::*;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use keyring::Entry;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::keyring_store::{blocking, read_secret, write_secret, SERVICE_NAME};
use super::store::{CredentialStore, StoreError};

/// Vault file name in the data directory
const VAULT_FILE: &str = "credentials.vault";

/// Keychain account holding the vault key
const VAULT_KEY_ACCOUNT: &str = "vault-key";

const VAULT_VERSION: u32 = 1;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// Where the vault encryption key comes from.
#[derive(Clone)]
pub enum KeySource {
    /// Random key held in the OS keychain under the given service.
    Keyring { service: String },
    /// Key derived from a passphrase with Argon2.
    Passphrase(String),
}

impl KeySource {
    pub fn keyring() -> Self {
        KeySource::Keyring {
            service: SERVICE_NAME.to_string(),
        }
    }
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Keyring { service } => {
                f.debug_struct("Keyring").field("service", service).finish()
            }
            KeySource::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
        }
    }
}

/// On-disk header. Byte fields are standard base64.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    nonce: String,
    ciphertext: String,
    written_at: DateTime<Utc>,
}

#[derive(Default)]
struct Contents {
    entries: HashMap<String, String>,
    salt: Option<Vec<u8>>,
    /// The file on disk was unreadable and these contents replace it.
    discarded: bool,
}

struct CachedKey {
    salt: Option<Vec<u8>>,
    key: [u8; KEY_LEN],
}

/// Synchronous vault operations. Only ever called from the blocking pool.
struct VaultFile {
    path: PathBuf,
    key_source: KeySource,
    cached_key: StdMutex<Option<CachedKey>>,
}

pub struct EncryptedFileStore {
    vault: Arc<VaultFile>,
    // Serialises read-modify-write cycles on the vault file.
    lock: Mutex<()>,
}

impl EncryptedFileStore {
    pub fn new(path: PathBuf, key_source: KeySource) -> Self {
        Self {
            vault: Arc::new(VaultFile {
                path,
                key_source,
                cached_key: StdMutex::new(None),
            }),
            lock: Mutex::new(()),
        }
    }

    /// Vault location under the platform data directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join(SERVICE_NAME).join(VAULT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.vault.path
    }
}

fn corrupt(reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt(reason.into())
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, StoreError> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|e| corrupt(format!("bad {} encoding: {}", name, e)))
}

impl VaultFile {
    fn key(&self, salt: Option<&[u8]>, create: bool) -> Result<[u8; KEY_LEN], StoreError> {
        let mut cached = self.cached_key.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = cached.as_ref().filter(|c| c.salt.as_deref() == salt) {
            return Ok(hit.key);
        }
        let key = self.derive_key(salt, create)?;
        *cached = Some(CachedKey {
            salt: salt.map(<[u8]>::to_vec),
            key,
        });
        Ok(key)
    }

    fn derive_key(&self, salt: Option<&[u8]>, create: bool) -> Result<[u8; KEY_LEN], StoreError> {
        match &self.key_source {
            KeySource::Passphrase(passphrase) => {
                let salt = salt.ok_or_else(|| corrupt("vault salt missing"))?;
                let mut key = [0u8; KEY_LEN];
                Argon2::default()
                    .hash_password_into(passphrase.as_bytes(), salt, &mut key)
                    .map_err(|e| StoreError::Unavailable(format!("key derivation failed: {}", e)))?;
                Ok(key)
            }
            KeySource::Keyring { service } => {
                let entry = Entry::new(service, VAULT_KEY_ACCOUNT)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                match read_secret(&entry)? {
                    Some(encoded) => decode_key(&encoded),
                    None if create => {
                        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
                        let mut bytes = [0u8; KEY_LEN];
                        bytes.copy_from_slice(key.as_slice());
                        write_secret(&entry, &BASE64_STANDARD.encode(bytes))?;
                        debug!(service = %service, "Generated new vault key");
                        Ok(bytes)
                    }
                    None => Err(corrupt("vault key missing from keychain")),
                }
            }
        }
    }

    fn load(&self) -> Result<Contents, StoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Contents::default()),
            Err(e) => return Err(StoreError::Unavailable(e.to_string())),
        };

        let envelope: Envelope = serde_json::from_slice(&raw)
            .map_err(|e| corrupt(format!("unreadable vault header: {}", e)))?;
        if envelope.version != VAULT_VERSION {
            return Err(corrupt(format!("unsupported vault version {}", envelope.version)));
        }
        let nonce = decode_field("nonce", &envelope.nonce)?;
        if nonce.len() != NONCE_LEN {
            return Err(corrupt("bad nonce length"));
        }
        let ciphertext = decode_field("ciphertext", &envelope.ciphertext)?;
        let salt = envelope
            .salt
            .as_deref()
            .map(|salt| decode_field("salt", salt))
            .transpose()?;

        let key = self.key(salt.as_deref(), false)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| corrupt("vault failed authentication"))?;
        let entries = serde_json::from_slice(&plaintext)
            .map_err(|e| corrupt(format!("unreadable vault body: {}", e)))?;

        Ok(Contents {
            entries,
            salt,
            discarded: false,
        })
    }

    /// Load for modification. A corrupt vault is replaced rather than
    /// blocking every future write.
    fn load_for_write(&self) -> Result<Contents, StoreError> {
        match self.load() {
            Err(StoreError::Corrupt(reason)) => {
                warn!(path = %self.path.display(), reason = %reason, "Discarding corrupt credential vault");
                Ok(Contents {
                    discarded: true,
                    ..Contents::default()
                })
            }
            other => other,
        }
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.entries.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut contents = self.load_for_write()?;
        contents.entries.insert(key.to_string(), value.to_string());
        self.save(&contents)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut contents = self.load_for_write()?;
        let removed = contents.entries.remove(key).is_some();
        if !removed && !contents.discarded {
            return Ok(());
        }
        if contents.entries.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StoreError::Unavailable(e.to_string())),
            };
        }
        self.save(&contents)
    }

    fn save(&self, contents: &Contents) -> Result<(), StoreError> {
        let salt = match (&self.key_source, &contents.salt) {
            (KeySource::Passphrase(_), Some(salt)) => Some(salt.clone()),
            (KeySource::Passphrase(_), None) => {
                let mut salt = vec![0u8; SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                Some(salt)
            }
            (KeySource::Keyring { .. }, _) => None,
        };

        let key = self.key(salt.as_deref(), true)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let plaintext = serde_json::to_vec(&contents.entries)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| StoreError::Unavailable("vault encryption failed".into()))?;

        let envelope = Envelope {
            version: VAULT_VERSION,
            salt: salt.map(|salt| BASE64_STANDARD.encode(salt)),
            nonce: BASE64_STANDARD.encode(nonce),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
            written_at: Utc::now(),
        };
        let bytes =
            serde_json::to_vec(&envelope).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.write_atomically(&bytes)
    }

    fn write_atomically(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let io_err = |e: std::io::Error| StoreError::Unavailable(e.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("vault.tmp");

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .map_err(io_err)?;
            file.write_all(bytes).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }

        #[cfg(not(unix))]
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(bytes).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }

        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], StoreError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|_| corrupt("malformed vault key"))?;
    bytes
        .try_into()
        .map_err(|_| corrupt("vault key has the wrong length"))
}

#[async_trait]
impl CredentialStore for EncryptedFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let vault = self.vault.clone();
        let key = key.to_string();
        blocking(move || vault.get(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let vault = self.vault.clone();
        let (key, value) = (key.to_string(), value.to_string());
        blocking(move || vault.set(&key, &value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let vault = self.vault.clone();
        let key = key.to_string();
        blocking(move || vault.delete(&key)).await
    }

    fn name(&self) -> &'static str {
        "encrypted_file"
    }
}
