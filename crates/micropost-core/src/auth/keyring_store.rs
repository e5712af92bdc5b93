//! OS keychain backend: one keychain entry per credential key.

use async_trait::async_trait;
use keyring::Entry;
use tracing::debug;

use super::store::{CredentialStore, StoreError};

/// Keychain service name shared by every entry this crate writes.
pub const SERVICE_NAME: &str = "micropost";

/// Stores each credential key as its own entry in the OS keychain.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key).map_err(unavailable)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(err: keyring::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// Read a keychain secret, mapping "no entry" to `None`.
pub(crate) fn read_secret(entry: &Entry) -> Result<Option<String>, StoreError> {
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(unavailable(e)),
    }
}

/// Write a keychain secret.
pub(crate) fn write_secret(entry: &Entry, secret: &str) -> Result<(), StoreError> {
    entry.set_password(secret).map_err(unavailable)
}

// Keychain and file calls block, so they run on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage task failed: {}", e)))?
}

#[async_trait]
impl CredentialStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entry = self.entry(key)?;
        blocking(move || read_secret(&entry)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let entry = self.entry(key)?;
        let value = value.to_string();
        blocking(move || write_secret(&entry, &value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let entry = self.entry(key)?;
        let key = key.to_string();
        blocking(move || match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                debug!(key = %key, "Removed keychain entry");
                Ok(())
            }
            Err(e) => Err(unavailable(e)),
        })
        .await
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}
