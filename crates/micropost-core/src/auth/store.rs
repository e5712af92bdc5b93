//! Credential store capability and the in-memory backend.
//!
//! The session only ever talks to a `dyn CredentialStore`, so the durable
//! backend (keychain, encrypted vault) can be swapped for `MemoryStore` in
//! tests or on platforms without secure storage.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

/// Key holding the access token.
pub const ACCESS_TOKEN_KEY: &str = "token";

/// Key holding the refresh ("remember") token.
pub const REFRESH_TOKEN_KEY: &str = "remember_token";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Credential storage unavailable: {0}")]
    Unavailable(String),

    #[error("Credential storage is corrupt: {0}")]
    Corrupt(String),
}

/// Durable key/value persistence for credentials.
///
/// Each call is atomic with respect to itself: a concurrent reader sees either
/// the old or the new value for a key, never a partial write.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Deleting a key that does not exist is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Short name used in log fields.
    fn name(&self) -> &'static str;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with an access/refresh pair, as if a
    /// previous process had logged in with `remember_me`.
    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        let store = Self::new();
        {
            let mut entries = store.lock();
            entries.insert(ACCESS_TOKEN_KEY.to_string(), access.to_string());
            entries.insert(REFRESH_TOKEN_KEY.to_string(), refresh.to_string());
        }
        store
    }

    /// Synchronous read, handy for assertions.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
