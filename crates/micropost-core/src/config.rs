//! Client configuration.
//!
//! Holds the API base URL, transport limits, the credential store backend and
//! the policy for storage failures during token refresh.
//!
//! Configuration is stored at `~/.config/micropost/config.json`. A handful of
//! environment variables override the file, see [`Config::apply_env`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{CredentialStore, EncryptedFileStore, KeySource, KeyringStore, MemoryStore};

/// Application name used for config/data directory paths
const APP_NAME: &str = "micropost";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// Per-attempt request timeout. Exceeding it counts as a transient failure.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Extra attempts for transient failures (network, 408/413/429/5xx).
const DEFAULT_MAX_TRANSIENT_RETRIES: u32 = 2;

const DEFAULT_LANGUAGE: &str = "EN";

pub const ENV_API_URL: &str = "MICROPOST_API_URL";
pub const ENV_STORE: &str = "MICROPOST_STORE";
pub const ENV_VAULT_PASSPHRASE: &str = "MICROPOST_VAULT_PASSPHRASE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Keyring,
    #[default]
    EncryptedFile,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(StoreBackend::Keyring),
            "encrypted_file" | "file" => Ok(StoreBackend::EncryptedFile),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown credential store: {}", other)),
        }
    }
}

/// What to do when refreshed tokens cannot be written to durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageFailurePolicy {
    /// Keep the new tokens in memory; the session won't survive a restart.
    #[default]
    ContinueInMemory,
    /// Treat the refresh as failed, which ends the session.
    ForceLogout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub max_transient_retries: u32,
    /// Sent as the `x-lang` header
    pub language: String,
    pub credential_store: StoreBackend,
    pub storage_failure: StorageFailurePolicy,
    /// Overrides the platform data directory for the vault file
    pub vault_path: Option<PathBuf>,
    #[serde(skip)]
    pub vault_passphrase: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_transient_retries: DEFAULT_MAX_TRANSIENT_RETRIES,
            language: DEFAULT_LANGUAGE.to_string(),
            credential_store: StoreBackend::default(),
            storage_failure: StorageFailurePolicy::default(),
            vault_path: None,
            vault_passphrase: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for log files.
    pub fn log_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join(APP_NAME).join("logs"))
    }

    /// Apply environment overrides on top of the loaded file.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_vars(|name| std::env::var(name).ok())?;
        Ok(self)
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var(ENV_API_URL).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(store) = var(ENV_STORE).filter(|v| !v.is_empty()) {
            self.credential_store = store
                .parse()
                .with_context(|| format!("Invalid {}", ENV_STORE))?;
        }
        if let Some(passphrase) = var(ENV_VAULT_PASSPHRASE).filter(|v| !v.is_empty()) {
            self.vault_passphrase = Some(passphrase);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Build the configured credential store.
    pub fn build_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.credential_store {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Keyring => Arc::new(KeyringStore::new()),
            StoreBackend::EncryptedFile => {
                let path = match &self.vault_path {
                    Some(path) => path.clone(),
                    None => EncryptedFileStore::default_path()
                        .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?,
                };
                let key_source = match &self.vault_passphrase {
                    Some(passphrase) => KeySource::Passphrase(passphrase.clone()),
                    None => KeySource::keyring(),
                };
                Arc::new(EncryptedFileStore::new(path, key_source))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_transient_retries, 2);
        assert_eq!(config.storage_failure, StorageFailurePolicy::ContinueInMemory);
        assert_eq!(config.credential_store, StoreBackend::EncryptedFile);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url": "https://example.test/api", "storage_failure": "force_logout"}"#)
                .unwrap();
        assert_eq!(config.api_base_url, "https://example.test/api");
        assert_eq!(config.storage_failure, StorageFailurePolicy::ForceLogout);
        assert_eq!(config.language, "EN");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_API_URL, "https://override.test/api"),
            (ENV_STORE, "memory"),
            (ENV_VAULT_PASSPHRASE, "pw"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.api_base_url, "https://override.test/api");
        assert_eq!(config.credential_store, StoreBackend::Memory);
        assert_eq!(config.vault_passphrase.as_deref(), Some("pw"));
    }

    #[test]
    fn test_bad_store_name_is_error() {
        let mut config = Config::default();
        let result = config.apply_vars(|name| (name == ENV_STORE).then(|| "floppy".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_passphrase_never_serialized() {
        let config = Config {
            vault_passphrase: Some("secret".into()),
            ..Config::default()
        };
        assert!(!serde_json::to_string(&config).unwrap().contains("secret"));
    }
}
