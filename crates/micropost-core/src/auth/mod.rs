//! Session and credential management.
//!
//! This module provides:
//! - `CredentialStore`: durable key/value capability with keychain, encrypted
//!   file and in-memory backends
//! - `SessionState`: the observable session and its transitions
//! - `RefreshCoordinator`: collapses concurrent 401s into one token refresh

pub mod keyring_store;
pub mod refresh;
pub mod session;
pub mod store;
pub mod vault;

pub use keyring_store::KeyringStore;
pub use refresh::{RefreshCoordinator, RefreshError, RefreshOutcome, RefreshPhase, TokenRefresher};
pub use session::{Session, SessionNotice, SessionState};
pub use store::{CredentialStore, MemoryStore, StoreError, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
pub use vault::{EncryptedFileStore, KeySource};
