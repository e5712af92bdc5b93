//! Session and request-authorization core for the micropost client.
//!
//! Persists and rehydrates the signed-in session, attaches credentials to
//! every request, and recovers from expired access tokens with a single
//! coordinated refresh. Screens observe the session through
//! [`ApiClient::subscribe`] and never mutate it directly.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{CredentialStore, Session, SessionNotice, SessionState};
pub use config::{Config, StorageFailurePolicy, StoreBackend};
pub use models::{LoginCredentials, TokenPair, UserProfile};
