//! Data models shared by the session core and its collaborators.
//!
//! - `UserProfile`: the server's identity projection for the signed-in user
//! - `LoginCredentials`, `TokenPair`: what goes into and comes out of auth
//! - Wire types for the login, session-check, refresh and error payloads

pub mod auth;
pub mod user;

pub use auth::{
    ErrorBody, FieldErrors, LoginCredentials, LoginResponse, RefreshResponse, SessionResponse,
    TokenPair,
};
pub use user::UserProfile;
