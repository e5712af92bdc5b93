//! REST API client module for the micropost service.
//!
//! This module provides the `ApiClient`, the request pipeline every call goes
//! through: credentials are attached as `Bearer <access> <refresh>`, transient
//! failures are retried, and a 401 is recovered with one coordinated token
//! refresh before the request is retried.

pub mod client;
pub mod error;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use transport::{RequestSpec, LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH, SESSION_PATH};
pub use reqwest::Method;
