use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::UserProfile;

/// Server-reported field errors, e.g. `{"password": ["is too short"]}`.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Clone, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

impl LoginCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>, remember_me: bool) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            remember_me,
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

/// Access token plus the refresh token that accompanies it.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: Option<String>,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            access: access.into(),
            refresh,
        }
    }

    /// `Authorization` header value: `Bearer <access> <refresh-or-empty>`.
    pub fn authorization(&self) -> String {
        format!("Bearer {} {}", self.access, self.refresh.as_deref().unwrap_or(""))
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ===== Wire payloads =====

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub session: &'a LoginCredentials,
}

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginTokens {
    pub access: Option<TokenBody>,
    pub refresh: Option<TokenBody>,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub user: Option<UserProfile>,
    pub tokens: Option<LoginTokens>,
}

impl LoginResponse {
    /// The issued token pair, if the server included an access token.
    pub fn token_pair(&self) -> Option<TokenPair> {
        let tokens = self.tokens.as_ref()?;
        let access = tokens.access.as_ref()?.token.clone();
        let refresh = tokens
            .refresh
            .as_ref()
            .map(|r| r.token.clone())
            .filter(|t| !t.is_empty());
        Some(TokenPair::new(access, refresh))
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionResponse {
    pub user: Option<UserProfile>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RefreshedAccess {
    pub token: String,
    pub remember_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshedTokens {
    pub access: RefreshedAccess,
}

#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub tokens: RefreshedTokens,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Error payload: `{"error": "..."}`, `{"error": [...]}` or `{"errors": {field: [...]}}`.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    pub error: Option<OneOrMany>,
    pub errors: Option<FieldErrors>,
}

impl ErrorBody {
    pub fn messages(&self) -> Vec<String> {
        match &self.error {
            Some(OneOrMany::One(msg)) => vec![msg.clone()],
            Some(OneOrMany::Many(msgs)) => msgs.clone(),
            None => Vec::new(),
        }
    }
}
