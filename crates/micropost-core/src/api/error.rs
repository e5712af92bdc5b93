use thiserror::Error;

use crate::auth::StoreError;
use crate::models::{ErrorBody, FieldErrors};

#[derive(Error, Debug)]
pub enum ApiError {
    /// Field-keyed messages from the server, surfaced verbatim.
    #[error("Validation failed: {}", summarize(.0))]
    Validation(FieldErrors),

    /// Request refused with `{"error": ...}` messages, e.g. bad credentials.
    #[error("{}", .0.join("; "))]
    Rejected(Vec<String>),

    /// Authorization could not be recovered and the session was ended.
    #[error("Session expired - please sign in again")]
    SessionExpired,

    #[error("Unauthorized - not signed in")]
    Unauthorized,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Credential storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Could not encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

fn summarize(errors: &FieldErrors) -> String {
    errors
        .iter()
        .map(|(field, messages)| format!("{} {}", field, messages.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        if let Some(errors) = parsed.errors.filter(|e| !e.is_empty()) {
            return ApiError::Validation(errors);
        }

        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            400..=499 if parsed.error.is_some() => ApiError::Rejected(
                ErrorBody {
                    error: parsed.error,
                    errors: None,
                }
                .messages(),
            ),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// The caller should show "session expired" rather than a generic failure.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::SessionExpired)
    }

    /// The server refused the credentials, as opposed to being unreachable
    /// or failing for its own reasons.
    pub fn is_authorization_failure(&self) -> bool {
        matches!(self, ApiError::SessionExpired | ApiError::Unauthorized)
    }

    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            ApiError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}
