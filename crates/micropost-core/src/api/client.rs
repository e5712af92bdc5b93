//! Authorized API client.
//!
//! Every request passes through the same pipeline: attach the current
//! credentials, send with transient retry, and on a 401 hand off to the
//! refresh coordinator for a single refresh-then-retry. An unrecoverable 401
//! ends the session and reaches the caller as `ApiError::SessionExpired`.
//!
//! The session operations (`initialize`, `login`, `logout`) live here too
//! because they are themselves requests through this pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::transport::{RequestSpec, Transport, LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH, SESSION_PATH};
use super::ApiError;
use crate::auth::{
    CredentialStore, RefreshCoordinator, RefreshError, RefreshOutcome, RefreshPhase, Session,
    SessionNotice, SessionState, TokenRefresher,
};
use crate::config::Config;
use crate::models::auth::{LoginRequest, RefreshRequest};
use crate::models::{ErrorBody, LoginCredentials, LoginResponse, RefreshResponse, SessionResponse, TokenPair, UserProfile};

/// Shown when the server rejects a login without saying why.
const DEFAULT_LOGIN_ERROR: &str = "Invalid email/password combination";

/// Calls the refresh endpoint. Holds only the transport, never the session.
struct HttpRefresher {
    transport: Transport,
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let body = serde_json::to_value(RefreshRequest { refresh_token })
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let spec = RequestSpec::new(Method::POST, REFRESH_PATH).json(body);

        let response = self
            .transport
            .send(&spec, None)
            .await
            .map_err(|e| RefreshError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected {
                status: status.as_u16(),
            });
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        let access = parsed.tokens.access;
        Ok(TokenPair::new(
            access.token,
            access.remember_token.filter(|t| !t.is_empty()),
        ))
    }
}

/// Cheap to clone; clones share the session, coordinator and connection pool.
#[derive(Clone)]
pub struct ApiClient {
    transport: Transport,
    session: Arc<SessionState>,
    coordinator: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        let transport = Transport::new(config)?;
        let session = Arc::new(SessionState::new(store));
        let refresher = Arc::new(HttpRefresher {
            transport: transport.clone(),
        });
        let coordinator = Arc::new(RefreshCoordinator::new(
            session.clone(),
            refresher,
            config.storage_failure,
        ));

        Ok(Self {
            transport,
            session,
            coordinator,
        })
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    pub fn snapshot(&self) -> Session {
        self.session.snapshot()
    }

    pub fn refresh_phase(&self) -> RefreshPhase {
        self.coordinator.phase()
    }

    // ===== Session operations =====

    /// Rehydrate the stored session. Runs once per process; later calls
    /// return immediately.
    pub async fn initialize(&self) {
        self.session.initialize(move || self.who_am_i()).await;
    }

    /// Ask the server who the attached token belongs to.
    pub async fn who_am_i(&self) -> Result<UserProfile, ApiError> {
        let response: SessionResponse = self.get(SESSION_PATH).await?;
        response.user.ok_or(ApiError::Unauthorized)
    }

    /// Sign in. Server-reported problems come back as `Validation` (field
    /// errors) or `Rejected` (messages). Never retried.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<Option<UserProfile>, ApiError> {
        let body = serde_json::to_value(LoginRequest {
            session: credentials,
        })?;
        let spec = RequestSpec::new(Method::POST, LOGIN_PATH)
            .json(body)
            .without_retry();

        let response = self.execute(spec).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Login rejected");
            return Err(match ApiError::from_status(status, &body) {
                ApiError::Unauthorized => {
                    let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
                    let messages = parsed.messages();
                    if messages.is_empty() {
                        ApiError::Rejected(vec![DEFAULT_LOGIN_ERROR.to_string()])
                    } else {
                        ApiError::Rejected(messages)
                    }
                }
                other => other,
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("login response: {}", e)))?;
        let pair = login
            .token_pair()
            .ok_or_else(|| ApiError::InvalidResponse("login response carried no access token".into()))?;

        self.session
            .complete_login(pair, login.user.clone(), credentials.remember_me)
            .await;
        info!(
            user_id = login.user.as_ref().map(|u| u.id.as_str()).unwrap_or("?"),
            remember = credentials.remember_me,
            "Signed in"
        );
        Ok(login.user)
    }

    /// Sign out. The server call is best effort; locally the session always
    /// ends.
    pub async fn logout(&self) {
        self.end_session(None).await;
    }

    async fn force_logout(&self) {
        warn!("Ending session after failed refresh");
        self.end_session(Some(SessionNotice::Expired)).await;
    }

    async fn end_session(&self, notice: Option<SessionNotice>) {
        // Straight to the transport: a 401 here must not start another refresh.
        if let Some(credentials) = self.session.credentials() {
            let spec = RequestSpec::new(Method::DELETE, LOGOUT_PATH).without_retry();
            match self.transport.send(&spec, Some(&credentials)).await {
                Ok(response) if response.status().is_success() => debug!("Server session terminated"),
                Ok(response) => warn!(status = %response.status(), "Logout call failed, ignoring"),
                Err(e) => warn!(error = %e, "Logout call failed, ignoring"),
            }
        }
        self.session.reset(notice).await;
        info!("Signed out");
    }

    // ===== Pipeline =====

    /// Send a request through the pipeline and return the raw response.
    ///
    /// Only transport failures and `SessionExpired` are errors here; other
    /// statuses are left for the caller to inspect.
    pub async fn send(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> Result<Response, ApiError> {
        let mut spec = RequestSpec::new(method, path);
        spec.body = body;
        self.execute(spec).await
    }

    async fn execute(&self, spec: RequestSpec) -> Result<Response, ApiError> {
        let sent_with = self.session.credentials();
        let response = self.transport.send(&spec, sent_with.as_ref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED || !spec.recover {
            return Ok(response);
        }
        let Some(stale) = sent_with else {
            // Nothing to refresh; let the caller see the plain 401.
            return Ok(response);
        };

        debug!(path = %spec.path, "401 received, refreshing");
        match self.coordinator.refresh(&stale.access).await {
            RefreshOutcome::Succeeded(tokens) => {
                let retried = self.transport.send(&spec, Some(&tokens)).await?;
                debug!(path = %spec.path, status = %retried.status(), "Retried after refresh");
                Ok(retried)
            }
            RefreshOutcome::Failed { error, led } => {
                warn!(path = %spec.path, error = %error, "Authorization could not be recovered");
                if led {
                    self.force_logout().await;
                }
                Err(ApiError::SessionExpired)
            }
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn request<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, ApiError> {
        let path = spec.path.clone();
        let response = Self::check_response(self.execute(spec).await?).await?;
        let text = response.text().await?;
        // Empty bodies (204, bare DELETEs) decode as JSON null.
        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e)))
    }

    // ===== JSON helpers for feed/follow collaborators =====

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(RequestSpec::new(Method::GET, path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(RequestSpec::new(Method::POST, path).json(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(RequestSpec::new(Method::PUT, path).json(body)).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)?;
        self.request(RequestSpec::new(Method::PATCH, path).json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(RequestSpec::new(Method::DELETE, path)).await
    }
}
