//! HTTP transport shared by the pipeline and the refresh call.
//!
//! Owns the reqwest client, default headers and the generic transient-failure
//! retry. It knows nothing about sessions: credentials are passed in per call.

use reqwest::{header, Client, Method, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::ApiError;
use crate::config::Config;
use crate::models::TokenPair;

pub const LOGIN_PATH: &str = "login";
pub const SESSION_PATH: &str = "sessions";
pub const REFRESH_PATH: &str = "refresh";
pub const LOGOUT_PATH: &str = "logout";

/// Statuses retried like network errors.
const TRANSIENT_STATUSES: [u16; 7] = [408, 413, 429, 500, 502, 503, 504];

/// Endpoints whose 401 must never trigger refresh-then-retry.
fn is_auth_endpoint(path: &str) -> bool {
    let path = path.trim_matches('/');
    path == LOGIN_PATH || path == REFRESH_PATH || path == LOGOUT_PATH
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    TRANSIENT_STATUSES.contains(&status.as_u16())
}

pub(crate) fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// One logical request, rebuilt for every attempt.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Transient failures may be retried
    pub retry: bool,
    /// A 401 may be recovered through refresh-then-retry
    pub recover: bool,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let recover = !is_auth_endpoint(&path);
        Self {
            method,
            path,
            body: None,
            retry: true,
            recover,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub(crate) struct Transport {
    client: Client,
    base_url: String,
    language: String,
    max_retries: u32,
}

impl Transport {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            language: config.language.clone(),
            max_retries: config.max_transient_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send `spec`, retrying transient failures up to the configured bound.
    /// No delay is added between attempts beyond what the transport imposes.
    pub async fn send(
        &self,
        spec: &RequestSpec,
        auth: Option<&TokenPair>,
    ) -> Result<Response, reqwest::Error> {
        let attempts = if spec.retry { self.max_retries + 1 } else { 1 };
        let url = self.url(&spec.path);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut request = self
                .client
                .request(spec.method.clone(), &url)
                .header(header::ACCEPT, "application/json")
                .header("x-lang", &self.language);
            if let Some(pair) = auth {
                request = request.header(header::AUTHORIZATION, pair.authorization());
            }
            if let Some(body) = &spec.body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) if is_transient_status(response.status()) && attempt < attempts => {
                    warn!(
                        method = %spec.method,
                        path = %spec.path,
                        status = %response.status(),
                        attempt,
                        "Transient status, retrying"
                    );
                }
                Ok(response) => {
                    debug!(method = %spec.method, path = %spec.path, status = %response.status(), attempt, "Response");
                    return Ok(response);
                }
                Err(e) if is_transient_error(&e) && attempt < attempts => {
                    warn!(method = %spec.method, path = %spec.path, error = %e, attempt, "Network error, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
