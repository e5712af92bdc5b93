use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::store::{CredentialStore, StoreError, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::api::ApiError;
use crate::models::{TokenPair, UserProfile};

/// Condition the UI should surface after the core acted on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionNotice {
    /// The session could not be recovered and was ended. Please sign in again.
    Expired,
}

/// The client's belief about whether it is authenticated and as whom.
#[derive(Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Session {
    pub user: Option<UserProfile>,
    pub authenticated: bool,
    /// Set once the first rehydration attempt has finished
    pub initialized: bool,
    #[serde(skip)]
    pub access_token: Option<String>,
    #[serde(skip)]
    pub refresh_token: Option<String>,
    pub notice: Option<SessionNotice>,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub signed_in_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Current credentials, if any.
    pub fn credentials(&self) -> Option<TokenPair> {
        self.access_token
            .as_ref()
            .map(|access| TokenPair::new(access.clone(), self.refresh_token.clone()))
    }

    fn set_pair(&mut self, pair: Option<&TokenPair>) {
        self.access_token = pair.map(|p| p.access.clone());
        self.refresh_token = pair.and_then(|p| p.refresh.clone());
        self.authenticated = self.access_token.is_some();
    }

    fn holds_access(&self, access: &str) -> bool {
        self.access_token.as_deref() == Some(access)
    }

    fn reset(&mut self, notice: Option<SessionNotice>) {
        let initialized = self.initialized;
        *self = Session {
            initialized,
            notice,
            ..Session::default()
        };
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user.as_ref().map(|u| &u.id))
            .field("authenticated", &self.authenticated)
            .field("initialized", &self.initialized)
            .field("has_access_token", &self.access_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("notice", &self.notice)
            .finish()
    }
}

/// Outcome of a conditional token replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUpdate {
    Applied,
    /// The session no longer held the expected access token (signed out or
    /// signed in again meanwhile). Nothing was changed.
    Superseded,
}

/// Process-wide owner of the `Session`.
///
/// The session changes only through the methods below. Each change is a single
/// `send_modify` on a watch channel, so subscribers observe whole values and
/// never a half-updated token pair. Mutations that also touch the store hold
/// `transition` for their whole duration, so memory and store updates from two
/// transitions never interleave.
pub struct SessionState {
    tx: watch::Sender<Session>,
    store: Arc<dyn CredentialStore>,
    transition: Mutex<()>,
    /// Current session was created with `remember_me` (or rehydrated)
    persist: AtomicBool,
    /// Durable storage failed earlier in this process
    memory_only: AtomicBool,
    init: OnceCell<()>,
}

impl SessionState {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (tx, _rx) = watch::channel(Session::default());
        Self {
            tx,
            store,
            transition: Mutex::new(()),
            persist: AtomicBool::new(false),
            memory_only: AtomicBool::new(false),
            init: OnceCell::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Session {
        self.tx.borrow().clone()
    }

    pub fn credentials(&self) -> Option<TokenPair> {
        self.tx.borrow().credentials()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx.borrow().access_token.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.tx.borrow().initialized
    }

    /// True once durable storage has failed; the session will not survive a restart.
    pub fn is_memory_only(&self) -> bool {
        self.memory_only.load(Ordering::SeqCst)
    }

    fn persists(&self) -> bool {
        self.persist.load(Ordering::SeqCst) && !self.is_memory_only()
    }

    /// Rehydrate from the credential store, exactly once per process.
    ///
    /// With a stored access token the session is optimistically marked
    /// authenticated while `who_am_i` runs. If the server rejects the session
    /// the durable record is cleared. Any other failure (offline, server
    /// trouble) starts signed out but keeps the record for the next launch.
    /// Later calls return immediately without touching storage or network.
    pub async fn initialize<F, Fut>(&self, who_am_i: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UserProfile, ApiError>>,
    {
        self.init
            .get_or_init(|| async {
                if self.restore().await {
                    match who_am_i().await {
                        Ok(user) => {
                            info!(user_id = %user.id, "Session restored");
                            self.tx.send_if_modified(|s| {
                                if s.authenticated {
                                    s.user = Some(user);
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                        Err(e) if e.is_authorization_failure() => {
                            info!(error = %e, "Stored session rejected, starting signed out");
                            let notice = self.tx.borrow().notice;
                            self.reset(notice).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Stored session could not be verified, keeping it for next start");
                            self.reset_in_memory().await;
                        }
                    }
                }
                self.tx.send_modify(|s| s.initialized = true);
            })
            .await;
    }

    /// Load the durable record into memory. Returns whether one was found.
    async fn restore(&self) -> bool {
        let _transition = self.transition.lock().await;
        match self.load_record().await {
            None => {
                debug!("No stored credentials");
                false
            }
            Some(pair) => {
                self.persist.store(true, Ordering::SeqCst);
                self.tx.send_modify(|s| s.set_pair(Some(&pair)));
                true
            }
        }
    }

    /// Install the result of a successful login.
    ///
    /// Memory is updated first. With `remember` the pair is written to the
    /// store; a store that is unavailable degrades the session to memory-only
    /// instead of failing the login. Without `remember` any old durable record
    /// is removed so it cannot resurrect on restart.
    pub async fn complete_login(&self, pair: TokenPair, user: Option<UserProfile>, remember: bool) {
        let _transition = self.transition.lock().await;
        self.persist.store(remember, Ordering::SeqCst);
        self.tx.send_modify(|s| {
            s.set_pair(Some(&pair));
            s.user = user;
            s.notice = None;
            s.signed_in_at = Some(Utc::now());
        });

        if !remember {
            self.clear_record().await;
            return;
        }
        if self.is_memory_only() {
            return;
        }
        if let Err(e) = self.write_record(&pair).await {
            warn!(store = self.store.name(), error = %e, "Could not persist login, continuing in memory");
            self.memory_only.store(true, Ordering::SeqCst);
        }
    }

    /// Replace the token pair in memory and then in durable storage, provided
    /// the session still holds `expected_access`.
    ///
    /// A session that was signed out or signed in again while the new pair was
    /// being fetched is left alone and `Superseded` is returned. If the durable
    /// write fails, memory is rolled back to the previous pair and the store
    /// error is returned so the caller can decide how to proceed.
    pub async fn set_tokens(&self, expected_access: &str, pair: TokenPair) -> Result<TokenUpdate, StoreError> {
        let _transition = self.transition.lock().await;
        let mut previous = None;
        let applied = self.tx.send_if_modified(|s| {
            if !s.holds_access(expected_access) {
                return false;
            }
            previous = s.credentials();
            s.set_pair(Some(&pair));
            true
        });
        if !applied {
            debug!("Session changed while refreshing, dropping new tokens");
            return Ok(TokenUpdate::Superseded);
        }

        if !self.persists() {
            return Ok(TokenUpdate::Applied);
        }

        if let Err(e) = self.write_record(&pair).await {
            warn!(store = self.store.name(), error = %e, "Token write failed, rolling back");
            self.tx.send_modify(|s| s.set_pair(previous.as_ref()));
            if let Some(prev) = &previous {
                if let Err(restore) = self.write_record(prev).await {
                    debug!(error = %restore, "Could not restore previous credential record");
                }
            }
            return Err(e);
        }
        Ok(TokenUpdate::Applied)
    }

    /// Adopt a pair for the rest of this process without durable storage,
    /// under the same `expected_access` condition as `set_tokens`.
    pub async fn set_tokens_in_memory(&self, expected_access: &str, pair: TokenPair) -> TokenUpdate {
        let _transition = self.transition.lock().await;
        let applied = self.tx.send_if_modified(|s| {
            if !s.holds_access(expected_access) {
                return false;
            }
            s.set_pair(Some(&pair));
            true
        });
        if !applied {
            return TokenUpdate::Superseded;
        }
        self.memory_only.store(true, Ordering::SeqCst);
        // A stale durable pair must not come back on the next start.
        self.clear_record().await;
        TokenUpdate::Applied
    }

    /// Clear durable credentials and return to the unauthenticated shape.
    /// `initialized` is left as it was.
    pub async fn reset(&self, notice: Option<SessionNotice>) {
        let _transition = self.transition.lock().await;
        self.clear_record().await;
        self.persist.store(false, Ordering::SeqCst);
        self.tx.send_modify(|s| s.reset(notice));
    }

    // Signed out for this process only; the durable record stays.
    async fn reset_in_memory(&self) {
        let _transition = self.transition.lock().await;
        self.persist.store(false, Ordering::SeqCst);
        self.tx.send_modify(|s| s.reset(None));
    }

    pub fn clear_notice(&self) {
        self.tx.send_if_modified(|s| s.notice.take().is_some());
    }

    /// Refresh token to present to the refresh endpoint.
    ///
    /// Reads the durable record when the session is persisted, falling back to
    /// the in-memory copy when storage is empty or unavailable.
    pub async fn refresh_token(&self) -> Option<String> {
        if self.persists() {
            match self.store.get(REFRESH_TOKEN_KEY).await {
                Ok(Some(token)) if is_usable(&token) => return Some(token),
                Ok(_) => {}
                Err(e) => {
                    warn!(store = self.store.name(), error = %e, "Could not read refresh token");
                }
            }
        }
        self.tx.borrow().refresh_token.clone()
    }

    async fn load_record(&self) -> Option<TokenPair> {
        let access = match self.store.get(ACCESS_TOKEN_KEY).await {
            Ok(Some(token)) if is_usable(&token) => token,
            Ok(_) => return None,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "Credential store unreadable, treating as signed out");
                return None;
            }
        };
        let refresh = match self.store.get(REFRESH_TOKEN_KEY).await {
            Ok(token) => token.filter(|t| is_usable(t)),
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "Refresh token unreadable");
                None
            }
        };
        Some(TokenPair::new(access, refresh))
    }

    async fn write_record(&self, pair: &TokenPair) -> Result<(), StoreError> {
        self.store.set(ACCESS_TOKEN_KEY, &pair.access).await?;
        match &pair.refresh {
            Some(refresh) => self.store.set(REFRESH_TOKEN_KEY, refresh).await,
            None => self.store.delete(REFRESH_TOKEN_KEY).await,
        }
    }

    async fn clear_record(&self) {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY] {
            if let Err(e) = self.store.delete(key).await {
                warn!(store = self.store.name(), key = key, error = %e, "Could not clear credential");
            }
        }
    }
}

// Older clients wrote the literal string "undefined" for a missing token.
fn is_usable(token: &str) -> bool {
    !token.is_empty() && token != "undefined"
}
