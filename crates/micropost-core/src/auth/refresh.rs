//! Refresh coordination.
//!
//! A burst of 401s must produce exactly one call to the refresh endpoint. The
//! first caller to arrive while `Idle` leads the refresh; everyone who arrives
//! while it is in flight parks a oneshot in the waiter queue and receives the
//! leader's outcome. Once settled the coordinator is `Idle` again.
//!
//! The last failure is remembered against the access token that failed. A
//! straggler carrying that token while the session still holds it (the leader
//! is still logging out) gets the same failure instead of a second refresh.
//! The coordinator is process-local and never persisted.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::session::{SessionState, TokenUpdate};
use super::store::StoreError;
use crate::config::StorageFailurePolicy;
use crate::models::TokenPair;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No session to refresh")]
    NoSession,

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Refresh token rejected (status {status})")]
    Rejected { status: u16 },

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Could not store refreshed tokens: {0}")]
    Storage(StoreError),

    #[error("Refresh abandoned before it completed")]
    Abandoned,
}

impl RefreshError {
    /// Whether the leader must end the session. `NoSession` means it is
    /// already over.
    pub fn ends_session(&self) -> bool {
        !matches!(self, RefreshError::NoSession)
    }
}

/// Calls the refresh endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for a new pair. `refresh` is `None` when the
    /// server did not rotate the refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, RefreshError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// Retry with these credentials.
    Succeeded(TokenPair),
    /// The refresh failed. `led` is true for exactly one caller per failed
    /// refresh: the one that must end the session.
    Failed { error: RefreshError, led: bool },
}

type Settled = Result<TokenPair, RefreshError>;

enum State {
    Idle,
    Refreshing { waiters: Vec<oneshot::Sender<Settled>> },
}

struct Inner {
    state: State,
    /// Access token whose refresh last failed, with the error.
    last_failure: Option<(String, RefreshError)>,
}

pub struct RefreshCoordinator {
    session: Arc<SessionState>,
    refresher: Arc<dyn TokenRefresher>,
    storage_failure: StorageFailurePolicy,
    inner: Mutex<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        session: Arc<SessionState>,
        refresher: Arc<dyn TokenRefresher>,
        storage_failure: StorageFailurePolicy,
    ) -> Self {
        Self {
            session,
            refresher,
            storage_failure,
            inner: Mutex::new(Inner {
                state: State::Idle,
                last_failure: None,
            }),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        match self.lock().state {
            State::Idle => RefreshPhase::Idle,
            State::Refreshing { .. } => RefreshPhase::Refreshing,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain credentials to replace `stale_access`, which just drew a 401.
    ///
    /// If the session already holds a different access token, a refresh
    /// finished after the failing request was sent, and that token is returned
    /// without another refresh call.
    pub async fn refresh(&self, stale_access: &str) -> RefreshOutcome {
        let waiter = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match &mut inner.state {
                State::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!(waiting = waiters.len(), "Joining in-flight refresh");
                    Some(rx)
                }
                State::Idle => {
                    match self.session.credentials() {
                        None => {
                            return RefreshOutcome::Failed {
                                error: RefreshError::NoSession,
                                led: false,
                            }
                        }
                        Some(current) if current.access != stale_access => {
                            debug!("Access token already replaced, reusing it");
                            return RefreshOutcome::Succeeded(current);
                        }
                        Some(_) => {}
                    }
                    if let Some((access, error)) = &inner.last_failure {
                        if access == stale_access {
                            return RefreshOutcome::Failed {
                                error: error.clone(),
                                led: false,
                            };
                        }
                    }
                    inner.state = State::Refreshing {
                        waiters: Vec::new(),
                    };
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(tokens)) => RefreshOutcome::Succeeded(tokens),
                Ok(Err(error)) => RefreshOutcome::Failed { error, led: false },
                Err(_) => RefreshOutcome::Failed {
                    error: RefreshError::Abandoned,
                    led: false,
                },
            };
        }

        let mut guard = SettleGuard {
            coordinator: self,
            armed: true,
        };
        let result = self.run(stale_access).await;
        guard.settle(stale_access, result.clone());

        match result {
            Ok(tokens) => RefreshOutcome::Succeeded(tokens),
            Err(error) => RefreshOutcome::Failed {
                led: error.ends_session(),
                error,
            },
        }
    }

    async fn run(&self, stale_access: &str) -> Settled {
        let refresh_token = self
            .session
            .refresh_token()
            .await
            .ok_or(RefreshError::NoRefreshToken)?;

        info!("Refreshing access token");
        let mut tokens = self.refresher.refresh(&refresh_token).await?;
        if tokens.refresh.is_none() {
            tokens.refresh = Some(refresh_token);
        }

        let update = match self.session.set_tokens(stale_access, tokens.clone()).await {
            Ok(update) => update,
            Err(e) => match self.storage_failure {
                StorageFailurePolicy::ContinueInMemory => {
                    warn!(error = %e, "Refreshed tokens kept in memory only");
                    self.session.set_tokens_in_memory(stale_access, tokens.clone()).await
                }
                StorageFailurePolicy::ForceLogout => return Err(RefreshError::Storage(e)),
            },
        };

        match update {
            TokenUpdate::Applied => {
                info!("Access token refreshed");
                Ok(tokens)
            }
            // Signed out or signed in again while the refresh was in flight.
            TokenUpdate::Superseded => self.session.credentials().ok_or(RefreshError::NoSession),
        }
    }

    /// Return to `Idle`, recording `failure`, and hand back the waiters.
    fn drain(&self, failure: Option<(String, RefreshError)>) -> Vec<oneshot::Sender<Settled>> {
        let mut inner = self.lock();
        if failure.is_some() {
            inner.last_failure = failure;
        }
        match mem::replace(&mut inner.state, State::Idle) {
            State::Refreshing { waiters } => waiters,
            State::Idle => Vec::new(),
        }
    }
}

/// Returns the coordinator to `Idle` even if the leading future is dropped
/// mid-refresh. Waiters then see their sender dropped and report `Abandoned`.
struct SettleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl SettleGuard<'_> {
    fn settle(&mut self, access: &str, result: Settled) {
        self.armed = false;
        let failure = result
            .as_ref()
            .err()
            .map(|error| (access.to_string(), error.clone()));
        let waiters = self.coordinator.drain(failure);
        debug!(waiters = waiters.len(), ok = result.is_ok(), "Refresh settled");
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let abandoned = self.coordinator.drain(None);
            warn!(waiters = abandoned.len(), "Refresh dropped before settling");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::{CredentialStore, MemoryStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRefresher {
        calls: AtomicUsize,
        response: Result<TokenPair, RefreshError>,
        never_finish: bool,
    }

    impl FakeRefresher {
        fn ok(access: &str, refresh: Option<&str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Ok(TokenPair::new(access, refresh.map(String::from))),
                never_finish: false,
            }
        }

        fn failing(error: RefreshError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Err(error),
                never_finish: false,
            }
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenPair, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.never_finish {
                std::future::pending::<()>().await;
            }
            // Give the other callers a chance to pile up.
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.response.clone()
        }
    }

    async fn signed_in(store: Arc<dyn CredentialStore>) -> Arc<SessionState> {
        let session = Arc::new(SessionState::new(store));
        session
            .complete_login(TokenPair::new("old", Some("r1".into())), None, true)
            .await;
        session
    }

    fn coordinator(
        session: &Arc<SessionState>,
        refresher: &Arc<FakeRefresher>,
        policy: StorageFailurePolicy,
    ) -> RefreshCoordinator {
        RefreshCoordinator::new(session.clone(), refresher.clone(), policy)
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_refresh() {
        let store = Arc::new(MemoryStore::new());
        let session = signed_in(store.clone()).await;
        let refresher = Arc::new(FakeRefresher::ok("new", Some("r2")));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let outcomes = join_all((0..5).map(|_| coordinator.refresh("old"))).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        let expected = TokenPair::new("new", Some("r2".into()));
        for outcome in outcomes {
            assert_eq!(outcome, RefreshOutcome::Succeeded(expected.clone()));
        }
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);
        assert_eq!(store.peek(ACCESS_TOKEN_KEY).as_deref(), Some("new"));
        assert_eq!(store.peek(REFRESH_TOKEN_KEY).as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter_with_one_leader() {
        let session = signed_in(Arc::new(MemoryStore::new())).await;
        let refresher = Arc::new(FakeRefresher::failing(RefreshError::Rejected { status: 401 }));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let outcomes = join_all((0..4).map(|_| coordinator.refresh("old"))).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        let leaders = outcomes
            .iter()
            .filter(|o| matches!(o, RefreshOutcome::Failed { led: true, .. }))
            .count();
        assert_eq!(leaders, 1);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            RefreshOutcome::Failed { error: RefreshError::Rejected { status: 401 }, .. }
        )));
    }

    #[tokio::test]
    async fn test_straggler_after_failure_does_not_refresh_again() {
        let session = signed_in(Arc::new(MemoryStore::new())).await;
        let refresher = Arc::new(FakeRefresher::failing(RefreshError::Rejected { status: 401 }));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let first = coordinator.refresh("old").await;
        assert!(matches!(first, RefreshOutcome::Failed { led: true, .. }));
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);

        // The session still holds "old" until the caller finishes logging out.
        let late = coordinator.refresh("old").await;
        assert!(matches!(late, RefreshOutcome::Failed { led: false, .. }));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_new_session_refreshes_after_earlier_failure() {
        let session = signed_in(Arc::new(MemoryStore::new())).await;
        let refresher = Arc::new(FakeRefresher::failing(RefreshError::Rejected { status: 401 }));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);
        coordinator.refresh("old").await;

        let second = TokenPair::new("second", Some("r9".into()));
        session.complete_login(second.clone(), None, true).await;

        // A late 401 for the old token now reuses the new session.
        assert_eq!(
            coordinator.refresh("old").await,
            RefreshOutcome::Succeeded(second)
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        coordinator.refresh("second").await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn test_refresh_finishing_after_logout_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let session = signed_in(store.clone()).await;
        let refresher = Arc::new(FakeRefresher::ok("new", Some("r2")));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let mut refresh = Box::pin(coordinator.refresh("old"));
        assert!(futures::poll!(&mut refresh).is_pending());
        session.reset(None).await;

        assert_eq!(
            refresh.await,
            RefreshOutcome::Failed {
                error: RefreshError::NoSession,
                led: false
            }
        );
        assert!(!session.snapshot().authenticated);
        assert!(store.peek(ACCESS_TOKEN_KEY).is_none());
    }

    #[tokio::test]
    async fn test_stale_token_reuses_current_without_refresh() {
        let session = signed_in(Arc::new(MemoryStore::new())).await;
        let refresher = Arc::new(FakeRefresher::ok("unused", None));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let outcome = coordinator.refresh("some-older-token").await;
        assert_eq!(
            outcome,
            RefreshOutcome::Succeeded(TokenPair::new("old", Some("r1".into())))
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_keeps_refresh_token_when_not_rotated() {
        let session = signed_in(Arc::new(MemoryStore::new())).await;
        let refresher = Arc::new(FakeRefresher::ok("new", None));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        coordinator.refresh("old").await;
        assert_eq!(session.credentials(), Some(TokenPair::new("new", Some("r1".into()))));
    }

    #[tokio::test]
    async fn test_signed_out_session_is_not_refreshed() {
        let session = Arc::new(SessionState::new(Arc::new(MemoryStore::new())));
        let refresher = Arc::new(FakeRefresher::ok("new", None));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let outcome = coordinator.refresh("old").await;
        assert_eq!(
            outcome,
            RefreshOutcome::Failed {
                error: RefreshError::NoSession,
                led: false
            }
        );
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails() {
        let session = Arc::new(SessionState::new(Arc::new(MemoryStore::new())));
        session
            .complete_login(TokenPair::new("old", None), None, true)
            .await;
        let refresher = Arc::new(FakeRefresher::ok("new", None));
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let outcome = coordinator.refresh("old").await;
        assert_eq!(
            outcome,
            RefreshOutcome::Failed {
                error: RefreshError::NoRefreshToken,
                led: true
            }
        );
    }

    #[tokio::test]
    async fn test_dropped_leader_abandons_waiters() {
        let session = signed_in(Arc::new(MemoryStore::new())).await;
        let refresher = Arc::new(FakeRefresher {
            never_finish: true,
            ..FakeRefresher::ok("new", None)
        });
        let coordinator = coordinator(&session, &refresher, StorageFailurePolicy::ContinueInMemory);

        let mut leader = Box::pin(coordinator.refresh("old"));
        assert!(futures::poll!(&mut leader).is_pending());
        let mut waiter = Box::pin(coordinator.refresh("old"));
        assert!(futures::poll!(&mut waiter).is_pending());
        assert_eq!(coordinator.phase(), RefreshPhase::Refreshing);

        drop(leader);
        assert_eq!(coordinator.phase(), RefreshPhase::Idle);
        assert_eq!(
            waiter.await,
            RefreshOutcome::Failed {
                error: RefreshError::Abandoned,
                led: false
            }
        );
    }
}
