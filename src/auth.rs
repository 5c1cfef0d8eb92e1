use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, warn};

use crate::error::RefreshError;
use crate::util::lock_unpoisoned;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<SystemTime>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues and persists tokens. The executor never caches credentials past a
/// single attempt; it reads `current` every time.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn current(&self) -> Option<Credentials>;

    async fn refresh(&self, expired: Credentials) -> Result<Credentials, RefreshError>;

    fn replace(&self, credentials: Credentials);
}

/// Progress of one originating call through the refresh-and-replay cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    Armed,
    RefreshInFlight,
    Replayed,
    RefreshFailed,
}

impl RefreshState {
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Armed, Self::RefreshInFlight)
                | (Self::RefreshInFlight, Self::Replayed)
                | (Self::RefreshInFlight, Self::RefreshFailed)
        )
    }

    fn advance(&mut self, next: Self) {
        debug_assert!(
            self.can_transition_to(next),
            "invalid refresh transition {self:?} -> {next:?}"
        );
        *self = next;
    }
}

#[derive(Debug)]
pub(crate) enum RefreshVerdict {
    Replay,
    AlreadyReplayed,
    Failed(RefreshError),
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credentials, RefreshError>>>;

struct InFlightRefresh {
    generation: u64,
    future: RefreshFuture,
}

pub struct CredentialRefreshGuard {
    store: Arc<dyn CredentialStore>,
    in_flight: Mutex<Option<InFlightRefresh>>,
    generation: AtomicU64,
    refreshes: AtomicUsize,
}

impl std::fmt::Debug for CredentialRefreshGuard {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CredentialRefreshGuard")
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}

impl CredentialRefreshGuard {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Number of refresh calls actually issued to the store.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn current_access_token(&self) -> Option<String> {
        self.store
            .current()
            .map(|credentials| credentials.access_token)
    }

    /// Handles a 401 for one originating call. `used_token` is the access
    /// token that was current when the rejected attempt was prepared.
    pub(crate) async fn recover(
        &self,
        state: &mut RefreshState,
        used_token: Option<&str>,
    ) -> RefreshVerdict {
        if *state != RefreshState::Armed {
            return RefreshVerdict::AlreadyReplayed;
        }
        state.advance(RefreshState::RefreshInFlight);

        let Some(current) = self.store.current() else {
            state.advance(RefreshState::RefreshFailed);
            return RefreshVerdict::Failed(RefreshError::new("no credentials available"));
        };

        if used_token.is_some_and(|used| used != current.access_token) {
            debug!("credentials were replaced since the attempt was sent; replaying");
            state.advance(RefreshState::Replayed);
            return RefreshVerdict::Replay;
        }

        let (generation, future) = self.join_or_start(current);
        let result = future.await;
        self.finish(generation);

        match result {
            Ok(_) => {
                state.advance(RefreshState::Replayed);
                RefreshVerdict::Replay
            }
            Err(error) => {
                warn!(error = %error, "credential refresh failed");
                state.advance(RefreshState::RefreshFailed);
                RefreshVerdict::Failed(error)
            }
        }
    }

    fn join_or_start(&self, expired: Credentials) -> (u64, RefreshFuture) {
        let mut in_flight = lock_unpoisoned(&self.in_flight);
        if let Some(existing) = in_flight.as_ref() {
            debug!("joining in-flight credential refresh");
            return (existing.generation, existing.future.clone());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        debug!(generation, "starting credential refresh");

        let store = Arc::clone(&self.store);
        let future = async move {
            let refreshed = store.refresh(expired).await?;
            store.replace(refreshed.clone());
            Ok(refreshed)
        }
        .boxed()
        .shared();

        *in_flight = Some(InFlightRefresh {
            generation,
            future: future.clone(),
        });
        (generation, future)
    }

    fn finish(&self, generation: u64) {
        let mut in_flight = lock_unpoisoned(&self.in_flight);
        if in_flight
            .as_ref()
            .is_some_and(|existing| existing.generation == generation)
        {
            *in_flight = None;
        }
    }
}
