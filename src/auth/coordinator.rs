// Single-flight token refresh
//
// At most one refresh call runs per coordinator. Callers arriving while it is
// in flight wait on a oneshot continuation and receive the same outcome.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::refresh::RefreshTransport;
use super::store::CredentialStore;
use super::types::redact;
use crate::error::RefreshError;

type RefreshOutcome = Result<String, RefreshError>;

/// Continuation for a caller queued behind the in-flight refresh
type PendingRequest = oneshot::Sender<RefreshOutcome>;

#[derive(Default)]
struct RefreshState {
    is_refreshing: bool,
    queue: VecDeque<PendingRequest>,
}

/// Single-flight refresh controller
pub struct RefreshCoordinator {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn RefreshTransport>,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<dyn CredentialStore>, transport: Arc<dyn RefreshTransport>) -> Self {
        Self {
            store,
            transport,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Credential store this coordinator writes to
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Whether a refresh call is currently in flight
    pub fn is_refreshing(&self) -> bool {
        self.lock().is_refreshing
    }

    /// Number of callers queued behind the in-flight refresh
    pub fn waiting(&self) -> usize {
        self.lock().queue.len()
    }

    /// Obtain a fresh access token.
    ///
    /// Starts the refresh call if none is running, otherwise waits for the
    /// running one. Every caller settles with the outcome of exactly one
    /// network call.
    pub async fn refresh(&self) -> RefreshOutcome {
        let waiter = {
            let mut state = self.lock();
            if state.is_refreshing {
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(tx);
                tracing::debug!(queued = state.queue.len(), "Refresh in flight, queueing caller");
                Some(rx)
            } else {
                state.is_refreshing = true;
                None
            }
        };

        if let Some(rx) = waiter {
            return rx.await.unwrap_or(Err(RefreshError::Aborted));
        }

        let in_flight = InFlight {
            coordinator: self,
            armed: true,
        };
        let outcome = self.perform_refresh().await;
        in_flight.complete(&outcome);
        outcome
    }

    async fn perform_refresh(&self) -> RefreshOutcome {
        let Some(refresh_token) = self.store.refresh_token() else {
            // No access token either: the session already ended and the
            // callback has run for it
            if self.store.access_token().is_some() {
                tracing::warn!("No refresh token available, ending session");
                self.store.on_session_expired();
            } else {
                tracing::debug!("Session already cleared, not refreshing");
            }
            return Err(RefreshError::AuthExpired(
                "No refresh token available".to_string(),
            ));
        };

        match self.transport.refresh(&refresh_token).await {
            Ok(data) => {
                let access_token = data.access_token.clone();
                match data.refresh_token {
                    Some(rotated) => self.store.set_tokens(data.access_token, rotated),
                    None => self.store.set_access_token(data.access_token),
                }
                tracing::debug!(token = %redact(&access_token), "Stored refreshed access token");
                Ok(access_token)
            }
            Err(e) if e.is_auth_expired() => {
                tracing::error!("Refresh token rejected: {}", e);
                self.store.on_session_expired();
                Err(e)
            }
            Err(e) => {
                // Credentials stay as they are: the session may still be valid
                tracing::warn!("Token refresh failed, keeping credentials: {}", e);
                Err(e)
            }
        }
    }

    /// Reset the in-flight flag and hand the outcome to every queued caller
    fn settle(&self, outcome: &RefreshOutcome) {
        let queue = {
            let mut state = self.lock();
            state.is_refreshing = false;
            std::mem::take(&mut state.queue)
        };

        if !queue.is_empty() {
            tracing::debug!(
                waiters = queue.len(),
                success = outcome.is_ok(),
                "Draining refresh queue"
            );
        }

        for pending in queue {
            // Receiver gone means the caller was dropped; nothing to deliver
            let _ = pending.send(outcome.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Settles the coordinator even if the refreshing future is dropped mid-call
struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl InFlight<'_> {
    fn complete(mut self, outcome: &RefreshOutcome) {
        self.armed = false;
        self.coordinator.settle(outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("Token refresh abandoned, rejecting queued callers");
            self.coordinator.settle(&Err(RefreshError::Aborted));
        }
    }
}
