// Credential store contract and the in-memory implementation

use std::sync::{Arc, RwLock};

use super::types::Credential;

/// Hook invoked when the refresh token is rejected
pub type SessionExpiredHook = Arc<dyn Fn() + Send + Sync>;

/// Holder of the current token pair.
///
/// Every accessor returns a snapshot. Callers read once per use and never
/// re-read in the middle of an operation.
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn refresh_token(&self) -> Option<String>;
    fn set_access_token(&self, token: String);
    fn set_tokens(&self, access_token: String, refresh_token: String);

    /// Clear both tokens and tell the application to re-authenticate.
    /// An empty store afterwards marks the session as already ended.
    fn on_session_expired(&self);
}

/// Credential store kept in process memory
#[derive(Default)]
pub struct MemoryCredentialStore {
    credential: RwLock<Credential>,
    on_expired: Option<SessionExpiredHook>,
}

impl MemoryCredentialStore {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: RwLock::new(credential),
            on_expired: None,
        }
    }

    /// Register the application callback for session expiry
    pub fn with_session_expired_hook(mut self, hook: SessionExpiredHook) -> Self {
        self.on_expired = Some(hook);
        self
    }

    /// Current token pair
    pub fn snapshot(&self) -> Credential {
        self.credential
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn write(&self, f: impl FnOnce(&mut Credential)) {
        let mut credential = self.credential.write().unwrap_or_else(|e| e.into_inner());
        f(&mut credential);
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.snapshot().access_token
    }

    fn refresh_token(&self) -> Option<String> {
        self.snapshot().refresh_token
    }

    fn set_access_token(&self, token: String) {
        self.write(|c| c.access_token = Some(token));
    }

    fn set_tokens(&self, access_token: String, refresh_token: String) {
        self.write(|c| {
            c.access_token = Some(access_token);
            c.refresh_token = Some(refresh_token);
        });
    }

    fn on_session_expired(&self) {
        tracing::warn!("Session expired, clearing stored credentials");
        self.write(|c| *c = Credential::default());
        if let Some(hook) = &self.on_expired {
            hook();
        }
    }
}
