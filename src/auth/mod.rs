// Authentication module
// Credential storage, token refresh and the single-flight refresh coordinator

mod coordinator;
mod credentials;
mod refresh;
mod store;
mod types;

pub use coordinator::RefreshCoordinator;
pub use credentials::SqliteCredentialStore;
pub use refresh::{user_agent, HttpRefresher, RefreshTransport};
pub use store::{CredentialStore, MemoryCredentialStore, SessionExpiredHook};
pub use types::{redact, Credential, TokenData};
