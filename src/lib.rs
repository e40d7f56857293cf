// Benefits client - resilient network layer
//
// Authenticated HTTP pipeline with single-flight token refresh, and the
// notification stream client with bounded reconnects.

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod streaming;

pub use auth::{Credential, CredentialStore, MemoryCredentialStore, RefreshCoordinator};
pub use error::{ClientError, RefreshError, Result};
pub use http_client::{ApiClient, ClientSettings};
pub use streaming::{ConnectionState, EventStreamClient, Notification, StreamSettings};
