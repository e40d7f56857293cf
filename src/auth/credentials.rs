// Credential persistence in a SQLite database

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use super::store::{CredentialStore, SessionExpiredHook};
use super::types::Credential;

const TOKENS_KEY: &str = "benefits:tokens";

/// Row payload stored under `TOKENS_KEY`
#[derive(Serialize, Deserialize)]
struct StoredTokens {
    access_token: Option<String>,
    refresh_token: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Credential store backed by an `auth_kv` table.
///
/// Reads are served from an in-memory snapshot; every write goes through to
/// the database.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    credential: RwLock<Credential>,
    on_expired: Option<SessionExpiredHook>,
}

impl SqliteCredentialStore {
    /// Open (or create) the database and load the stored token pair
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create credentials directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        let credential = load_tokens(&conn)?;
        tracing::info!(
            "Loaded credentials from {} (access token: {}, refresh token: {})",
            path.display(),
            credential.access_token.is_some(),
            credential.refresh_token.is_some()
        );

        Ok(Self {
            conn: Mutex::new(conn),
            credential: RwLock::new(credential),
            on_expired: None,
        })
    }

    /// Register the application callback for session expiry
    pub fn with_session_expired_hook(mut self, hook: SessionExpiredHook) -> Self {
        self.on_expired = Some(hook);
        self
    }

    fn snapshot(&self) -> Credential {
        self.credential
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut Credential)) {
        let updated = {
            let mut credential = self.credential.write().unwrap_or_else(|e| e.into_inner());
            f(&mut credential);
            credential.clone()
        };

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = save_tokens(&conn, &updated) {
            tracing::error!("Failed to persist credentials: {:#}", e);
        }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.snapshot().access_token
    }

    fn refresh_token(&self) -> Option<String> {
        self.snapshot().refresh_token
    }

    fn set_access_token(&self, token: String) {
        self.update(|c| c.access_token = Some(token));
    }

    fn set_tokens(&self, access_token: String, refresh_token: String) {
        self.update(|c| {
            c.access_token = Some(access_token);
            c.refresh_token = Some(refresh_token);
        });
    }

    fn on_session_expired(&self) {
        tracing::warn!("Session expired, removing stored credentials");
        {
            let mut credential = self.credential.write().unwrap_or_else(|e| e.into_inner());
            *credential = Credential::default();
        }
        {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = conn.execute("DELETE FROM auth_kv WHERE key = ?", [TOKENS_KEY]) {
                tracing::error!("Failed to delete stored credentials: {}", e);
            }
        }
        if let Some(hook) = &self.on_expired {
            hook();
        }
    }
}

fn load_tokens(conn: &Connection) -> Result<Credential> {
    let json: Option<String> = conn
        .query_row(
            "SELECT value FROM auth_kv WHERE key = ?",
            [TOKENS_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to load token data from SQLite")?;

    let Some(json) = json else {
        return Ok(Credential::default());
    };

    let stored: StoredTokens =
        serde_json::from_str(&json).context("Failed to parse token data from SQLite")?;

    Ok(Credential {
        access_token: stored.access_token,
        refresh_token: stored.refresh_token,
    })
}

fn save_tokens(conn: &Connection, credential: &Credential) -> Result<()> {
    let stored = StoredTokens {
        access_token: credential.access_token.clone(),
        refresh_token: credential.refresh_token.clone(),
        updated_at: Some(Utc::now()),
    };
    let json = serde_json::to_string(&stored).context("Failed to serialize token data")?;

    conn.execute(
        "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [TOKENS_KEY, json.as_str()],
    )
    .context("Failed to write token data to SQLite")?;

    Ok(())
}
