use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use benefits_client::auth::{redact, CredentialStore, SqliteCredentialStore};
use benefits_client::config::{Command, Config};
use benefits_client::streaming::{EventStreamClient, Notification, CONNECTION_STATUS_CHANGED};
use benefits_client::{ApiClient, ClientError};

/// Notification kinds followed by `watch` when none are given
const DEFAULT_KINDS: &[&str] = &[
    "payment-success",
    "stamp-added",
    "stamp-completed",
    "coupon-issued",
    "coupon-expiring",
];

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::info!("Benefits client {} starting...", env!("CARGO_PKG_VERSION"));
    tracing::debug!("API base URL: {}", config.api_base_url);

    let store = open_store(&config)?;

    match config.command.clone() {
        Command::Get { path } => run_get(&config, store, &path).await,
        Command::Watch { kinds } => run_watch(&config, store, kinds).await,
    }
}

/// Open the credential database, seeding it from ACCESS_TOKEN/REFRESH_TOKEN if given
fn open_store(config: &Config) -> Result<Arc<dyn CredentialStore>> {
    let store = SqliteCredentialStore::open(&config.credentials_db_file)?
        .with_session_expired_hook(Arc::new(|| {
            tracing::error!("Session expired - sign in again and update the stored refresh token");
        }));

    match (&config.seed_access_token, &config.seed_refresh_token) {
        (Some(access), Some(refresh)) => {
            tracing::info!("Seeding credentials from environment");
            store.set_tokens(access.clone(), refresh.clone());
        }
        (Some(access), None) => store.set_access_token(access.clone()),
        _ => {}
    }

    match store.access_token() {
        Some(token) => tracing::info!("Using access token {}", redact(&token)),
        None => tracing::warn!("No access token stored, first request will trigger a refresh"),
    }

    Ok(Arc::new(store))
}

async fn run_get(config: &Config, store: Arc<dyn CredentialStore>, path: &str) -> Result<()> {
    let client = ApiClient::new(&config.client_settings(), store)?;

    match client.get_json::<serde_json::Value>(path).await {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(ClientError::AuthExpired(msg)) => {
            tracing::error!("Session expired: {}", msg);
            anyhow::bail!("Authentication required")
        }
        Err(e) => Err(e).with_context(|| format!("GET {} failed", path)),
    }
}

async fn run_watch(
    config: &Config,
    store: Arc<dyn CredentialStore>,
    kinds: Vec<String>,
) -> Result<()> {
    let settings = config.stream_settings()?;
    let client = EventStreamClient::sse(
        settings,
        store,
        Duration::from_secs(config.http_connect_timeout),
    )?;

    let kinds: HashSet<String> = if kinds.is_empty() {
        DEFAULT_KINDS.iter().map(|k| k.to_string()).collect()
    } else {
        kinds.into_iter().collect()
    };

    for kind in &kinds {
        client.on(kind.clone(), log_notification);
    }
    client.on(CONNECTION_STATUS_CHANGED, |n: &Notification| {
        tracing::info!("Connection status: {}", n.payload["state"]);
    });

    client.start();
    tracing::info!("Watching {} notification kinds, press Ctrl+C to stop", kinds.len());

    tokio::select! {
        result = client.closed() => {
            result.context("Notification stream stopped")?;
        }
        _ = shutdown_signal() => {
            client.disconnect();
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn log_notification(notification: &Notification) {
    tracing::info!(
        kind = %notification.kind,
        received_at = %notification.received_at.to_rfc3339(),
        "{}",
        notification.payload
    );
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
