use futures::StreamExt;
use reqwest::Url;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::bus::{EventBus, SubscriptionId};
use super::events::{ConnectionState, Notification};
use super::reconnect::ReconnectPolicy;
use super::sse::SseFrame;
use super::transport::{FrameStream, SseTransport, StreamTransport};
use crate::auth::CredentialStore;
use crate::error::{ClientError, Result};

// ==================================================================================================
// Settings
// ==================================================================================================

/// Settings for the notification stream
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Stream endpoint, without the token
    pub url: Url,
    /// Query parameter carrying the access token
    pub token_param: String,
    pub reconnect: ReconnectPolicy,
    /// Treat the connection as dead when no frame (pings included) arrives
    /// for this long
    pub idle_timeout: Option<Duration>,
}

impl StreamSettings {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            token_param: "token".to_string(),
            reconnect: ReconnectPolicy::default(),
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// Stream URL with the access token as a query parameter.
/// The push transport cannot carry custom headers.
pub fn stream_url(base: &Url, token_param: &str, token: Option<&str>) -> Url {
    let mut url = base.clone();
    let Some(token) = token else {
        return url;
    };

    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != token_param)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(token_param, token);
    url
}

// ==================================================================================================
// Shared state
// ==================================================================================================

struct Lifecycle {
    closed: bool,
    driver: Option<JoinHandle<()>>,
}

/// State shared between the client handle and its driver task
struct Shared {
    state: watch::Sender<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
    bus: EventBus,
    failures: AtomicU32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Move to `next` unless the client was torn down. Subscribers of
    /// `connection-status-changed` hear about every actual change.
    fn transition(&self, next: ConnectionState) {
        let changed = {
            let lifecycle = self.lock();
            if lifecycle.closed {
                return;
            }
            self.state.send_if_modified(|state| {
                if *state == next {
                    false
                } else {
                    *state = next;
                    true
                }
            })
        };

        if changed {
            tracing::info!(state = %next, "Event stream state changed");
            self.bus.emit(&Notification::connection_status(next));
        }
    }

    fn dispatch_frame(&self, frame: &SseFrame) {
        match frame.event.as_str() {
            "connect" => {
                tracing::debug!("Event stream handshake acknowledged");
            }
            "ping" => {
                tracing::trace!("Event stream keepalive");
            }
            _ => match Notification::from_json(&frame.data) {
                Ok(_) if self.is_closed() => {
                    tracing::debug!("Client torn down, dropping notification");
                }
                Ok(notification) => {
                    let delivered = self.bus.emit(&notification);
                    tracing::debug!(
                        kind = %notification.kind,
                        subscribers = delivered,
                        "Dispatched notification"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        event = %frame.event,
                        "Dropping malformed notification frame: {} - {}",
                        e,
                        frame.data.chars().take(100).collect::<String>()
                    );
                }
            },
        }
    }
}

// ==================================================================================================
// Client
// ==================================================================================================

/// Persistent notification stream with bounded reconnects.
///
/// Starts in `Connecting`. Every lost connection passes through
/// `Disconnected`; from there the client either moves to `Reconnecting` and
/// waits out the backoff delay, or, once `max_attempts` consecutive failures
/// are used up, goes `Disconnected -> Failed` for good. Build a new client to
/// try again.
pub struct EventStreamClient {
    shared: Arc<Shared>,
    settings: Arc<StreamSettings>,
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn StreamTransport>,
}

impl EventStreamClient {
    pub fn new(
        settings: StreamSettings,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn StreamTransport>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            shared: Arc::new(Shared {
                state,
                lifecycle: Mutex::new(Lifecycle {
                    closed: false,
                    driver: None,
                }),
                bus: EventBus::new(),
                failures: AtomicU32::new(0),
            }),
            settings: Arc::new(settings),
            store,
            transport,
        }
    }

    /// Client over server-sent events
    pub fn sse(
        settings: StreamSettings,
        store: Arc<dyn CredentialStore>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let transport = SseTransport::with_connect_timeout(connect_timeout)?;
        Ok(Self::new(settings, store, Arc::new(transport)))
    }

    /// Spawn the connection driver. No-op if already started or torn down.
    pub fn start(&self) {
        let mut lifecycle = self.shared.lock();
        if lifecycle.closed || lifecycle.driver.is_some() {
            return;
        }

        let driver = Driver {
            shared: self.shared.clone(),
            settings: self.settings.clone(),
            store: self.store.clone(),
            transport: self.transport.clone(),
        };
        lifecycle.driver = Some(tokio::spawn(driver.run()));
        tracing::info!(url = %self.settings.url, "Event stream started");
    }

    /// Subscribe to notifications of `kind`
    pub fn on<F>(&self, kind: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.bus.on(kind, callback)
    }

    pub fn off(&self, kind: &str, id: SubscriptionId) -> bool {
        self.shared.bus.off(kind, id)
    }

    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.shared.bus.subscriber_count(kind)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Consecutive failures since the last successful open
    pub fn failure_count(&self) -> u32 {
        self.shared.failures.load(Ordering::SeqCst)
    }

    /// Receiver for state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the stream ends: `Ok` after [`disconnect`](Self::disconnect),
    /// [`ClientError::StreamExhausted`] once reconnects are used up.
    pub async fn closed(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Failed {
                return Err(ClientError::StreamExhausted {
                    attempts: self.settings.reconnect.max_attempts,
                });
            }
            if self.shared.is_closed() || rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Tear down: close the connection, cancel any pending reconnect and
    /// drop all subscriptions. Calling it again does nothing.
    pub fn disconnect(&self) {
        let driver = {
            let mut lifecycle = self.shared.lock();
            if lifecycle.closed {
                return;
            }
            lifecycle.closed = true;
            self.shared.state.send_modify(|state| {
                if *state != ConnectionState::Failed {
                    *state = ConnectionState::Disconnected;
                }
            });
            lifecycle.driver.take()
        };

        if let Some(driver) = driver {
            driver.abort();
        }
        self.shared.bus.clear();
        tracing::info!("Event stream disconnected");
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ==================================================================================================
// Driver
// ==================================================================================================

/// Connection loop running on its own task
struct Driver {
    shared: Arc<Shared>,
    settings: Arc<StreamSettings>,
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn StreamTransport>,
}

impl Driver {
    async fn run(self) {
        let policy = &self.settings.reconnect;
        let mut failures = 0u32;

        loop {
            if self.shared.is_closed() {
                return;
            }
            self.shared.transition(ConnectionState::Connecting);

            match self.connect().await {
                Ok(frames) => {
                    failures = 0;
                    self.shared.failures.store(0, Ordering::SeqCst);
                    self.shared.transition(ConnectionState::Connected);
                    self.pump(frames).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Event stream connection failed");
                }
            }

            self.shared.transition(ConnectionState::Disconnected);

            let Some(delay) = policy.next_delay(failures) else {
                tracing::error!(
                    attempts = failures,
                    "Event stream reconnect attempts exhausted, giving up"
                );
                self.shared.transition(ConnectionState::Failed);
                return;
            };

            failures += 1;
            self.shared.failures.store(failures, Ordering::SeqCst);
            self.shared.transition(ConnectionState::Reconnecting);
            tracing::info!(
                attempt = failures,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting event stream"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> Result<FrameStream> {
        // One snapshot of the token per attempt
        let token = self.store.access_token();
        if token.is_none() {
            tracing::warn!("No access token available, opening event stream unauthenticated");
        }

        let url = stream_url(&self.settings.url, &self.settings.token_param, token.as_deref());
        tracing::debug!(url = %self.settings.url, "Opening event stream");
        self.transport.open(url).await
    }

    /// Forward frames until the connection errors, closes, or goes idle
    async fn pump(&self, mut frames: FrameStream) {
        loop {
            let next = match self.settings.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, frames.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(
                            idle_secs = idle.as_secs(),
                            "No frames received within idle timeout"
                        );
                        return;
                    }
                },
                None => frames.next().await,
            };

            match next {
                Some(Ok(frame)) => self.shared.dispatch_frame(&frame),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Event stream transport error");
                    return;
                }
                None => {
                    tracing::info!("Event stream closed by server");
                    return;
                }
            }
        }
    }
}
