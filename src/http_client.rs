use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{user_agent, CredentialStore, HttpRefresher, RefreshCoordinator};
use crate::error::{transport_error_kind, ClientError, Result};

/// Settings for the authenticated HTTP client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// API root, e.g. `https://api.example.com/v1`
    pub base_url: Url,
    /// Path of the token refresh endpoint, relative to `base_url`
    pub refresh_path: String,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    /// Applies to business requests and the refresh call alike
    pub request_timeout: Duration,
}

impl ClientSettings {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            refresh_path: "/auth/refresh".to_string(),
            max_connections: 20,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Which send of a logical request this is.
/// A logical request is sent at most twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Original,
    Replay,
}

impl Attempt {
    fn as_str(self) -> &'static str {
        match self {
            Attempt::Original => "original",
            Attempt::Replay => "replay",
        }
    }
}

/// Authenticated HTTP client.
///
/// Attaches the current bearer token to every request. A 401 triggers one
/// token refresh through the shared [`RefreshCoordinator`] and a single
/// replay of the original request.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    base_url: Url,

    store: Arc<dyn CredentialStore>,

    coordinator: Arc<RefreshCoordinator>,
}

impl ApiClient {
    /// Create a client that refreshes through the API's refresh endpoint
    pub fn new(settings: &ClientSettings, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = build_http_client(settings)?;
        let refresh_url = join_url(&settings.base_url, &settings.refresh_path)?;
        let refresher = Arc::new(HttpRefresher::new(client.clone(), refresh_url));
        let coordinator = Arc::new(RefreshCoordinator::new(store, refresher));

        Ok(Self::with_coordinator(
            client,
            settings.base_url.clone(),
            coordinator,
        ))
    }

    /// Create a client around an existing coordinator (and its credential store)
    pub fn with_coordinator(
        client: Client,
        base_url: Url,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            client,
            base_url,
            store: coordinator.store().clone(),
            coordinator,
        }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> Result<Url> {
        join_url(&self.base_url, path)
    }

    /// Start building a request against an API path.
    /// Run it with [`ApiClient::send`] so the token handling applies.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.client.request(method, self.url(path)?))
    }

    /// Build and execute a request through the pipeline
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let request = builder
            .build()
            .map_err(|e| ClientError::Internal(anyhow::anyhow!("Failed to build request: {}", e)))?;
        self.execute(request).await
    }

    /// Execute a request, refreshing the token and replaying once on 401.
    ///
    /// Non-2xx responses other than a recoverable 401 come back as
    /// [`ClientError::UpstreamRejected`].
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = request.url().clone();

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %url,
            "Sending HTTP request"
        );

        // Untouched copy for the replay; streaming bodies cannot be cloned
        let replay = request.try_clone();

        let sent_token = self.store.access_token();
        let request = attach_token(request, sent_token.as_deref());
        let response = self.dispatch(request, Attempt::Original, &request_id).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response, &request_id).await;
        }

        let Some(replay) = replay else {
            tracing::warn!(
                request_id = %request_id,
                "Received 401 but the request body cannot be replayed"
            );
            return check_status(response, &request_id).await;
        };

        tracing::warn!(request_id = %request_id, "Received 401, refreshing token and retrying...");

        let token = self.token_for_replay(sent_token.as_deref()).await.map_err(|e| {
            tracing::error!(request_id = %request_id, "Token refresh failed: {}", e);
            e
        })?;

        let replay = attach_token(replay, Some(&token));
        let response = self.dispatch(replay, Attempt::Replay, &request_id).await?;
        check_status(response, &request_id).await
    }

    /// Token to replay with: the store's current one if another caller
    /// already refreshed past the token we sent, otherwise a refreshed one.
    async fn token_for_replay(&self, sent_token: Option<&str>) -> Result<String> {
        if !self.coordinator.is_refreshing() {
            if let Some(current) = self.store.access_token() {
                if sent_token != Some(current.as_str()) {
                    tracing::debug!("Token already refreshed by another request");
                    return Ok(current);
                }
            }
        }

        Ok(self.coordinator.refresh().await?)
    }

    async fn dispatch(
        &self,
        request: Request,
        attempt: Attempt,
        request_id: &str,
    ) -> Result<Response> {
        let url = request.url().clone();

        match self.client.execute(request).await {
            Ok(response) => {
                tracing::debug!(
                    request_id = %request_id,
                    attempt = attempt.as_str(),
                    status = %response.status(),
                    "Received HTTP response"
                );
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request_id,
                    attempt = attempt.as_str(),
                    error_kind = transport_error_kind(&e),
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                Err(e.into())
            }
        }
    }

    /// GET a path and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        decode_json(response).await
    }

    /// POST a JSON body and decode the JSON response
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.send(self.request(Method::POST, path)?.json(body)).await?;
        decode_json(response).await
    }

    /// PUT a JSON body and decode the JSON response
    pub async fn put_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.send(self.request(Method::PUT, path)?.json(body)).await?;
        decode_json(response).await
    }

    /// PATCH a JSON body and decode the JSON response
    pub async fn patch_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self.send(self.request(Method::PATCH, path)?.json(body)).await?;
        decode_json(response).await
    }

    /// DELETE a path, ignoring the response body
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, path)?).await?;
        Ok(())
    }
}

/// Set the bearer header from `token`; without a token the request goes out
/// unauthenticated and the server decides.
pub fn attach_token(mut request: Request, token: Option<&str>) -> Request {
    let Some(token) = token else {
        return request;
    };

    match HeaderValue::from_str(&format!("Bearer {}", token)) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(_) => {
            tracing::warn!("Access token contains invalid header characters, sending without it");
        }
    }
    request
}

/// Build the pooled reqwest client used for API and refresh calls
pub fn build_http_client(settings: &ClientSettings) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(settings.max_connections)
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .user_agent(user_agent())
        .build()
        .context("Failed to create HTTP client")
        .map_err(ClientError::Internal)
}

/// Resolve `path` against `base`, keeping any path prefix of `base`
pub fn join_url(base: &Url, path: &str) -> Result<Url> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return Url::parse(path).map_err(|e| ClientError::Config(format!("Invalid URL {}: {}", path, e)));
    }

    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| ClientError::Config(format!("Invalid URL {}: {}", joined, e)))
}

async fn check_status(response: Response, request_id: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().clone();
    let error_text = response.text().await.unwrap_or_default();
    tracing::error!(
        request_id = %request_id,
        status = status.as_u16(),
        url = %url,
        response_body = %error_text,
        "HTTP request failed with error response"
    );

    Err(ClientError::UpstreamRejected {
        status: status.as_u16(),
        message: error_text,
    })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, MemoryCredentialStore};
    use mockito::Matcher;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client_for(
        server: &mockito::Server,
        credential: Credential,
    ) -> (ApiClient, Arc<MemoryCredentialStore>, Arc<AtomicUsize>) {
        let expired = Arc::new(AtomicUsize::new(0));
        let counter = expired.clone();
        let store = Arc::new(MemoryCredentialStore::new(credential).with_session_expired_hook(
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        let mut settings = ClientSettings::new(Url::parse(&server.url()).unwrap());
        settings.request_timeout = Duration::from_secs(5);
        let client = ApiClient::new(&settings, store.clone()).unwrap();
        (client, store, expired)
    }

    fn request(token: Option<&str>) -> Request {
        let req = Client::new()
            .get("http://localhost/coupons")
            .build()
            .unwrap();
        attach_token(req, token)
    }

    #[test]
    fn test_attach_token() {
        let req = request(Some("abc"));
        assert_eq!(req.headers()[AUTHORIZATION], "Bearer abc");
        assert!(req.headers()[AUTHORIZATION].is_sensitive());

        let req = request(None);
        assert!(req.headers().get(AUTHORIZATION).is_none());

        let req = request(Some("bad\ntoken"));
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_join_url() {
        let base = Url::parse("https://api.example.com/v1/").unwrap();
        assert_eq!(
            join_url(&base, "/coupons").unwrap().as_str(),
            "https://api.example.com/v1/coupons"
        );
        assert_eq!(
            join_url(&base, "stores?near=1").unwrap().as_str(),
            "https://api.example.com/v1/stores?near=1"
        );
        assert_eq!(
            join_url(&base, "https://cdn.example.com/x").unwrap().as_str(),
            "https://cdn.example.com/x"
        );
    }

    #[tokio::test]
    async fn test_success_passes_through_with_bearer() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", "/coupons")
            .match_header("authorization", "Bearer access-1")
            .with_status(200)
            .with_body(r#"{"coupons":[]}"#)
            .create_async()
            .await;
        let (client, _, _) = client_for(&server, Credential::new("access-1", "refresh-1"));

        let body: Value = client.get_json("/coupons").await.unwrap();
        assert_eq!(body, json!({"coupons": []}));
        api.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_refreshes_and_replays_once() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"access-2"}"#)
            .expect(1)
            .create_async()
            .await;
        let stale = server
            .mock("POST", "/stamps")
            .match_header("authorization", "Bearer access-1")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("POST", "/stamps")
            .match_header("authorization", "Bearer access-2")
            .match_body(Matcher::Json(json!({"storeId": 7})))
            .with_status(201)
            .with_body(r#"{"stamps":3}"#)
            .expect(1)
            .create_async()
            .await;
        let (client, store, expired) = client_for(&server, Credential::new("access-1", "refresh-1"));

        let body: Value = client.post_json("/stamps", &json!({"storeId": 7})).await.unwrap();

        assert_eq!(body["stamps"], 3);
        assert_eq!(store.access_token().as_deref(), Some("access-2"));
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        refresh.assert_async().await;
        stale.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_is_not_retried_again() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"access-2"}"#)
            .expect(1)
            .create_async()
            .await;
        let api = server
            .mock("GET", "/wallet")
            .with_status(401)
            .with_body("still unauthorized")
            .expect(2)
            .create_async()
            .await;
        let (client, _, _) = client_for(&server, Credential::new("access-1", "refresh-1"));

        let err = client.get_json::<Value>("/wallet").await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::UpstreamRejected { status: 401, ref message } if message == "still unauthorized"
        ));
        refresh.assert_async().await;
        api.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_401_error_passes_through() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;
        server
            .mock("GET", "/coupons/99")
            .with_status(404)
            .with_body("coupon not found")
            .create_async()
            .await;
        let (client, _, _) = client_for(&server, Credential::new("access-1", "refresh-1"));

        let err = client.get_json::<Value>("/coupons/99").await.unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert!(err.to_string().contains("coupon not found"));
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_rejection_expires_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(401)
            .create_async()
            .await;
        let api = server
            .mock("GET", "/wallet")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let (client, store, expired) = client_for(&server, Credential::new("access-1", "refresh-1"));

        let err = client.get_json::<Value>("/wallet").await.unwrap_err();

        assert!(matches!(err, ClientError::AuthExpired(_)));
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(store.access_token().is_none());
        api.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_server_error_keeps_credentials() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(502)
            .create_async()
            .await;
        server
            .mock("GET", "/wallet")
            .with_status(401)
            .create_async()
            .await;
        let (client, store, expired) = client_for(&server, Credential::new("access-1", "refresh-1"));

        let err = client.get_json::<Value>("/wallet").await.unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(expired.load(Ordering::SeqCst), 0);
        assert_eq!(store.refresh_token().as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_already_refreshed_token_skips_refresh() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;
        let (client, store, _) = client_for(&server, Credential::new("access-1", "refresh-1"));

        // Another caller refreshed between our send and our 401
        store.set_access_token("access-2".to_string());

        let token = client.token_for_replay(Some("access-1")).await.unwrap();
        assert_eq!(token, "access-2");
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_token_sends_unauthenticated() {
        let mut server = mockito::Server::new_async().await;
        let api = server
            .mock("GET", "/public/stores")
            .match_header("authorization", Matcher::Missing)
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;
        let (client, _, _) = client_for(&server, Credential::default());

        let stores: Vec<Value> = client.get_json("/public/stores").await.unwrap();
        assert!(stores.is_empty());
        api.assert_async().await;
    }
}
