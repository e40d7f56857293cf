// Token refresh network call

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};

use super::types::{redact, RefreshRequest, RefreshResponse, TokenData};
use crate::error::{transport_error_kind, RefreshError};

/// Network call that exchanges a refresh token for a new access token
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenData, RefreshError>;
}

/// Get machine fingerprint for User-Agent
pub fn machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// User-Agent sent with every request from this crate
pub fn user_agent() -> String {
    format!(
        "benefits-client/{}-{}",
        env!("CARGO_PKG_VERSION"),
        machine_fingerprint()
    )
}

/// Refresh transport posting to the API's refresh endpoint
pub struct HttpRefresher {
    client: Client,
    url: Url,
}

impl HttpRefresher {
    /// `client` should carry the configured request timeout
    pub fn new(client: Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl RefreshTransport for HttpRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenData, RefreshError> {
        tracing::info!(
            url = %self.url,
            refresh_token = %redact(refresh_token),
            "Refreshing access token..."
        );

        let response = self
            .client
            .post(self.url.clone())
            .header("User-Agent", user_agent())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(
                    error_kind = transport_error_kind(&e),
                    error = %e,
                    "Refresh request failed in transit"
                );
                RefreshError::Transport(format!("Failed to send refresh request: {}", e))
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %error_text,
                "Refresh token rejected"
            );
            return Err(RefreshError::AuthExpired(format!(
                "Refresh token rejected: {} - {}",
                status, error_text
            )));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body = %error_text,
                "Token refresh failed"
            );
            return Err(RefreshError::Transport(format!(
                "Token refresh failed: {} - {}",
                status, error_text
            )));
        }

        let data: RefreshResponse = response.json().await.map_err(|e| {
            RefreshError::Transport(format!("Failed to parse refresh response: {}", e))
        })?;

        if data.access_token.is_empty() {
            return Err(RefreshError::Transport(
                "Refresh response does not contain accessToken".to_string(),
            ));
        }

        tracing::info!(
            rotated = data.refresh_token.is_some(),
            "Access token refreshed"
        );

        Ok(TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
        })
    }
}
