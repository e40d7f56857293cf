// Authentication types

use serde::{Deserialize, Serialize};

/// Access/refresh token pair held by a credential store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }
}

/// Token data from a successful refresh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenData {
    pub access_token: String,
    /// Present only when the server rotated the refresh token
    pub refresh_token: Option<String>,
}

/// Refresh endpoint request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Refresh endpoint response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Shorten a token for log output
pub fn redact(token: &str) -> String {
    format!("{}...", token.chars().take(8).collect::<String>())
}
