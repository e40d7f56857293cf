// Stream transport: opens a push connection and yields parsed frames

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Url};
use std::pin::Pin;
use std::time::Duration;

use super::sse::{SseFrame, SseParser};
use crate::auth::user_agent;
use crate::error::{ClientError, Result};

/// Frames of one open connection.
/// The stream ending or yielding an error means the connection is gone;
/// dropping it closes the connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// Opens server-push connections
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, url: Url) -> Result<FrameStream>;
}

/// Server-sent events over a long-lived HTTP GET
pub struct SseTransport {
    client: Client,
}

impl SseTransport {
    /// `client` must not carry a total request timeout: the response body
    /// stays open for the life of the connection.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Transport with its own client limited only by a connect timeout
    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|e| ClientError::Internal(anyhow::anyhow!("Failed to create SSE client: {}", e)))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn open(&self, url: Url) -> Result<FrameStream> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ClientError::UpstreamRejected {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let mut body = response.bytes_stream();
        let frames = async_stream::stream! {
            let mut parser = SseParser::new();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        for frame in parser.feed(&chunk) {
                            yield Ok(frame);
                        }
                    }
                    Err(e) => {
                        yield Err(ClientError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(frames))
    }
}
