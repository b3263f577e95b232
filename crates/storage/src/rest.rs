//! HTTP transport against the origin's REST API.

use crate::error::{StorageError, StorageResult};
use crate::pool::RoundRobin;
use crate::ratelimit::{QuotaHeaders, RateLimiter, bucket_key};
use crate::traits::{ByteStream, Direction, MESSAGE_PAGE_SIZE, Transport};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use relaydrive_core::{DriverConfig, Message, Node, SignedUrl};
use reqwest::{StatusCode, header};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

const BOUNDARY: &str = "relaydrive-chunk-boundary";

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Transport talking to the origin over HTTPS.
///
/// Uploads rotate over the configured credentials and channels; each call
/// is admitted by the rate limiter bucket of the pair it uses.
#[derive(Debug)]
pub struct RestTransport {
    http: reqwest::Client,
    base_url: Url,
    tokens: RoundRobin<String>,
    channels: RoundRobin<String>,
    limiter: RateLimiter,
    cancel: CancellationToken,
}

impl RestTransport {
    /// Create a transport from validated configuration.
    pub fn new(config: &DriverConfig, cancel: CancellationToken) -> StorageResult<Self> {
        config.validate()?;

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| StorageError::Config(format!("invalid base url {base:?}: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self {
            http,
            base_url,
            tokens: RoundRobin::new("token", config.tokens.clone())?,
            channels: RoundRobin::new("channel", config.channels.clone())?,
            limiter: RateLimiter::new(cancel.clone()),
            cancel,
        })
    }

    fn messages_url(&self, channel: &str) -> StorageResult<Url> {
        self.base_url
            .join(&format!("channels/{channel}/messages"))
            .map_err(|e| StorageError::Config(format!("invalid channel {channel:?}: {e}")))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> StorageResult<reqwest::Response> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            result = request.send() => result.map_err(StorageError::from),
        }
    }

    fn check_cancelled(&self) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RestTransport {
    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn upload_attachment(&self, data: Bytes) -> StorageResult<Node> {
        let size = data.len() as u64;
        let filename = uuid::Uuid::new_v4().to_string();
        let body = multipart_body(&filename, &data);
        let mut backoff = Backoff::default();

        loop {
            self.check_cancelled()?;
            let token = self.tokens.next();
            let channel = self.channels.next();
            let url = self.messages_url(channel)?;

            let permit = self.limiter.acquire(&bucket_key(token, channel)).await?;
            let request = self
                .http
                .post(url)
                .header(header::AUTHORIZATION, token.as_str())
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(body.clone());

            let response = match self.send(request).await {
                Ok(response) => response,
                Err(StorageError::Http(e)) if e.is_timeout() => {
                    permit.release_failed();
                    // The message may exist already; re-sending could store the chunk twice.
                    tracing::warn!(%channel, %filename, "upload timed out, not retrying");
                    return Err(StorageError::Timeout {
                        operation: "upload_attachment",
                    });
                }
                Err(StorageError::Http(e)) if e.is_connect() => {
                    permit.release_failed();
                    tracing::debug!(%channel, error = %e, "upload could not connect, retrying");
                    backoff.wait(&self.cancel).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = response.status();
            let quota = QuotaHeaders::from_headers(response.headers());
            permit.release(response.headers());

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = quota.as_ref().and_then(|q| q.retry_after);
                tracing::warn!(%channel, ?retry_after, "upload rate limited");
                if !quota.as_ref().is_some_and(QuotaHeaders::defers_retry) {
                    backoff.wait(&self.cancel).await?;
                }
                continue;
            }
            if status.is_server_error() {
                tracing::debug!(%channel, %status, "upload failed on the server side, retrying");
                backoff.wait(&self.cancel).await?;
                continue;
            }
            if !status.is_success() {
                return Err(StorageError::Transport {
                    operation: "upload_attachment",
                    status: status.as_u16(),
                });
            }

            let message: Message = serde_json::from_slice(&response.bytes().await?)?;
            let attachment = message.first_attachment().ok_or_else(|| {
                StorageError::Protocol(format!("message {} has no attachment", message.id))
            })?;
            let signed = SignedUrl::from_origin(&attachment.url);
            tracing::debug!(message_id = message.id, %channel, "chunk uploaded");
            return Ok(Node::new(signed, size, message.id));
        }
    }

    #[instrument(skip(self, node), fields(message_id = node.message_id()))]
    async fn range_fetch(&self, node: &Node, start: u64, end: u64) -> StorageResult<ByteStream> {
        let url = Url::parse(&node.signed_url())
            .map_err(|e| StorageError::Protocol(format!("unusable chunk url: {e}")))?;
        let mut backoff = Backoff::default();

        loop {
            self.check_cancelled()?;
            let request = self
                .http
                .get(url.clone())
                .header(header::RANGE, format!("bytes={start}-{end}"));

            let response = match self.send(request).await {
                Ok(response) => response,
                Err(StorageError::Http(e)) if e.is_timeout() || e.is_connect() => {
                    tracing::debug!(error = %e, "range fetch failed, retrying");
                    backoff.wait(&self.cancel).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = response.status();
            if status.is_server_error() {
                tracing::debug!(%status, "range fetch failed on the server side, retrying");
                backoff.wait(&self.cancel).await?;
                continue;
            }
            if status != StatusCode::PARTIAL_CONTENT {
                return Err(StorageError::Transport {
                    operation: "range_fetch",
                    status: status.as_u16(),
                });
            }

            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(StorageError::from));
            return Ok(Box::pin(stream));
        }
    }

    #[instrument(skip(self))]
    async fn list_messages(
        &self,
        channel: &str,
        anchor: u64,
        direction: Direction,
    ) -> StorageResult<Vec<Message>> {
        let mut url = self.messages_url(channel)?;
        url.query_pairs_mut()
            .append_pair("limit", &MESSAGE_PAGE_SIZE.to_string())
            .append_pair(direction.as_str(), &anchor.to_string());
        let mut backoff = Backoff::default();

        loop {
            self.check_cancelled()?;
            let token = self.tokens.next();
            let permit = self.limiter.acquire(&bucket_key(token, channel)).await?;
            let request = self
                .http
                .get(url.clone())
                .header(header::AUTHORIZATION, token.as_str());

            let response = match self.send(request).await {
                Ok(response) => response,
                Err(StorageError::Http(e)) if e.is_timeout() || e.is_connect() => {
                    permit.release_failed();
                    tracing::debug!(error = %e, "listing messages failed, retrying");
                    backoff.wait(&self.cancel).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = response.status();
            let quota = QuotaHeaders::from_headers(response.headers());
            permit.release(response.headers());

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = quota.as_ref().and_then(|q| q.retry_after);
                tracing::warn!(?retry_after, "listing messages rate limited");
                if !quota.as_ref().is_some_and(QuotaHeaders::defers_retry) {
                    backoff.wait(&self.cancel).await?;
                }
                continue;
            }
            if status.is_server_error() {
                tracing::debug!(%status, "listing messages failed on the server side, retrying");
                backoff.wait(&self.cancel).await?;
                continue;
            }
            if status != StatusCode::OK {
                return Err(StorageError::Transport {
                    operation: "list_messages",
                    status: status.as_u16(),
                });
            }

            let messages: Vec<Message> = serde_json::from_slice(&response.bytes().await?)?;
            tracing::debug!(count = messages.len(), "listed messages");
            return Ok(messages);
        }
    }

    fn transport_name(&self) -> &'static str {
        "rest"
    }
}

/// Single-part multipart body carrying the chunk as a binary file.
fn multipart_body(filename: &str, data: &[u8]) -> Bytes {
    let head = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"{filename}\"; filename=\"{filename}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    );
    let tail = format!("\r\n--{BOUNDARY}--\r\n");

    let mut body = BytesMut::with_capacity(head.len() + data.len() + tail.len());
    body.put_slice(head.as_bytes());
    body.put_slice(data);
    body.put_slice(tail.as_bytes());
    body.freeze()
}

/// Exponential retry pacing, capped.
#[derive(Debug, Default)]
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(BACKOFF_MAX);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    async fn wait(&mut self, cancel: &CancellationToken) -> StorageResult<()> {
        let delay = self.next_delay();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
