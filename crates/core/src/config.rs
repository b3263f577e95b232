//! Driver configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Default REST API base URL of the origin service.
pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v9";

/// Storage driver configuration.
///
/// `tokens` and `channels` accept either a list or a single comma separated
/// string, so `RELAYDRIVE_TOKENS=a,b` works the same as `tokens = ["a", "b"]`.
#[derive(Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Bot credentials, used round-robin. Sent verbatim as `Authorization`.
    #[serde(deserialize_with = "comma_list")]
    pub tokens: Vec<String>,
    /// Channel ids chunks are posted into, used round-robin.
    #[serde(deserialize_with = "comma_list")]
    pub channels: Vec<String>,
    /// Maximum chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Upload full chunks concurrently instead of inline.
    /// Memory use grows to roughly `chunk_size * upload_concurrency`.
    #[serde(default)]
    pub async_write: bool,
    /// Width of the parallel upload pool (default: number of channels).
    #[serde(default)]
    pub upload_concurrency: Option<usize>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// REST API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    concat!("relaydrive/", env!("CARGO_PKG_VERSION")).to_string()
}

impl DriverConfig {
    /// Create a configuration with defaults for everything but the pools.
    pub fn new(tokens: Vec<String>, channels: Vec<String>) -> Self {
        Self {
            tokens,
            channels,
            chunk_size: default_chunk_size(),
            async_write: false,
            upload_concurrency: None,
            request_timeout_secs: default_request_timeout_secs(),
            base_url: default_base_url(),
            user_agent: default_user_agent(),
        }
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.is_empty() || self.channels.is_empty() {
            return Err(Error::Config(format!(
                "not enough tokens or channels: tokens {} channels {}",
                self.tokens.len(),
                self.channels.len()
            )));
        }
        if self.tokens.iter().any(|token| token.trim().is_empty()) {
            return Err(Error::Config("tokens must not be blank".to_string()));
        }
        if let Some(channel) = self
            .channels
            .iter()
            .find(|channel| channel.is_empty() || !channel.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(Error::Config(format!(
                "channel ids must be numeric, got {channel:?}"
            )));
        }
        if !(crate::MIN_CHUNK_SIZE..=crate::MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::InvalidChunkSize {
                size: self.chunk_size,
                min: crate::MIN_CHUNK_SIZE,
                max: crate::MAX_CHUNK_SIZE,
            });
        }
        if self.upload_concurrency == Some(0) {
            return Err(Error::Config(
                "upload_concurrency must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Width of the parallel upload pool.
    pub fn upload_concurrency(&self) -> usize {
        self.upload_concurrency
            .unwrap_or(self.channels.len())
            .max(1)
    }

    /// Get the request timeout as a Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("tokens", &format!("<{} redacted>", self.tokens.len()))
            .field("channels", &self.channels)
            .field("chunk_size", &self.chunk_size)
            .field("async_write", &self.async_write)
            .field("upload_concurrency", &self.upload_concurrency)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListInput {
    List(Vec<Scalar>),
    One(Scalar),
}

// Environment providers hand over "a,b" strings and bare numbers for ids.
fn comma_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let scalars = match ListInput::deserialize(deserializer)? {
        ListInput::List(items) => items,
        ListInput::One(item) => vec![item],
    };
    let mut values = Vec::new();
    for scalar in scalars {
        match scalar {
            Scalar::Number(n) => values.push(n.to_string()),
            Scalar::Text(text) => values.extend(
                text.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(str::to_string),
            ),
        }
    }
    Ok(values)
}
