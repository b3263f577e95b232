//! Chunk records and the origin's message shape.

use crate::signed_url::{self, SignedUrl};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Metadata describing one stored chunk.
///
/// `size` and `message_id` are fixed at upload time. The signature window
/// can only change through [`Node::apply_signed_url`], which is what expiry
/// refresh uses. Catalogs persist nodes as JSON with the field names `url`,
/// `size`, `mid`, `ex`, `is` and `hm`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    url: String,
    size: u64,
    #[serde(rename = "mid")]
    message_id: u64,
    #[serde(rename = "ex")]
    expires_at: i64,
    #[serde(rename = "is")]
    issued_at: i64,
    #[serde(rename = "hm")]
    signature: String,
}

impl Node {
    /// Create a record for a freshly uploaded chunk.
    pub fn new(signed: SignedUrl, size: u64, message_id: u64) -> Self {
        Self {
            url: signed.url,
            size,
            message_id,
            expires_at: signed.expires_at,
            issued_at: signed.issued_at,
            signature: signed.signature,
        }
    }

    /// Canonical URL without signature.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Payload size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Id of the message hosting this chunk.
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// Signature expiry in unix seconds.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Signature issue time in unix seconds.
    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }

    /// Opaque signature.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The fetchable URL with the current signature applied.
    pub fn signed_url(&self) -> String {
        signed_url::encode(&self.url, self.expires_at, self.issued_at, &self.signature)
    }

    /// Channel the hosting message lives in, parsed from the URL.
    pub fn channel_id(&self) -> Option<String> {
        signed_url::channel_id(&self.url)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Replace the location and signature window with a freshly issued one.
    pub fn apply_signed_url(&mut self, signed: SignedUrl) {
        self.url = signed.url;
        self.expires_at = signed.expires_at;
        self.issued_at = signed.issued_at;
        self.signature = signed.signature;
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("url", &self.url)
            .field("size", &self.size)
            .field("message_id", &self.message_id)
            .field("expires_at", &self.expires_at)
            .field("signature", &"<redacted>")
            .finish()
    }
}

/// A message as returned by the origin's REST API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// The attachment carrying chunk data (chunks are uploaded one per message).
    pub fn first_attachment(&self) -> Option<&Attachment> {
        self.attachments.first()
    }
}

/// A file attached to a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub filename: String,
}

/// Snowflake ids travel as JSON strings but are numbers domain-side.
mod snowflake {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(id) => Ok(id),
            Raw::Text(text) => text
                .parse()
                .map_err(|e| serde::de::Error::custom(format!("invalid snowflake {text:?}: {e}"))),
        }
    }
}
