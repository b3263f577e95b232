//! Signed attachment URL codec.
//!
//! Attachment URLs handed out by the origin carry their signature window in
//! three query parameters:
//!
//! - `ex`: expiry, unix seconds as lowercase hex
//! - `is`: issue time, unix seconds as lowercase hex
//! - `hm`: opaque signature
//!
//! Chunk records store the URL with the query stripped and carry the three
//! values as separate fields, so the signature can be swapped without
//! touching the canonical location.

use crate::error::{Error, Result};
use url::Url;

/// A decoded attachment URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedUrl {
    /// Canonical URL with query and fragment removed.
    pub url: String,
    /// Expiry time in unix seconds.
    pub expires_at: i64,
    /// Issue time in unix seconds.
    pub issued_at: i64,
    /// Signature, copied verbatim.
    pub signature: String,
}

impl SignedUrl {
    /// Decode a signed URL supplied by a caller.
    pub fn parse(input: &str) -> Result<Self> {
        let parsed = Url::parse(input)
            .map_err(|e| Error::SignedUrl(format!("unparsable url {input:?}: {e}")))?;

        let mut ex = None;
        let mut is = None;
        let mut hm = None;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "ex" => ex = Some(value.into_owned()),
                "is" => is = Some(value.into_owned()),
                "hm" => hm = Some(value.into_owned()),
                _ => {}
            }
        }

        let expires_at = parse_hex("ex", ex.as_deref())?;
        let issued_at = parse_hex("is", is.as_deref())?;
        let signature = hm
            .filter(|hm| !hm.is_empty())
            .ok_or_else(|| Error::SignedUrl("missing hm parameter".to_string()))?;

        let mut clean = parsed;
        clean.set_query(None);
        clean.set_fragment(None);

        Ok(Self {
            url: clean.to_string(),
            expires_at,
            issued_at,
            signature,
        })
    }

    /// Decode a signed URL returned by the origin service.
    ///
    /// The origin always signs the URLs it issues, so a malformed one means
    /// the service contract is broken and nothing downstream can be trusted.
    ///
    /// # Panics
    ///
    /// Panics if the URL cannot be decoded.
    pub fn from_origin(input: &str) -> Self {
        match Self::parse(input) {
            Ok(signed) => signed,
            Err(e) => panic!("origin returned a malformed attachment url: {e}"),
        }
    }

    /// Encode into a fetchable URL.
    pub fn encode(&self) -> String {
        encode(&self.url, self.expires_at, self.issued_at, &self.signature)
    }

    /// Whether the signature has lapsed at `now` (unix seconds).
    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// Build a fetchable URL from a canonical URL and its signature window.
///
/// Parameters are written in the order the origin issues them, including
/// its trailing separator, so that decoding then encoding an origin URL
/// reproduces it exactly.
pub fn encode(url: &str, expires_at: i64, issued_at: i64, signature: &str) -> String {
    let signature: String = url::form_urlencoded::byte_serialize(signature.as_bytes()).collect();
    format!("{url}?ex={expires_at:x}&is={issued_at:x}&hm={signature}&")
}

/// Extract the channel id from an attachment URL.
///
/// Attachment paths have the form `/attachments/<channel>/<attachment>/<name>`.
pub fn channel_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let mut segments = parsed.path_segments()?;
    segments.find(|segment| *segment == "attachments")?;
    segments
        .next()
        .filter(|channel| !channel.is_empty() && channel.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
}

fn parse_hex(name: &str, value: Option<&str>) -> Result<i64> {
    let value = value.ok_or_else(|| Error::SignedUrl(format!("missing {name} parameter")))?;
    u32::from_str_radix(value, 16)
        .map(i64::from)
        .map_err(|e| Error::SignedUrl(format!("{name} is not a hex timestamp: {value:?}: {e}")))
}
