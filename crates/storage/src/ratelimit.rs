//! Admission control driven by the origin's rate-limit headers.
//!
//! The origin tells each caller how much quota is left in a bucket and when
//! the bucket resets. Buckets are scoped to a (credential, destination)
//! pair and are only known once a response for that pair has been seen:
//!
//! - No bucket yet: the caller is admitted immediately.
//! - Quota left: the caller reserves one unit and is admitted.
//! - Quota exhausted: the caller sleeps until the reset deadline, after
//!   which the bucket is treated as fully replenished.
//!
//! Every admission hands out a [`Permit`]. Settling the permit with the
//! response headers makes the bucket authoritative again; settling without
//! headers (network failure, dropped request) counts as one consumed unit.

use crate::error::{StorageError, StorageResult};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const RESET: &str = "x-ratelimit-reset";
const RESET_AFTER: &str = "x-ratelimit-reset-after";
const RETRY_AFTER: &str = "retry-after";

/// Bucket key for a (credential, destination) pair.
///
/// Keys embed the credential and must never be logged.
pub fn bucket_key(token: &str, channel: &str) -> String {
    format!("{token}/channels/{channel}/messages")
}

/// Quota information carried by one response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time until the bucket resets.
    pub reset_after: Option<Duration>,
    /// Back-off demanded by a 429.
    pub retry_after: Option<Duration>,
}

impl QuotaHeaders {
    /// Parse quota headers. Returns `None` when the response carries none.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let reset_after = header_secs(headers, RESET_AFTER).or_else(|| {
            let reset = header_f64(headers, RESET)?;
            let now = time::OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9;
            Duration::try_from_secs_f64((reset - now).max(0.0)).ok()
        });

        let quota = Self {
            limit: header_u32(headers, LIMIT),
            remaining: header_u32(headers, REMAINING),
            reset_after,
            retry_after: header_secs(headers, RETRY_AFTER),
        };
        (quota != Self::default()).then_some(quota)
    }

    /// Whether a bucket updated with these headers holds the next call back.
    ///
    /// A 429 without a positive deadline leaves the bucket open, so the
    /// caller has to pace its own retry.
    pub fn defers_retry(&self) -> bool {
        let positive = |delay: Option<Duration>| delay.is_some_and(|d| !d.is_zero());
        positive(self.retry_after) || (self.remaining == Some(0) && positive(self.reset_after))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name)?.parse().ok()
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name)?
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<Duration> {
    Duration::try_from_secs_f64(header_f64(headers, name)?.max(0.0)).ok()
}

#[derive(Debug)]
struct BucketState {
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
}

impl BucketState {
    fn replenish_if_due(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|reset| now >= reset) {
            self.remaining = self.limit.max(1);
            self.reset_at = None;
        }
    }

    fn apply(&mut self, quota: &QuotaHeaders, now: Instant) {
        if let Some(limit) = quota.limit {
            self.limit = limit;
        }
        if let Some(remaining) = quota.remaining {
            self.remaining = remaining;
        }
        if let Some(after) = quota.reset_after {
            self.reset_at = Some(now + after);
        }
        if let Some(after) = quota.retry_after {
            let until = now + after;
            self.remaining = 0;
            self.reset_at = Some(self.reset_at.map_or(until, |reset| reset.max(until)));
        }
    }
}

#[derive(Debug)]
struct Bucket {
    state: Mutex<BucketState>,
}

impl Bucket {
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("rate limit bucket lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Per-bucket admission gate.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    cancel: CancellationToken,
}

impl RateLimiter {
    /// Create a limiter whose waits abort when `cancel` fires.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            buckets: DashMap::new(),
            cancel,
        }
    }

    /// Wait until `key` admits one more call.
    ///
    /// Fails only with [`StorageError::Cancelled`].
    pub async fn acquire(&self, key: &str) -> StorageResult<Permit<'_>> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let Some(bucket) = self.bucket(key) else {
                return Ok(Permit::new(self, key, false));
            };

            let deadline = {
                let mut state = bucket.lock();
                state.replenish_if_due(Instant::now());
                if state.remaining > 0 {
                    state.remaining -= 1;
                    return Ok(Permit::new(self, key, true));
                }
                match state.reset_at {
                    Some(reset) => reset,
                    // Exhausted with no known reset; let the response decide.
                    None => return Ok(Permit::new(self, key, false)),
                }
            };

            tracing::debug!(
                wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "rate limit bucket exhausted, waiting for reset"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    fn bucket(&self, key: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn release(&self, key: &str, quota: Option<&QuotaHeaders>, reserved: bool) {
        let now = Instant::now();
        match quota {
            Some(quota) => {
                let bucket = self
                    .buckets
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        Arc::new(Bucket {
                            state: Mutex::new(BucketState {
                                limit: 1,
                                remaining: 1,
                                reset_at: None,
                            }),
                        })
                    })
                    .clone();
                bucket.lock().apply(quota, now);
            }
            None if !reserved => {
                if let Some(bucket) = self.bucket(key) {
                    let mut state = bucket.lock();
                    state.replenish_if_due(now);
                    state.remaining = state.remaining.saturating_sub(1);
                }
            }
            // The reservation taken at admission already counted this call.
            None => {}
        }
    }

    #[cfg(test)]
    fn snapshot(&self, key: &str) -> Option<(u32, Option<Instant>)> {
        let bucket = self.bucket(key)?;
        let state = bucket.lock();
        Some((state.remaining, state.reset_at))
    }
}

/// One admitted call. Must be settled exactly once.
///
/// Dropping an unsettled permit settles it as a header-less failure.
#[derive(Debug)]
pub struct Permit<'a> {
    limiter: &'a RateLimiter,
    key: String,
    reserved: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(limiter: &'a RateLimiter, key: &str, reserved: bool) -> Self {
        Self {
            limiter,
            key: key.to_string(),
            reserved,
            settled: false,
        }
    }

    /// Settle with the response headers of the completed call.
    pub fn release(mut self, headers: &HeaderMap) {
        let quota = QuotaHeaders::from_headers(headers);
        self.limiter
            .release(&self.key, quota.as_ref(), self.reserved);
        self.settled = true;
    }

    /// Settle a call that produced no response.
    pub fn release_failed(mut self) {
        self.limiter.release(&self.key, None, self.reserved);
        self.settled = true;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.release(&self.key, None, self.reserved);
        }
    }
}
