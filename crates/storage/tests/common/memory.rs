use async_trait::async_trait;
use bytes::Bytes;
use relaydrive_core::{Attachment, Message, Node, SignedUrl};
use relaydrive_storage::error::{StorageError, StorageResult};
use relaydrive_storage::traits::{ByteStream, Direction, MESSAGE_PAGE_SIZE, Transport};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use tokio::time::Duration;

/// First message id handed out by [`MemoryTransport`].
pub const FIRST_MESSAGE_ID: u64 = 1_000;

struct Stored {
    channel: String,
    data: Bytes,
    /// Every signature ever issued for this attachment.
    signatures: Vec<String>,
}

/// In-memory stand-in for the origin.
///
/// Messages get increasing ids and live in the channel they were posted to.
/// Range fetches only succeed for unexpired records carrying a signature the
/// transport issued; listing history re-signs every listed attachment.
#[allow(dead_code)]
pub struct MemoryTransport {
    channels: Vec<String>,
    next_channel: AtomicUsize,
    next_id: AtomicU64,
    messages: Mutex<BTreeMap<u64, Stored>>,
    /// Expiry stamped on uploads.
    upload_expiry: AtomicI64,
    /// Expiry stamped on signatures issued by listing.
    listed_expiry: AtomicI64,
    /// Upload attempts allowed to succeed before uploads start failing.
    upload_budget: AtomicUsize,
    fail_listing: AtomicBool,
    jitter_uploads: AtomicBool,
    list_delay_ms: AtomicU64,
    piece_size: AtomicUsize,
    pub uploads: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub range_fetches: AtomicUsize,
    in_flight_uploads: AtomicUsize,
    pub max_in_flight_uploads: AtomicUsize,
    in_flight_lists: AtomicUsize,
    pub max_in_flight_lists: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryTransport {
    pub fn new(channels: &[&str]) -> Self {
        let far_future = relaydrive_core::unix_now() + 86_400;
        Self {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            next_channel: AtomicUsize::new(0),
            next_id: AtomicU64::new(FIRST_MESSAGE_ID),
            messages: Mutex::new(BTreeMap::new()),
            upload_expiry: AtomicI64::new(far_future),
            listed_expiry: AtomicI64::new(far_future),
            upload_budget: AtomicUsize::new(usize::MAX),
            fail_listing: AtomicBool::new(false),
            jitter_uploads: AtomicBool::new(false),
            list_delay_ms: AtomicU64::new(0),
            piece_size: AtomicUsize::new(usize::MAX),
            uploads: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            range_fetches: AtomicUsize::new(0),
            in_flight_uploads: AtomicUsize::new(0),
            max_in_flight_uploads: AtomicUsize::new(0),
            in_flight_lists: AtomicUsize::new(0),
            max_in_flight_lists: AtomicUsize::new(0),
        }
    }

    /// Uploads from now on are signed until `expires_at`.
    pub fn set_upload_expiry(&self, expires_at: i64) {
        self.upload_expiry.store(expires_at, Ordering::SeqCst);
    }

    /// Let `count` more uploads succeed, then fail with status 400.
    pub fn fail_uploads_after(&self, count: usize) {
        self.upload_budget.store(count, Ordering::SeqCst);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make uploads take a varying amount of time so they finish out of order.
    pub fn jitter_uploads(&self) {
        self.jitter_uploads.store(true, Ordering::SeqCst);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        self.list_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Deliver range fetches in pieces of at most `size` bytes.
    pub fn set_piece_size(&self, size: usize) {
        self.piece_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Payload stored under `message_id`.
    pub fn stored(&self, message_id: u64) -> Option<Bytes> {
        self.messages
            .lock()
            .unwrap()
            .get(&message_id)
            .map(|stored| stored.data.clone())
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn sign(
        &self,
        message_id: u64,
        channel: &str,
        expires_at: i64,
        generation: usize,
    ) -> SignedUrl {
        SignedUrl {
            url: format!("https://cdn.test/attachments/{channel}/{message_id}/blob"),
            expires_at,
            issued_at: expires_at - 86_400,
            signature: format!("sig-{message_id}-{generation}"),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn upload_attachment(&self, data: Bytes) -> StorageResult<Node> {
        let _in_flight = InFlight::enter(&self.in_flight_uploads, &self.max_in_flight_uploads);
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let allowed = self
            .upload_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if allowed.is_err() {
            return Err(StorageError::Transport {
                operation: "upload_attachment",
                status: 400,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self.jitter_uploads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis((id * 7) % 11)).await;
        }

        let channel = {
            let index = self.next_channel.fetch_add(1, Ordering::SeqCst);
            self.channels[index % self.channels.len()].clone()
        };
        let signed = self.sign(id, &channel, self.upload_expiry.load(Ordering::SeqCst), 0);
        let size = data.len() as u64;
        self.messages.lock().unwrap().insert(
            id,
            Stored {
                channel,
                data,
                signatures: vec![signed.signature.clone()],
            },
        );
        Ok(Node::new(signed, size, id))
    }

    async fn range_fetch(&self, node: &Node, start: u64, end: u64) -> StorageResult<ByteStream> {
        self.range_fetches.fetch_add(1, Ordering::SeqCst);
        let data = {
            let messages = self.messages.lock().unwrap();
            let stored = messages
                .get(&node.message_id())
                .filter(|stored| stored.signatures.iter().any(|s| s == node.signature()))
                .ok_or(StorageError::Transport {
                    operation: "range_fetch",
                    status: 404,
                })?;
            stored.data.clone()
        };
        if node.is_expired_at(relaydrive_core::unix_now()) {
            return Err(StorageError::Transport {
                operation: "range_fetch",
                status: 404,
            });
        }

        let end = (end as usize).min(data.len() - 1);
        let body = data.slice(start as usize..=end);
        let piece = self.piece_size.load(Ordering::SeqCst);
        let stream = async_stream::stream! {
            let mut rest = body;
            while !rest.is_empty() {
                let take = piece.min(rest.len());
                yield Ok(rest.split_to(take));
            }
        };
        Ok(Box::pin(stream))
    }

    async fn list_messages(
        &self,
        channel: &str,
        anchor: u64,
        direction: Direction,
    ) -> StorageResult<Vec<Message>> {
        let _in_flight = InFlight::enter(&self.in_flight_lists, &self.max_in_flight_lists);
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StorageError::Transport {
                operation: "list_messages",
                status: 500,
            });
        }
        assert_eq!(direction, Direction::After, "refresh only pages forward");

        let expires_at = self.listed_expiry.load(Ordering::SeqCst);
        let mut messages = self.messages.lock().unwrap();
        let page = messages
            .range_mut(anchor + 1..)
            .filter(|(_, stored)| stored.channel == channel)
            .take(MESSAGE_PAGE_SIZE)
            .map(|(&id, stored)| {
                let signed = self.sign(id, channel, expires_at, stored.signatures.len());
                stored.signatures.push(signed.signature.clone());
                Message {
                    id,
                    channel_id: Some(channel.to_string()),
                    attachments: vec![Attachment {
                        url: signed.encode(),
                        size: stored.data.len() as u64,
                        filename: "blob".to_string(),
                    }],
                }
            })
            .collect();
        Ok(page)
    }

    fn transport_name(&self) -> &'static str {
        "memory"
    }
}
