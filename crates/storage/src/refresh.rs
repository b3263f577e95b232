//! Expiry refresh.
//!
//! Signed attachment URLs lapse after a while. A lapsed chunk is not lost:
//! listing the channel history around its message yields a freshly signed
//! URL for the same attachment, which is written back into the record.

use crate::error::{StorageError, StorageResult};
use crate::traits::{Direction, Transport};
use relaydrive_core::{Node, SignedUrl};
use std::collections::{BTreeMap, BTreeSet};

/// Re-sign every record in `nodes` that has expired at `now`.
///
/// Records are rewritten in place; valid records are left untouched. One
/// history page covers up to a hundred consecutive messages, so chunks
/// written in a burst are refreshed a page at a time. On failure, records
/// refreshed before the failing page keep their new signatures.
///
/// Returns the number of records rewritten.
#[tracing::instrument(
    skip(transport, nodes),
    fields(transport = transport.transport_name(), nodes = nodes.len())
)]
pub async fn refresh_expired(
    transport: &dyn Transport,
    nodes: &mut [Node],
    now: i64,
) -> StorageResult<usize> {
    let mut expired: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (index, node) in nodes.iter().enumerate() {
        if node.is_expired_at(now) {
            expired.entry(node.message_id()).or_default().push(index);
        }
    }
    if expired.is_empty() {
        return Ok(0);
    }
    tracing::debug!(messages = expired.len(), "refreshing expired chunks");

    let mut refreshed_messages = BTreeSet::new();
    let mut rewritten = 0usize;
    let anchors: Vec<u64> = expired.keys().copied().collect();

    for message_id in anchors {
        if refreshed_messages.contains(&message_id) {
            continue;
        }
        let first = expired[&message_id][0];
        let channel = nodes[first].channel_id().ok_or_else(|| StorageError::Refresh {
            message_id,
            source: Box::new(StorageError::Protocol(format!(
                "no channel in chunk url {}",
                nodes[first].url()
            ))),
        })?;

        let page = transport
            .list_messages(&channel, message_id.saturating_sub(1), Direction::After)
            .await
            .map_err(|source| StorageError::Refresh {
                message_id,
                source: Box::new(source),
            })?;

        for message in &page {
            let Some(indices) = expired.get(&message.id) else {
                continue;
            };
            if !refreshed_messages.insert(message.id) {
                continue;
            }
            let Some(attachment) = message.first_attachment() else {
                tracing::warn!(message_id = message.id, "message lost its attachment");
                continue;
            };
            let signed = SignedUrl::from_origin(&attachment.url);
            for &index in indices {
                nodes[index].apply_signed_url(signed.clone());
                rewritten += 1;
            }
        }

        if !refreshed_messages.contains(&message_id) {
            tracing::warn!(message_id, %channel, "message not found while refreshing");
        }
    }

    tracing::debug!(rewritten, "refresh finished");
    Ok(rewritten)
}
