use bytes::Bytes;
use relaydrive_storage::{ChunkReceiver, ChunkUpload};
use relaydrive_core::Node;

/// Reproducible payload for `seed`. Unlike a repeated byte, any misplaced
/// chunk changes the reassembled output.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut state = seed ^ 0x9e37_79b9_7f4a_7c15;
    let data: Vec<u8> = (0..len)
        .map(|_| {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect();
    Bytes::from(data)
}

/// Drain a closed writer's result channel, ordered by sequence.
#[allow(dead_code)]
pub fn collect_nodes(receiver: &mut ChunkReceiver) -> Vec<Node> {
    let mut uploads: Vec<ChunkUpload> = Vec::new();
    while let Ok(upload) = receiver.try_recv() {
        uploads.push(upload);
    }
    uploads.sort_by_key(|upload| upload.sequence);
    uploads.into_iter().map(|upload| upload.node).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_payload() {
        assert_eq!(seeded_bytes(7, 512), seeded_bytes(7, 512));
        assert_eq!(seeded_bytes(7, 512).len(), 512);
    }

    #[test]
    fn payload_depends_on_seed_and_offset() {
        let data = seeded_bytes(7, 512);
        assert_ne!(data, seeded_bytes(8, 512));
        assert_ne!(data[..256], data[256..]);
    }
}
