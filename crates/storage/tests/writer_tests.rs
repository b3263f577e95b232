mod common;

use common::{FIRST_MESSAGE_ID, MemoryTransport, collect_nodes, seeded_bytes};
use relaydrive_storage::{
    ChunkWriter, ParallelWriter, SequentialWriter, StorageError, Transport, copy_into,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn transport() -> Arc<MemoryTransport> {
    Arc::new(MemoryTransport::new(&["100", "200", "300"]))
}

fn reassemble(transport: &MemoryTransport, nodes: &[relaydrive_core::Node]) -> Vec<u8> {
    nodes
        .iter()
        .flat_map(|node| transport.stored(node.message_id()).unwrap().to_vec())
        .collect()
}

#[tokio::test]
async fn sequential_writer_splits_by_chunk_size() {
    let transport = transport();
    let (mut writer, mut receiver) =
        SequentialWriter::new(transport.clone() as Arc<dyn Transport>, 4);

    writer.write(b"ABCDEFGHI").await.unwrap();
    writer.close().await.unwrap();

    let nodes = collect_nodes(&mut receiver);
    let sizes: Vec<u64> = nodes.iter().map(|node| node.size()).collect();
    assert_eq!(sizes, [4, 4, 1]);
    assert_eq!(reassemble(&transport, &nodes), b"ABCDEFGHI");
    assert_eq!(writer.bytes_written(), 9);
}

#[tokio::test]
async fn sequential_writer_uploads_in_stream_order() {
    let transport = transport();
    let (mut writer, mut receiver) =
        SequentialWriter::new(transport.clone() as Arc<dyn Transport>, 4);

    writer.write(b"AB").await.unwrap();
    writer.write(b"CDEF").await.unwrap();
    writer.write(b"G").await.unwrap();
    writer.close().await.unwrap();

    let mut sequences = Vec::new();
    while let Ok(upload) = receiver.try_recv() {
        sequences.push((upload.sequence, upload.node.message_id()));
    }
    assert_eq!(
        sequences,
        [(0, FIRST_MESSAGE_ID), (1, FIRST_MESSAGE_ID + 1)]
    );
}

#[tokio::test]
async fn chunk_count_is_the_ceiling_of_size_over_chunk_size() {
    let cases = [(1000usize, 100usize, 10usize), (1001, 100, 11), (99, 100, 1)];
    for (len, chunk_size, expected) in cases {
        let transport = transport();
        let data = seeded_bytes(len as u64, len);
        let (mut writer, mut receiver) =
            SequentialWriter::new(transport.clone() as Arc<dyn Transport>, chunk_size);

        // Feed in uneven slices to exercise partial fills.
        for piece in data.chunks(37) {
            writer.write(piece).await.unwrap();
        }
        writer.close().await.unwrap();

        let nodes = collect_nodes(&mut receiver);
        assert_eq!(nodes.len(), expected, "len {len} chunk {chunk_size}");
        assert!(nodes.iter().all(|node| node.size() as usize <= chunk_size));
        assert_eq!(reassemble(&transport, &nodes), data.to_vec());
    }
}

#[tokio::test]
async fn closing_an_empty_writer_uploads_nothing() {
    let transport = transport();
    let (mut writer, mut receiver) =
        SequentialWriter::new(transport.clone() as Arc<dyn Transport>, 4);

    writer.close().await.unwrap();

    assert!(collect_nodes(&mut receiver).is_empty());
    assert_eq!(transport.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn closed_writer_rejects_writes_and_second_close() {
    let (mut writer, _receiver) = SequentialWriter::new(transport() as Arc<dyn Transport>, 4);
    writer.close().await.unwrap();

    assert!(matches!(writer.write(b"x").await, Err(StorageError::Closed)));
    assert!(matches!(
        writer.close().await,
        Err(StorageError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn sequential_writer_stops_after_a_failed_upload() {
    let transport = transport();
    transport.fail_uploads_after(1);
    let (mut writer, mut receiver) =
        SequentialWriter::new(transport.clone() as Arc<dyn Transport>, 4);

    let err = writer.write(b"ABCDEFGH").await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Transport {
            status: 400,
            ..
        }
    ));
    assert!(matches!(writer.write(b"I").await, Err(StorageError::Closed)));

    // The chunk stored before the failure is still reported.
    assert_eq!(collect_nodes(&mut receiver).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn parallel_writer_reassembles_by_sequence() {
    let transport = transport();
    transport.jitter_uploads();
    let data = seeded_bytes(7, 1000);

    let (mut writer, mut receiver) =
        ParallelWriter::new(transport.clone() as Arc<dyn Transport>, 64, 4);
    for piece in data.chunks(100) {
        writer.write(piece).await.unwrap();
    }
    writer.close().await.unwrap();

    let nodes = collect_nodes(&mut receiver);
    let mut sizes: Vec<u64> = nodes.iter().map(|node| node.size()).collect();
    sizes.sort_unstable();
    let mut expected = vec![64u64; 15];
    expected.insert(0, 40);
    assert_eq!(sizes, expected);
    assert_eq!(reassemble(&transport, &nodes), data.to_vec());
    assert_eq!(writer.bytes_written(), 1000);
}

#[tokio::test(start_paused = true)]
async fn parallel_writer_bounds_concurrent_uploads() {
    let transport = transport();
    transport.jitter_uploads();

    let (mut writer, _receiver) =
        ParallelWriter::new(transport.clone() as Arc<dyn Transport>, 8, 3);
    writer.write(&seeded_bytes(1, 8 * 20)).await.unwrap();
    writer.close().await.unwrap();

    let max = transport.max_in_flight_uploads.load(Ordering::SeqCst);
    assert!(max <= 3, "saw {max} concurrent uploads");
    assert!(max > 1, "uploads never overlapped");
    assert_eq!(transport.uploads.load(Ordering::SeqCst), 20);
}

#[tokio::test(start_paused = true)]
async fn parallel_writer_surfaces_the_first_failure() {
    let transport = transport();
    transport.jitter_uploads();
    transport.fail_uploads_after(2);

    let (mut writer, _receiver) =
        ParallelWriter::new(transport.clone() as Arc<dyn Transport>, 4, 2);
    let outcome = match writer.write(&seeded_bytes(3, 4 * 6)).await {
        Err(e) => Err(e),
        Ok(_) => writer.close().await,
    };

    assert!(matches!(
        outcome,
        Err(StorageError::Transport {
            status: 400,
            ..
        })
    ));
    assert!(matches!(writer.write(b"x").await, Err(StorageError::Closed)));
}

#[tokio::test]
async fn parallel_writer_close_twice_fails() {
    let (mut writer, _receiver) = ParallelWriter::new(transport() as Arc<dyn Transport>, 4, 2);
    writer.write(b"AB").await.unwrap();
    writer.close().await.unwrap();
    assert!(matches!(
        writer.close().await,
        Err(StorageError::AlreadyClosed)
    ));
}

#[tokio::test]
async fn copy_into_streams_a_reader() {
    let transport = transport();
    let data = seeded_bytes(11, 200_000);
    let (mut writer, mut receiver) =
        SequentialWriter::new(transport.clone() as Arc<dyn Transport>, 50_000);

    let mut source: &[u8] = &data;
    let copied = copy_into(&mut source, &mut writer).await.unwrap();
    writer.close().await.unwrap();

    assert_eq!(copied, 200_000);
    let nodes = collect_nodes(&mut receiver);
    assert_eq!(nodes.len(), 4);
    assert_eq!(reassemble(&transport, &nodes), data.to_vec());
}
