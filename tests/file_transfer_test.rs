use std::path::Path;

use async_trait::async_trait;
use relaystream::file_transfer::{
    EnvelopeSink, FileReceiver, NamingScheme, NoopObserver, ReceiveEvent, calculate_chunks,
    chunk_size_for, send_file,
};
use relaystream::protocol::{Envelope, Message, MessageKind};
use relaystream::RelayError;
use tokio::sync::mpsc;

/// Collects transfer envelopes on a channel instead of a socket
struct ChannelSink(mpsc::Sender<Envelope>);

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn deliver(&self, envelope: Envelope) -> relaystream::Result<()> {
        self.0
            .send(envelope)
            .await
            .map_err(|_| RelayError::SendFailure("channel".to_string()))
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Run a whole outbound transfer into a channel and collect what came out
async fn send_to_channel(path: &Path, sender: &str) -> (relaystream::file_transfer::TransferSummary, Vec<Envelope>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let collector = tokio::spawn(async move {
        let mut envelopes = Vec::new();
        while let Some(envelope) = rx.recv().await {
            envelopes.push(envelope);
        }
        envelopes
    });

    let sink = ChannelSink(tx);
    let summary = send_file(&sink, path, sender, &NoopObserver).await.unwrap();
    drop(sink);
    (summary, collector.await.unwrap())
}

async fn receive_all(dest: &Path, envelopes: Vec<Envelope>) -> relaystream::file_transfer::ReceivedFile {
    let mut receiver = FileReceiver::new(dest, NamingScheme::SenderPrefixed);
    let mut finished = None;
    for envelope in envelopes {
        let message = Message::try_from(envelope).unwrap();
        if let ReceiveEvent::Finished(file) = receiver.handle(&message, &NoopObserver).await.unwrap() {
            finished = Some(file);
        }
    }
    finished.expect("transfer completed")
}

#[tokio::test]
async fn test_chunk_count_is_ceiling_of_size_over_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let size = 3 * 4096 + 17;
    let path = dir.path().join("odd.bin");
    tokio::fs::write(&path, pattern(size)).await.unwrap();

    let (summary, envelopes) = send_to_channel(&path, "alice").await;

    let data_frames = envelopes
        .iter()
        .filter(|e| e.kind == MessageKind::FileData)
        .count() as u64;
    assert_eq!(summary.chunk_size, 4096);
    assert_eq!(data_frames, calculate_chunks(size as u64, 4096));
    assert_eq!(data_frames, 4);
    assert_eq!(envelopes.first().unwrap().kind, MessageKind::File);
    assert_eq!(envelopes.last().unwrap().kind, MessageKind::FileComplete);
    assert_eq!(envelopes.last().unwrap().meta_u64("chunk_count"), Some(4));
}

#[tokio::test]
async fn test_round_trip_is_byte_identical() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let content = pattern(200_000);
    let path = src.path().join("photo.jpg");
    tokio::fs::write(&path, &content).await.unwrap();

    let (_, envelopes) = send_to_channel(&path, "bob").await;
    let received = receive_all(dst.path(), envelopes).await;

    assert_eq!(received.path.file_name().unwrap(), "bob_photo.jpg");
    assert_eq!(received.bytes_received, content.len() as u64);
    assert_eq!(tokio::fs::read(&received.path).await.unwrap(), content);
}

#[tokio::test]
async fn test_ten_mebibytes_use_eight_kib_chunks() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let size = 10 * 1024 * 1024;
    let content = pattern(size);
    let path = src.path().join("big.bin");
    tokio::fs::write(&path, &content).await.unwrap();

    assert_eq!(chunk_size_for(size as u64), 8192);
    let (summary, envelopes) = send_to_channel(&path, "carol").await;
    assert_eq!(summary.chunk_count, 1280);

    let received = receive_all(dst.path(), envelopes).await;
    assert_eq!(received.chunk_count, 1280);
    assert!(received.sender_elapsed.is_some());
    assert!(tokio::fs::read(&received.path).await.unwrap() == content);
}

#[tokio::test]
async fn test_empty_file_has_no_data_frames() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let path = src.path().join("empty.txt");
    tokio::fs::write(&path, b"").await.unwrap();

    let (summary, envelopes) = send_to_channel(&path, "dave").await;
    assert_eq!(summary.chunk_count, 0);
    let kinds: Vec<_> = envelopes.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![MessageKind::File, MessageKind::FileComplete]);
    assert_eq!(envelopes[0].meta_u64("size"), Some(0));
    assert_eq!(envelopes[1].meta_u64("total_size"), Some(0));

    let received = receive_all(dst.path(), envelopes).await;
    assert_eq!(tokio::fs::metadata(&received.path).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_same_name_twice_gets_a_suffix() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let path = src.path().join("notes.txt");
    tokio::fs::write(&path, b"v1").await.unwrap();

    let (_, first) = send_to_channel(&path, "erin").await;
    let (_, second) = send_to_channel(&path, "erin").await;
    let a = receive_all(dst.path(), first).await;
    let b = receive_all(dst.path(), second).await;

    assert_eq!(a.path.file_name().unwrap(), "erin_notes.txt");
    assert_eq!(b.path.file_name().unwrap(), "erin_notes_1.txt");
}

#[tokio::test]
async fn test_missing_file_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = mpsc::channel::<Envelope>(8);
    let sink = ChannelSink(tx);

    let result = send_file(&sink, &dir.path().join("ghost.txt"), "x", &NoopObserver).await;
    assert!(matches!(result, Err(RelayError::FileNotFound(_))));

    let result = send_file(&sink, dir.path(), "x", &NoopObserver).await;
    assert!(matches!(result, Err(RelayError::NotAFile(_))));

    drop(sink);
    assert!(rx.recv().await.is_none());
}
