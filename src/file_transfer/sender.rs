use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    Direction, ProgressObserver, ProgressThrottle, TransferProgress, TransferSummary,
    chunk_size_for,
};
use crate::error::{RelayError, Result};
use crate::protocol::message::UNKNOWN_FILENAME;
use crate::protocol::{Envelope, FileAnnounce, FileChunk, FileComplete, Message};

/// Destination for the envelopes of an outbound transfer
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> Result<()>;

    /// Short label used in logs and progress reports
    fn describe(&self) -> String;
}

/// Read until `buf` is full or the reader is exhausted
async fn fill_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream one file to `sink` as announce, data chunks and complete.
///
/// Validation happens before anything is sent. An I/O or delivery failure
/// mid-stream aborts the remaining steps; nothing tells the peer.
pub async fn send_file<S>(
    sink: &S,
    path: &Path,
    sender_name: &str,
    observer: &dyn ProgressObserver,
) -> Result<TransferSummary>
where
    S: EnvelopeSink + ?Sized,
{
    let metadata = fs::metadata(path)
        .await
        .map_err(|e| RelayError::from_file_io(e, path))?;
    if !metadata.is_file() {
        return Err(RelayError::NotAFile(path.to_path_buf()));
    }

    let file = File::open(path)
        .await
        .map_err(|e| RelayError::from_file_io(e, path))?;

    let total_size = metadata.len();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| UNKNOWN_FILENAME.to_string());
    let chunk_size = chunk_size_for(total_size);
    let transfer_id = Uuid::new_v4();
    let peer = sink.describe();

    info!(
        transfer = %transfer_id,
        filename = %filename,
        size = total_size,
        chunk_size,
        target = %peer,
        "sending file"
    );

    sink.deliver(
        Message::FileAnnounce(FileAnnounce {
            filename: filename.clone(),
            size: total_size,
            sender: sender_name.to_string(),
        })
        .into_envelope(),
    )
    .await?;

    let start = Instant::now();
    let mut throttle = ProgressThrottle::new(start);
    let mut reader = file.take(total_size);
    let mut buffer = vec![0u8; chunk_size];
    let mut bytes_sent = 0u64;
    let mut chunk_count = 0u64;

    loop {
        let n = fill_chunk(&mut reader, &mut buffer).await.map_err(|e| {
            warn!(transfer = %transfer_id, error = %e, "file read failed mid-transfer");
            RelayError::from_file_io(e, path)
        })?;
        if n == 0 {
            break;
        }

        let chunk = FileChunk {
            bytes: buffer[..n].to_vec(),
            offset: bytes_sent,
            total_size,
            chunk_index: chunk_count,
        };
        sink.deliver(Message::FileData(chunk).into_envelope()).await?;

        bytes_sent += n as u64;
        chunk_count += 1;

        let now = Instant::now();
        if throttle.should_emit(now, bytes_sent >= total_size) {
            observer.on_progress(&TransferProgress {
                transfer_id,
                direction: Direction::Sending,
                filename: filename.clone(),
                peer: peer.clone(),
                bytes_transferred: bytes_sent,
                total_bytes: total_size,
                chunk_count,
                elapsed: now.duration_since(start),
            });
        }
    }

    if bytes_sent < total_size {
        debug!(
            transfer = %transfer_id,
            bytes_sent,
            total_size,
            "file shrank while sending"
        );
    }

    let elapsed = start.elapsed();
    sink.deliver(
        Message::FileComplete(FileComplete {
            filename: filename.clone(),
            total_size,
            transfer_time: Some(elapsed.as_secs_f64()),
            chunk_count: Some(chunk_count),
        })
        .into_envelope(),
    )
    .await?;

    info!(
        transfer = %transfer_id,
        filename = %filename,
        chunks = chunk_count,
        elapsed_ms = elapsed.as_millis() as u64,
        "file sent"
    );

    Ok(TransferSummary {
        transfer_id,
        filename,
        total_bytes: bytes_sent,
        chunk_count,
        chunk_size,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_transfer::types::NoopObserver;
    use crate::protocol::MessageKind;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        envelopes: Mutex<Vec<Envelope>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl EnvelopeSink for Recorder {
        async fn deliver(&self, envelope: Envelope) -> Result<()> {
            let mut envelopes = self.envelopes.lock().unwrap();
            if self.fail_after.is_some_and(|limit| envelopes.len() >= limit) {
                return Err(RelayError::SendFailure("recorder".into()));
            }
            envelopes.push(envelope);
            Ok(())
        }

        fn describe(&self) -> String {
            "recorder".into()
        }
    }

    #[tokio::test]
    async fn missing_file_sends_nothing() {
        let recorder = Recorder::default();
        let dir = tempfile::tempdir().unwrap();
        let result = send_file(&recorder, &dir.path().join("nope"), "me", &NoopObserver).await;
        assert!(matches!(result, Err(RelayError::FileNotFound(_))));
        assert!(recorder.envelopes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn directory_is_not_a_file() {
        let recorder = Recorder::default();
        let dir = tempfile::tempdir().unwrap();
        let result = send_file(&recorder, dir.path(), "me", &NoopObserver).await;
        assert!(matches!(result, Err(RelayError::NotAFile(_))));
        assert!(recorder.envelopes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunks_are_sequential_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let recorder = Recorder::default();
        let summary = send_file(&recorder, &path, "alice", &NoopObserver).await.unwrap();
        assert_eq!(summary.chunk_size, 4096);
        assert_eq!(summary.chunk_count, 3);

        let envelopes = recorder.envelopes.lock().unwrap();
        assert_eq!(envelopes.len(), 5);
        assert_eq!(envelopes[0].kind, MessageKind::File);
        assert_eq!(envelopes[0].meta_str("sender"), Some("alice"));
        assert_eq!(envelopes[0].meta_u64("size"), Some(10_000));

        let mut rebuilt = Vec::new();
        for (index, env) in envelopes[1..4].iter().enumerate() {
            assert_eq!(env.kind, MessageKind::FileData);
            assert_eq!(env.meta_u64("chunk_index"), Some(index as u64));
            assert_eq!(env.meta_u64("bytes_sent"), Some(rebuilt.len() as u64));
            rebuilt.extend(hex::decode(&env.data).unwrap());
        }
        assert_eq!(rebuilt, content);

        assert_eq!(envelopes[4].kind, MessageKind::FileComplete);
        assert_eq!(envelopes[4].meta_u64("chunk_count"), Some(3));
        assert_eq!(envelopes[4].meta_u64("total_size"), Some(10_000));
    }

    #[tokio::test]
    async fn delivery_failure_aborts_without_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![7u8; 20_000]).await.unwrap();

        let recorder = Recorder {
            fail_after: Some(2),
            ..Default::default()
        };
        let result = send_file(&recorder, &path, "alice", &NoopObserver).await;
        assert!(matches!(result, Err(RelayError::SendFailure(_))));

        let envelopes = recorder.envelopes.lock().unwrap();
        assert_eq!(envelopes.len(), 2);
        assert!(envelopes.iter().all(|e| e.kind != MessageKind::FileComplete));
    }
}
