use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{Direction, ProgressObserver, ProgressThrottle, ReceivedFile, TransferProgress};
use crate::error::Result;
use crate::protocol::message::UNKNOWN_FILENAME;
use crate::protocol::{FileAnnounce, FileChunk, FileComplete, Message};

const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// How received files are named inside the destination directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScheme {
    /// `<filename>`
    Plain,
    /// `<sender>_<filename>`
    SenderPrefixed,
}

/// Reduce a peer-supplied name to a single safe path component
pub fn sanitize_filename(name: &str) -> String {
    let cleaned = name.replace('\\', "/");
    Path::new(&cleaned)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_FILENAME.to_string())
}

/// Create a new file in `dir`, appending `_1`, `_2`, ... to the stem until
/// the name is free. Creation is exclusive so concurrent writers never share
/// a file.
pub async fn create_unique(dir: &Path, file_name: &str) -> io::Result<(File, PathBuf)> {
    let original = Path::new(file_name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let extension = original
        .extension()
        .map(|e| e.to_string_lossy().into_owned());

    for counter in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (counter, &extension) {
            (0, _) => file_name.to_string(),
            (n, Some(ext)) => format!("{stem}_{n}.{ext}"),
            (n, None) => format!("{stem}_{n}"),
        };
        let path = dir.join(candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {file_name} in {}", dir.display()),
    ))
}

/// State of one file being received
#[derive(Debug)]
struct InboundTransfer {
    transfer_id: Uuid,
    filename: String,
    sender: String,
    declared_size: u64,
    path: PathBuf,
    sink: BufWriter<File>,
    bytes_received: u64,
    chunk_count: u64,
    start: Instant,
    throttle: ProgressThrottle,
}

impl InboundTransfer {
    fn progress(&self) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id,
            direction: Direction::Receiving,
            filename: self.filename.clone(),
            peer: self.sender.clone(),
            bytes_transferred: self.bytes_received,
            total_bytes: self.declared_size,
            chunk_count: self.chunk_count,
            elapsed: self.start.elapsed(),
        }
    }
}

/// What a file-transfer message did to the receiver
#[derive(Debug)]
pub enum ReceiveEvent {
    Started {
        path: PathBuf,
        announce: FileAnnounce,
    },
    Chunk {
        accepted: bool,
    },
    Finished(ReceivedFile),
    /// Complete (or another message) with no transfer in progress
    Ignored,
}

/// Inbound side of the file-transfer sub-protocol.
///
/// `Idle -> Receiving` on announce, back to `Idle` on complete. Data while
/// idle is dropped. A second announce aborts the current transfer (sink
/// closed, partial file removed) and starts the new one.
#[derive(Debug)]
pub struct FileReceiver {
    dest_dir: PathBuf,
    naming: NamingScheme,
    active: Option<InboundTransfer>,
}

impl FileReceiver {
    pub fn new(dest_dir: impl Into<PathBuf>, naming: NamingScheme) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            naming,
            active: None,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.active.is_some()
    }

    /// Snapshot of the transfer in progress, if any
    pub fn progress(&self) -> Option<TransferProgress> {
        self.active.as_ref().map(InboundTransfer::progress)
    }

    /// Feed one file-transfer message; other kinds are ignored
    pub async fn handle(
        &mut self,
        message: &Message,
        observer: &dyn ProgressObserver,
    ) -> Result<ReceiveEvent> {
        match message {
            Message::FileAnnounce(announce) => {
                let path = self.on_announce(announce).await?;
                Ok(ReceiveEvent::Started {
                    path,
                    announce: announce.clone(),
                })
            }
            Message::FileData(chunk) => {
                let accepted = self.on_chunk(chunk, observer).await?;
                Ok(ReceiveEvent::Chunk { accepted })
            }
            Message::FileComplete(complete) => Ok(match self.on_complete(complete).await? {
                Some(received) => ReceiveEvent::Finished(received),
                None => ReceiveEvent::Ignored,
            }),
            _ => Ok(ReceiveEvent::Ignored),
        }
    }

    /// Open a fresh sink for an announced file, replacing any active one
    pub async fn on_announce(&mut self, announce: &FileAnnounce) -> Result<PathBuf> {
        if self.active.is_some() {
            warn!(
                filename = %announce.filename,
                "new announce while receiving; aborting previous transfer"
            );
            self.abort().await;
        }

        let filename = sanitize_filename(&announce.filename);
        let sender = if announce.sender.trim().is_empty() {
            "unknown".to_string()
        } else {
            announce.sender.clone()
        };
        let local_name = match self.naming {
            NamingScheme::Plain => filename.clone(),
            NamingScheme::SenderPrefixed => {
                format!("{}_{}", sanitize_filename(&sender), filename)
            }
        };

        let (file, path) = create_unique(&self.dest_dir, &local_name).await?;
        let transfer_id = Uuid::new_v4();
        let start = Instant::now();

        info!(
            transfer = %transfer_id,
            filename = %filename,
            sender = %sender,
            size = announce.size,
            path = %path.display(),
            "receiving file"
        );

        self.active = Some(InboundTransfer {
            transfer_id,
            filename,
            sender,
            declared_size: announce.size,
            path: path.clone(),
            sink: BufWriter::new(file),
            bytes_received: 0,
            chunk_count: 0,
            start,
            throttle: ProgressThrottle::new(start),
        });

        Ok(path)
    }

    /// Append one chunk; returns false when no transfer is active
    pub async fn on_chunk(
        &mut self,
        chunk: &FileChunk,
        observer: &dyn ProgressObserver,
    ) -> Result<bool> {
        let Some(transfer) = self.active.as_mut() else {
            debug!(chunk = chunk.chunk_index, "file data with no active transfer; dropped");
            return Ok(false);
        };

        if let Err(e) = transfer.sink.write_all(&chunk.bytes).await {
            warn!(transfer = %transfer.transfer_id, error = %e, "failed to write chunk");
            self.abort().await;
            return Err(e.into());
        }

        transfer.bytes_received += chunk.bytes.len() as u64;
        transfer.chunk_count += 1;

        let finished = transfer.declared_size > 0 && transfer.bytes_received >= transfer.declared_size;
        if transfer.throttle.should_emit(Instant::now(), finished) {
            observer.on_progress(&transfer.progress());
        }

        Ok(true)
    }

    /// Close the sink and hand back the finished file
    pub async fn on_complete(&mut self, complete: &FileComplete) -> Result<Option<ReceivedFile>> {
        let Some(mut transfer) = self.active.take() else {
            debug!(filename = %complete.filename, "complete with no active transfer; ignored");
            return Ok(None);
        };

        let closed = async {
            transfer.sink.flush().await?;
            transfer.sink.get_mut().sync_all().await
        }
        .await;
        if let Err(e) = closed {
            warn!(transfer = %transfer.transfer_id, error = %e, "failed to close received file");
            discard(transfer).await;
            return Err(e.into());
        }

        let elapsed = transfer.start.elapsed();
        if transfer.declared_size != transfer.bytes_received {
            warn!(
                transfer = %transfer.transfer_id,
                declared = transfer.declared_size,
                received = transfer.bytes_received,
                "received size differs from announced size"
            );
        }
        info!(
            transfer = %transfer.transfer_id,
            path = %transfer.path.display(),
            bytes = transfer.bytes_received,
            chunks = transfer.chunk_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "file received"
        );

        Ok(Some(ReceivedFile {
            transfer_id: transfer.transfer_id,
            path: transfer.path,
            filename: transfer.filename,
            sender: transfer.sender,
            declared_size: transfer.declared_size,
            bytes_received: transfer.bytes_received,
            chunk_count: transfer.chunk_count,
            elapsed,
            sender_elapsed: complete.transfer_time,
        }))
    }

    /// Drop the active transfer, closing its sink and deleting the partial file
    pub async fn abort(&mut self) {
        if let Some(transfer) = self.active.take() {
            warn!(
                transfer = %transfer.transfer_id,
                filename = %transfer.filename,
                received = transfer.bytes_received,
                "transfer aborted"
            );
            discard(transfer).await;
        }
    }
}

async fn discard(transfer: InboundTransfer) {
    let InboundTransfer { sink, path, .. } = transfer;
    drop(sink);
    if let Err(e) = fs::remove_file(&path).await {
        debug!(path = %path.display(), error = %e, "could not remove partial file");
    }
}
