use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::info;
use uuid::Uuid;

const KIB: usize = 1024;
const MIB: u64 = 1024 * 1024;

/// Minimum interval between two progress observations
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Chunk size for a transfer of `total_size` bytes.
///
/// Tiers are inclusive: up to 1 MiB uses 4 KiB chunks, up to 10 MiB 8 KiB,
/// up to 100 MiB 32 KiB and anything larger 64 KiB.
pub fn chunk_size_for(total_size: u64) -> usize {
    if total_size <= MIB {
        4 * KIB
    } else if total_size <= 10 * MIB {
        8 * KIB
    } else if total_size <= 100 * MIB {
        32 * KIB
    } else {
        64 * KIB
    }
}

/// Calculate the number of chunks for a file given a chunk size
pub fn calculate_chunks(file_size: u64, chunk_size: usize) -> u64 {
    file_size.div_ceil(chunk_size as u64)
}

/// Where an outbound file goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    All,
    User(String),
}

impl FromStr for TransferTarget {
    type Err = std::convert::Infallible;

    /// `@name` selects one user, anything else (including `all`) means everyone
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix('@') {
            Some(name) if !name.is_empty() => Ok(TransferTarget::User(name.to_string())),
            _ => Ok(TransferTarget::All),
        }
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTarget::All => f.write_str("all"),
            TransferTarget::User(name) => write!(f, "@{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Point-in-time progress of one transfer, as raw numbers
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: Uuid,
    pub direction: Direction,
    pub filename: String,
    pub peer: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub chunk_count: u64,
    pub elapsed: Duration,
}

impl TransferProgress {
    /// Percentage done, or `None` when the total size is unknown
    pub fn percentage(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some(self.bytes_transferred as f64 * 100.0 / self.total_bytes as f64)
    }

    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}

/// Result of a finished outbound transfer
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub transfer_id: Uuid,
    pub filename: String,
    pub total_bytes: u64,
    pub chunk_count: u64,
    pub chunk_size: usize,
    pub elapsed: Duration,
}

impl TransferSummary {
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Result of a finished inbound transfer
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub transfer_id: Uuid,
    pub path: PathBuf,
    pub filename: String,
    pub sender: String,
    pub declared_size: u64,
    pub bytes_received: u64,
    pub chunk_count: u64,
    pub elapsed: Duration,
    /// Elapsed seconds as reported by the sender, if any
    pub sender_elapsed: Option<f64>,
}

impl ReceivedFile {
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_received as f64 / secs
        } else {
            0.0
        }
    }
}

/// Consumer of progress observations (console rendering, logging)
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &TransferProgress);
}

/// Observer that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&self, _progress: &TransferProgress) {}
}

/// Observer that reports through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_progress(&self, progress: &TransferProgress) {
        info!(
            transfer = %progress.transfer_id,
            filename = %progress.filename,
            peer = %progress.peer,
            direction = ?progress.direction,
            bytes = progress.bytes_transferred,
            total = progress.total_bytes,
            chunks = progress.chunk_count,
            bytes_per_sec = progress.bytes_per_second() as u64,
            "transfer progress"
        );
    }
}

/// Rate limiter for progress observations
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Instant,
}

impl ProgressThrottle {
    pub fn new(start: Instant) -> Self {
        Self::with_interval(start, PROGRESS_INTERVAL)
    }

    pub fn with_interval(start: Instant, interval: Duration) -> Self {
        Self {
            interval,
            last_emit: start,
        }
    }

    /// True when an observation is due; `finished` always forces one
    pub fn should_emit(&mut self, now: Instant, finished: bool) -> bool {
        if finished || now.duration_since(self.last_emit) >= self.interval {
            self.last_emit = now;
            return true;
        }
        false
    }

    pub fn last_emit(&self) -> Instant {
        self.last_emit
    }
}
