pub mod codec;
pub mod envelope;
pub mod message;

pub use codec::{FrameCodec, write_frame};
pub use envelope::{Envelope, MessageKind, Metadata};
pub use message::{FileAnnounce, FileChunk, FileComplete, Message, Presence, TextMessage};

/// Width of the big-endian frame length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default cap on a single frame payload (16 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
