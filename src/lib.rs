pub mod commands;
pub mod error;
pub mod file_transfer;
pub mod network;
pub mod protocol;
pub mod utils;

// Re-export the main entry points for the binary and integration tests
pub use error::{RelayError, Result};
pub use network::{Client, ClientEvent, ClientOptions, RelayConfig, RelayHandle, Server};
pub use protocol::{Envelope, FrameCodec, Message, MessageKind};
