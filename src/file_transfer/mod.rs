pub mod receiver;
pub mod sender;
pub mod types;

pub use receiver::{FileReceiver, NamingScheme, ReceiveEvent, create_unique, sanitize_filename};
pub use sender::{EnvelopeSink, send_file};
pub use types::{
    Direction, LoggingObserver, NoopObserver, ProgressObserver, ReceivedFile, TransferProgress,
    TransferSummary, TransferTarget, calculate_chunks, chunk_size_for,
};
