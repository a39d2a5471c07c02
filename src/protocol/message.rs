use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::{Envelope, MessageKind, Metadata};
use crate::error::{RelayError, Result};

pub const UNKNOWN_FILENAME: &str = "unknown_file";

fn unknown_filename() -> String {
    UNKNOWN_FILENAME.to_string()
}

/// Presence change: a join request from a client, or a join/leave notice
/// from the relay (`notice` set, `name` carried in metadata).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub name: String,
    pub notice: Option<String>,
}

impl Presence {
    pub fn request(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notice: None,
        }
    }

    pub fn notice(name: impl Into<String>, notice: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notice: Some(notice.into()),
        }
    }

    /// Human-readable line for display
    pub fn display_text(&self) -> &str {
        self.notice.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub body: String,
    pub sender: Option<String>,
    pub timestamp: Option<String>,
}

impl TextMessage {
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            sender: None,
            timestamp: None,
        }
    }
}

/// File announce, first message of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAnnounce {
    #[serde(default = "unknown_filename")]
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub sender: String,
}

/// One decoded chunk of file data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub bytes: Vec<u8>,
    /// Offset of the first byte of this chunk
    pub offset: u64,
    pub total_size: u64,
    pub chunk_index: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkMeta {
    #[serde(default)]
    bytes_sent: u64,
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    chunk_index: u64,
}

/// Transfer completion, last message of a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileComplete {
    #[serde(default = "unknown_filename")]
    pub filename: String,
    #[serde(default)]
    pub total_size: u64,
    /// Sender-side elapsed seconds
    #[serde(default)]
    pub transfer_time: Option<f64>,
    #[serde(default)]
    pub chunk_count: Option<u64>,
}

/// Strongly typed view of an [`Envelope`], decoded at the boundary only
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Join(Presence),
    Leave(Presence),
    Text(TextMessage),
    FileAnnounce(FileAnnounce),
    FileData(FileChunk),
    FileComplete(FileComplete),
    Error { message: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Join(_) => MessageKind::Join,
            Message::Leave(_) => MessageKind::Leave,
            Message::Text(_) => MessageKind::Text,
            Message::FileAnnounce(_) => MessageKind::File,
            Message::FileData(_) => MessageKind::FileData,
            Message::FileComplete(_) => MessageKind::FileComplete,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Message::Text(TextMessage::plain(body))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope::from(self)
    }
}

fn decode_meta<T: DeserializeOwned>(kind: MessageKind, metadata: Metadata) -> Result<T> {
    serde_json::from_value(Value::Object(metadata))
        .map_err(|e| RelayError::InvalidPayload(format!("{kind} metadata: {e}")))
}

fn decode_presence(envelope: Envelope) -> Presence {
    match envelope.meta_str("name").map(str::to_owned) {
        Some(name) => Presence::notice(name, envelope.data),
        None => Presence::request(envelope.data),
    }
}

impl TryFrom<Envelope> for Message {
    type Error = RelayError;

    fn try_from(envelope: Envelope) -> Result<Self> {
        let kind = envelope.kind;
        let message = match kind {
            MessageKind::Join => Message::Join(decode_presence(envelope)),
            MessageKind::Leave => Message::Leave(decode_presence(envelope)),
            MessageKind::Text => Message::Text(TextMessage {
                sender: envelope.meta_str("sender").map(str::to_string),
                timestamp: envelope.meta_str("timestamp").map(str::to_string),
                body: envelope.data,
            }),
            MessageKind::File => Message::FileAnnounce(decode_meta(kind, envelope.metadata)?),
            MessageKind::FileData => {
                let bytes = hex::decode(&envelope.data)
                    .map_err(|e| RelayError::InvalidPayload(format!("file-data hex: {e}")))?;
                let meta: ChunkMeta = decode_meta(kind, envelope.metadata)?;
                Message::FileData(FileChunk {
                    bytes,
                    offset: meta.bytes_sent,
                    total_size: meta.total_size,
                    chunk_index: meta.chunk_index,
                })
            }
            MessageKind::FileComplete => {
                Message::FileComplete(decode_meta(kind, envelope.metadata)?)
            }
            MessageKind::Error => Message::Error {
                message: envelope.data,
            },
        };
        Ok(message)
    }
}

fn encode_presence(kind: MessageKind, presence: Presence) -> Envelope {
    match presence.notice {
        Some(notice) => Envelope::new(kind, notice).with("name", presence.name),
        None => Envelope::new(kind, presence.name),
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        match message {
            Message::Join(presence) => encode_presence(MessageKind::Join, presence),
            Message::Leave(presence) => encode_presence(MessageKind::Leave, presence),
            Message::Text(text) => {
                let mut envelope = Envelope::new(MessageKind::Text, text.body);
                if let Some(sender) = text.sender {
                    envelope = envelope.with("sender", sender);
                }
                if let Some(timestamp) = text.timestamp {
                    envelope = envelope.with("timestamp", timestamp);
                }
                envelope
            }
            Message::FileAnnounce(announce) => Envelope::new(MessageKind::File, "")
                .with("filename", announce.filename)
                .with("size", announce.size)
                .with("sender", announce.sender),
            Message::FileData(chunk) => Envelope::new(MessageKind::FileData, hex::encode(&chunk.bytes))
                .with("bytes_sent", chunk.offset)
                .with("total_size", chunk.total_size)
                .with("chunk_index", chunk.chunk_index),
            Message::FileComplete(complete) => {
                let mut envelope = Envelope::new(MessageKind::FileComplete, "")
                    .with("filename", complete.filename)
                    .with("total_size", complete.total_size);
                if let Some(seconds) = complete.transfer_time {
                    envelope = envelope.with("transfer_time", seconds);
                }
                if let Some(count) = complete.chunk_count {
                    envelope = envelope.with("chunk_count", count);
                }
                envelope
            }
            Message::Error { message } => Envelope::new(MessageKind::Error, message),
        }
    }
}
