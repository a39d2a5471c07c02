use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Open metadata mapping carried by every envelope
pub type Metadata = Map<String, Value>;

/// Closed set of message kinds understood on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Join,
    Leave,
    Text,
    /// File announce
    File,
    FileData,
    FileComplete,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::Leave => "leave",
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::FileData => "file-data",
            MessageKind::FileComplete => "file-complete",
            MessageKind::Error => "error",
        }
    }

    /// Kinds that belong to the file-transfer sub-protocol
    pub fn is_file_transfer(&self) -> bool {
        matches!(
            self,
            MessageKind::File | MessageKind::FileData | MessageKind::FileComplete
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of the wire protocol, exactly as it is framed.
///
/// `data` and `metadata` are always written and default to empty when a
/// peer leaves them out; a missing `type` fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Envelope {
    pub fn new(kind: MessageKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            metadata: Metadata::new(),
        }
    }

    /// Insert a single metadata entry
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }
}
