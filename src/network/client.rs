use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::file_transfer::{
    EnvelopeSink, FileReceiver, NamingScheme, ProgressObserver, ReceiveEvent, ReceivedFile,
    TransferProgress, TransferSummary, send_file,
};
use crate::protocol::{Envelope, FrameCodec, Message, Presence};

/// What the inbound worker reports to the chat front end
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Chat line, already formatted by the relay
    Text { line: String, sender: Option<String> },
    /// Join/leave notice or other status line
    Notice(String),
    FileIncoming {
        filename: String,
        size: u64,
        sender: String,
        path: PathBuf,
    },
    FileProgress(TransferProgress),
    FileReceived(ReceivedFile),
    ServerError(String),
    /// The connection is gone; `reason` is set when it ended abnormally
    Disconnected { reason: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub codec: FrameCodec,
    pub connect_timeout: Duration,
    pub downloads_dir: PathBuf,
}

impl ClientOptions {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            codec: config.codec(),
            connect_timeout: config.connect_timeout(),
            downloads_dir: config.downloads_dir.clone(),
        }
    }
}

/// Write half of the client connection; one frame at a time
#[derive(Clone)]
struct Outbound {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    codec: FrameCodec,
}

#[async_trait]
impl EnvelopeSink for Outbound {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.codec.write_envelope(&mut *writer, &envelope).await
    }

    fn describe(&self) -> String {
        "relay".to_string()
    }
}

/// Depth of the event queue between the inbound worker and the front end
pub const EVENT_QUEUE_DEPTH: usize = 256;

/// Forwards receive progress as client events; progress is dropped while the queue is full
struct EventObserver {
    events: mpsc::Sender<ClientEvent>,
}

impl ProgressObserver for EventObserver {
    fn on_progress(&self, progress: &TransferProgress) {
        let _ = self
            .events
            .try_send(ClientEvent::FileProgress(progress.clone()));
    }
}

/// A joined chat connection
pub struct Client {
    name: String,
    server_addr: SocketAddr,
    outbound: Outbound,
    // held from announce to complete; the wire has no transfer id
    transfer: Mutex<()>,
    inbound: JoinHandle<()>,
}

impl Client {
    /// Connect, join as `name` and start the inbound worker
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        options: ClientOptions,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let stream = match timeout(options.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RelayError::ConnectFailure {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(RelayError::ConnectFailure {
                    addr,
                    reason: format!("timed out after {:?}", options.connect_timeout),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let outbound = Outbound {
            writer: Arc::new(Mutex::new(writer)),
            codec: options.codec,
        };
        outbound
            .deliver(Message::Join(Presence::request(name)).into_envelope())
            .await?;
        info!(server = %addr, name, "joined relay");

        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let receiver = FileReceiver::new(&options.downloads_dir, NamingScheme::Plain);
        let inbound = tokio::spawn(run_inbound(reader, options.codec, receiver, events));

        Ok((
            Self {
                name: name.to_string(),
                server_addr: addr,
                outbound,
                transfer: Mutex::new(()),
                inbound,
            },
            events_rx,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Whether the inbound worker has stopped
    pub fn is_disconnected(&self) -> bool {
        self.inbound.is_finished()
    }

    pub async fn send_text(&self, body: &str) -> Result<()> {
        self.outbound.deliver(Message::text(body).into_envelope()).await
    }

    /// Stream a local file to the room through the relay.
    ///
    /// Concurrent calls queue up and go out one whole file at a time.
    pub async fn send_file(
        &self,
        path: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<TransferSummary> {
        let _transfer = self.transfer.lock().await;
        send_file(&self.outbound, path, &self.name, observer).await
    }

    /// Announce departure and close the write side.
    ///
    /// The inbound worker keeps running until the relay closes the
    /// connection and then reports `Disconnected`.
    pub async fn leave(&self) -> Result<()> {
        self.outbound
            .deliver(Message::Leave(Presence::request(self.name.as_str())).into_envelope())
            .await?;
        let mut writer = self.outbound.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Read frames until the connection ends, persisting files as they arrive
async fn run_inbound(
    mut reader: OwnedReadHalf,
    codec: FrameCodec,
    mut receiver: FileReceiver,
    events: mpsc::Sender<ClientEvent>,
) {
    let observer = EventObserver {
        events: events.clone(),
    };

    let reason = loop {
        let envelope = match codec.read_envelope(&mut reader).await {
            Ok(envelope) => envelope,
            Err(RelayError::EndOfStream) => break None,
            Err(e) => break Some(e.to_string()),
        };

        let kind = envelope.kind;
        let message = match Message::try_from(envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(kind = %kind, error = %e, "dropping undecodable message");
                if kind.is_file_transfer() {
                    receiver.abort().await;
                    let _ = events
                        .send(ClientEvent::Notice(format!("file transfer aborted: {e}")))
                        .await;
                }
                continue;
            }
        };

        let event = match message {
            Message::Text(text) => Some(ClientEvent::Text {
                line: text.body,
                sender: text.sender,
            }),
            Message::Join(presence) | Message::Leave(presence) => {
                Some(ClientEvent::Notice(presence.display_text().to_string()))
            }
            Message::Error { message } => Some(ClientEvent::ServerError(message)),
            file_message => match receiver.handle(&file_message, &observer).await {
                Ok(ReceiveEvent::Started { path, announce }) => Some(ClientEvent::FileIncoming {
                    filename: announce.filename,
                    size: announce.size,
                    sender: announce.sender,
                    path,
                }),
                Ok(ReceiveEvent::Finished(file)) => Some(ClientEvent::FileReceived(file)),
                Ok(ReceiveEvent::Chunk { .. } | ReceiveEvent::Ignored) => None,
                Err(e) => {
                    warn!(error = %e, "could not store incoming file");
                    Some(ClientEvent::Notice(format!("file transfer failed: {e}")))
                }
            },
        };

        if let Some(event) = event
            && events.send(event).await.is_err()
        {
            debug!("event receiver dropped; stopping inbound worker");
            break None;
        }
    };

    receiver.abort().await;
    let _ = events.send(ClientEvent::Disconnected { reason }).await;
}
