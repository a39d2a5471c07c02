use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{RelayError, Result};
use crate::file_transfer::{FileReceiver, TransferProgress};
use crate::protocol::{Envelope, FrameCodec, write_frame};

/// An encoded frame, shared between all recipients of a broadcast
pub type Frame = Arc<[u8]>;

/// Registry key of one connection, stable for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-session outbound settings
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub codec: FrameCodec,
    /// Frames buffered for a slow peer before producers wait
    pub queue_depth: usize,
    /// How long a producer waits for queue space before giving up
    pub send_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            codec: FrameCodec::default(),
            queue_depth: 256,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Read-only view of a session for the admin console
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub peer_addr: SocketAddr,
    pub connected_at: DateTime<Local>,
    pub inbound_transfer: Option<TransferProgress>,
}

/// One admitted connection.
///
/// Every outbound write goes through the bounded queue drained by the
/// session's writer task, so concurrent producers never interleave bytes on
/// the socket.
pub struct Session {
    id: SessionId,
    name: String,
    peer_addr: SocketAddr,
    connected_at: DateTime<Local>,
    options: SessionOptions,
    outbound: mpsc::Sender<Frame>,
    closed: Arc<watch::Sender<bool>>,
    inbound: Mutex<FileReceiver>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a session whose outbound frames land in the returned receiver
    pub fn with_channel(
        id: SessionId,
        name: impl Into<String>,
        peer_addr: SocketAddr,
        options: SessionOptions,
        inbound: FileReceiver,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (outbound, frames) = mpsc::channel(options.queue_depth.max(1));
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            name: name.into(),
            peer_addr,
            connected_at: Local::now(),
            options,
            outbound,
            closed: Arc::new(closed),
            inbound: Mutex::new(inbound),
        });
        (session, frames)
    }

    /// Build a session and spawn the writer task that owns `writer`
    pub fn spawn<W>(
        id: SessionId,
        name: impl Into<String>,
        peer_addr: SocketAddr,
        writer: W,
        options: SessionOptions,
        inbound: FileReceiver,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (session, frames) = Self::with_channel(id, name, peer_addr, options, inbound);
        let closed = Arc::clone(&session.closed);
        tokio::spawn(run_writer(id, writer, frames, closed));
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn codec(&self) -> FrameCodec {
        self.options.codec
    }

    /// Inbound file-transfer state, driven only by this session's driver
    pub fn inbound(&self) -> &Mutex<FileReceiver> {
        &self.inbound
    }

    /// Queue an encoded frame, waiting at most the configured send timeout
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::SendFailure(self.name.clone()));
        }
        match timeout(self.options.send_timeout, self.outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                debug!(session = %self.id, name = %self.name, "outbound queue closed");
                Err(RelayError::SendFailure(self.name.clone()))
            }
            Err(_) => {
                debug!(session = %self.id, name = %self.name, "outbound queue full past timeout");
                Err(RelayError::SendFailure(self.name.clone()))
            }
        }
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame: Frame = self.options.codec.encode(envelope)?.into();
        self.send_frame(frame).await
    }

    /// Ask the driver and writer of this session to stop
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` was called or the writer failed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        wait_closed(&mut rx).await;
    }

    pub async fn info(&self) -> SessionInfo {
        let inbound_transfer = self.inbound.lock().await.progress();
        SessionInfo {
            id: self.id,
            name: self.name.clone(),
            peer_addr: self.peer_addr,
            connected_at: self.connected_at,
            inbound_transfer,
        }
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// Drain the outbound queue onto the socket until the session goes away
async fn run_writer<W>(
    id: SessionId,
    mut writer: W,
    mut frames: mpsc::Receiver<Frame>,
    closed: Arc<watch::Sender<bool>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut closed_rx = closed.subscribe();
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = wait_closed(&mut closed_rx) => break,
        };

        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(session = %id, error = %e, "write failed; closing session");
            closed.send_replace(true);
            break;
        }
        trace!(session = %id, bytes = frame.len(), "frame written");
    }

    frames.close();
    if let Err(e) = writer.shutdown().await {
        trace!(session = %id, error = %e, "writer shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_transfer::NamingScheme;
    use crate::protocol::{Message, MessageKind};

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn receiver() -> FileReceiver {
        FileReceiver::new(std::env::temp_dir(), NamingScheme::Plain)
    }

    #[tokio::test]
    async fn frames_reach_the_writer() {
        let (client, mut server) = tokio::io::duplex(4096);
        let session = Session::spawn(
            SessionId(1),
            "alice",
            addr(),
            client,
            SessionOptions::default(),
            receiver(),
        );

        session.send(&Message::text("hi").into_envelope()).await.unwrap();
        let envelope = FrameCodec::default().read_envelope(&mut server).await.unwrap();
        assert_eq!(envelope.kind, MessageKind::Text);
        assert_eq!(envelope.data, "hi");
    }

    #[tokio::test]
    async fn closed_session_refuses_frames() {
        let (session, _frames) = Session::with_channel(
            SessionId(2),
            "bob",
            addr(),
            SessionOptions::default(),
            receiver(),
        );
        session.close();
        session.closed().await;
        assert!(session.is_closed());
        assert!(matches!(
            session.send(&Message::text("x").into_envelope()).await,
            Err(RelayError::SendFailure(name)) if name == "bob"
        ));
    }

    #[tokio::test]
    async fn full_queue_times_out() {
        let options = SessionOptions {
            queue_depth: 1,
            send_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (session, _frames) =
            Session::with_channel(SessionId(3), "carol", addr(), options, receiver());
        let envelope = Message::text("x").into_envelope();
        session.send(&envelope).await.unwrap();
        assert!(session.send(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_a_send_failure() {
        let (session, frames) = Session::with_channel(
            SessionId(4),
            "dave",
            addr(),
            SessionOptions::default(),
            receiver(),
        );
        drop(frames);
        assert!(session.send(&Message::text("x").into_envelope()).await.is_err());
    }
}
