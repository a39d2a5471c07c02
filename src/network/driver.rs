use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::router::{Router, join_notice};
use super::session::{Session, SessionOptions};
use crate::error::{RelayError, Result};
use crate::file_transfer::{FileReceiver, LoggingObserver, NamingScheme, ReceiveEvent};
use crate::protocol::{Envelope, Message, MessageKind, TextMessage};
use crate::utils::{chat_timestamp, format_chat_line};

/// Shared state every connection driver works against
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub router: Router,
    pub options: SessionOptions,
    /// Where files relayed through this server are also persisted
    pub received_dir: PathBuf,
}

/// Display name requested in a join, or `User_<port>` when blank
pub fn display_name(requested: &str, peer_addr: SocketAddr) -> String {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        format!("User_{}", peer_addr.port())
    } else {
        trimmed.to_string()
    }
}

/// Why a session's read loop ended
#[derive(Debug)]
enum Exit {
    Left,
    Closed,
    Failed(RelayError),
}

/// Run one connection from handshake to teardown.
///
/// The first frame must be a join; anything else (or nothing) ends the
/// connection before the session is admitted.
pub async fn drive<R, W>(mut reader: R, writer: W, peer_addr: SocketAddr, ctx: &DriverContext) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let codec = ctx.options.codec;

    let first = codec.read_envelope(&mut reader).await?;
    if first.kind != MessageKind::Join {
        warn!(peer = %peer_addr, kind = %first.kind, "first frame was not a join; dropping connection");
        return Err(RelayError::MalformedFrame(format!(
            "expected join, got {}",
            first.kind
        )));
    }

    let name = display_name(&first.data, peer_addr);
    let registry = ctx.router.registry();
    let id = registry.next_id();
    let session = Session::spawn(
        id,
        name.clone(),
        peer_addr,
        writer,
        ctx.options,
        FileReceiver::new(&ctx.received_dir, NamingScheme::SenderPrefixed),
    );
    registry.admit(Arc::clone(&session));
    info!(session = %id, peer = %peer_addr, name = %name, "user joined");

    ctx.router.broadcast(&join_notice(&name), Some(id)).await;
    let welcome = format!(
        "Welcome to the chat, {name}! Users online: {}",
        registry.count_online()
    );
    ctx.router
        .deliver_to(&session, &Message::text(welcome).into_envelope())
        .await;

    let exit = loop {
        let envelope = tokio::select! {
            result = codec.read_envelope(&mut reader) => match result {
                Ok(envelope) => envelope,
                Err(e) => break Exit::Failed(e),
            },
            _ = session.closed() => break Exit::Closed,
        };

        if let ControlFlow::Break(exit) = dispatch(ctx, &session, envelope).await {
            break exit;
        }
    };

    match &exit {
        Exit::Left => info!(session = %id, name = %name, "user left"),
        Exit::Closed => debug!(session = %id, name = %name, "session closed by relay"),
        Exit::Failed(RelayError::EndOfStream) => info!(session = %id, name = %name, "connection closed"),
        Exit::Failed(e) => warn!(session = %id, name = %name, error = %e, "session terminated"),
    }

    session.inbound().lock().await.abort().await;
    ctx.router.disconnect(id).await;
    session.close();
    Ok(())
}

async fn dispatch(ctx: &DriverContext, session: &Arc<Session>, envelope: Envelope) -> ControlFlow<Exit> {
    match envelope.kind {
        MessageKind::Text => {
            let timestamp = chat_timestamp(Local::now());
            let line = format_chat_line(&timestamp, session.name(), &envelope.data);
            debug!(session = %session.id(), line = %line, "chat message");
            let text = Message::Text(TextMessage {
                body: line,
                sender: Some(session.name().to_string()),
                timestamp: Some(timestamp),
            });
            ctx.router
                .broadcast(&text.into_envelope(), Some(session.id()))
                .await;
        }
        MessageKind::File | MessageKind::FileData | MessageKind::FileComplete => {
            relay_file_message(ctx, session, envelope).await;
        }
        MessageKind::Join => {
            warn!(session = %session.id(), "join from an already admitted session");
            reply_error(ctx, session, "already joined").await;
        }
        MessageKind::Leave => return ControlFlow::Break(Exit::Left),
        MessageKind::Error => {
            warn!(session = %session.id(), name = %session.name(), error = %envelope.data, "peer reported an error");
        }
    }
    ControlFlow::Continue(())
}

/// Persist a file-transfer message locally, then pass it on verbatim
async fn relay_file_message(ctx: &DriverContext, session: &Arc<Session>, envelope: Envelope) {
    let kind = envelope.kind;
    let message = match Message::try_from(envelope.clone()) {
        Ok(message) => message,
        Err(e) => {
            warn!(session = %session.id(), kind = %kind, error = %e, "rejecting file message");
            session.inbound().lock().await.abort().await;
            reply_error(ctx, session, &format!("{kind} rejected: {e}")).await;
            return;
        }
    };

    let outcome = session
        .inbound()
        .lock()
        .await
        .handle(&message, &LoggingObserver)
        .await;
    match outcome {
        Ok(ReceiveEvent::Started { path, announce }) => {
            info!(
                session = %session.id(),
                filename = %announce.filename,
                size = announce.size,
                path = %path.display(),
                "relaying file"
            );
        }
        Ok(ReceiveEvent::Finished(file)) => {
            info!(
                session = %session.id(),
                transfer = %file.transfer_id,
                path = %file.path.display(),
                bytes = file.bytes_received,
                "file stored"
            );
        }
        Ok(ReceiveEvent::Chunk { .. } | ReceiveEvent::Ignored) => {}
        Err(e) => {
            warn!(session = %session.id(), kind = %kind, error = %e, "could not store inbound file");
            reply_error(ctx, session, &format!("relay could not store file: {e}")).await;
        }
    }

    ctx.router.broadcast(&envelope, Some(session.id())).await;
}

async fn reply_error(ctx: &DriverContext, session: &Arc<Session>, message: &str) {
    ctx.router
        .deliver_to(session, &Message::error(message).into_envelope())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::SessionRegistry;
    use crate::protocol::{FrameCodec, Presence};
    use std::time::Duration;
    use tokio::io::{DuplexStream, duplex};
    use tokio::time::timeout;

    fn addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    fn context(dir: &std::path::Path) -> DriverContext {
        let registry = Arc::new(SessionRegistry::new());
        DriverContext {
            router: Router::new(registry, FrameCodec::default()),
            options: SessionOptions::default(),
            received_dir: dir.to_path_buf(),
        }
    }

    /// Spawn a driver over in-memory pipes; returns the peer's ends
    fn connect(ctx: &DriverContext) -> (DuplexStream, DuplexStream) {
        let (peer_out, driver_in) = duplex(64 * 1024);
        let (driver_out, peer_in) = duplex(64 * 1024);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _ = drive(driver_in, driver_out, addr(), &ctx).await;
        });
        (peer_out, peer_in)
    }

    async fn next(io: &mut DuplexStream) -> Envelope {
        timeout(Duration::from_secs(2), FrameCodec::default().read_envelope(io))
            .await
            .expect("frame in time")
            .expect("frame")
    }

    async fn send(io: &mut DuplexStream, message: Message) {
        FrameCodec::default()
            .write_envelope(io, &message.into_envelope())
            .await
            .unwrap();
    }

    #[test]
    fn blank_names_fall_back_to_port() {
        assert_eq!(display_name("  ", addr()), "User_5555");
        assert_eq!(display_name(" ann ", addr()), "ann");
    }

    #[tokio::test]
    async fn non_join_first_frame_is_not_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (mut peer, reader) = duplex(1024);
        let (writer, _sink) = duplex(1024);

        FrameCodec::default()
            .write_envelope(&mut peer, &Message::text("hi").into_envelope())
            .await
            .unwrap();
        let result = drive(reader, writer, addr(), &ctx).await;

        assert!(matches!(result, Err(RelayError::MalformedFrame(_))));
        assert_eq!(ctx.router.registry().count_online(), 0);
    }

    #[tokio::test]
    async fn join_gets_welcome_and_text_is_relayed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let (mut a_out, mut a_in) = connect(&ctx);
        send(&mut a_out, Message::Join(Presence::request("ann"))).await;
        let welcome = next(&mut a_in).await;
        assert!(welcome.data.contains("Users online: 1"));

        let (mut b_out, mut b_in) = connect(&ctx);
        send(&mut b_out, Message::Join(Presence::request("ben"))).await;
        next(&mut b_in).await;

        let notice = next(&mut a_in).await;
        assert_eq!(notice.kind, MessageKind::Join);
        assert_eq!(notice.meta_str("name"), Some("ben"));

        send(&mut b_out, Message::text("hello")).await;
        let text = next(&mut a_in).await;
        assert_eq!(text.kind, MessageKind::Text);
        assert!(text.data.ends_with("ben: hello"));
        assert_eq!(text.meta_str("sender"), Some("ben"));
    }

    #[tokio::test]
    async fn second_join_is_answered_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let (mut out, mut inbound) = connect(&ctx);
        send(&mut out, Message::Join(Presence::request("ann"))).await;
        next(&mut inbound).await;

        send(&mut out, Message::Join(Presence::request("again"))).await;
        let reply = next(&mut inbound).await;
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(ctx.router.registry().names(), vec!["ann".to_string()]);
    }

    #[tokio::test]
    async fn invalid_chunk_is_rejected_and_not_relayed() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let (mut a_out, mut a_in) = connect(&ctx);
        send(&mut a_out, Message::Join(Presence::request("ann"))).await;
        next(&mut a_in).await;
        let (mut b_out, mut b_in) = connect(&ctx);
        send(&mut b_out, Message::Join(Presence::request("ben"))).await;
        next(&mut b_in).await;
        next(&mut a_in).await;

        FrameCodec::default()
            .write_envelope(&mut a_out, &Envelope::new(MessageKind::FileData, "not hex"))
            .await
            .unwrap();
        let reply = next(&mut a_in).await;
        assert_eq!(reply.kind, MessageKind::Error);

        send(&mut a_out, Message::text("after")).await;
        let relayed = next(&mut b_in).await;
        assert_eq!(relayed.kind, MessageKind::Text);
    }

    #[tokio::test]
    async fn leave_removes_session_and_notifies_others() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let (mut a_out, mut a_in) = connect(&ctx);
        send(&mut a_out, Message::Join(Presence::request("ann"))).await;
        next(&mut a_in).await;
        let (mut b_out, mut b_in) = connect(&ctx);
        send(&mut b_out, Message::Join(Presence::request("ben"))).await;
        next(&mut b_in).await;
        next(&mut a_in).await;

        send(&mut b_out, Message::Leave(Presence::request("ben"))).await;
        let notice = next(&mut a_in).await;
        assert_eq!(notice.kind, MessageKind::Leave);
        assert_eq!(notice.meta_str("name"), Some("ben"));
        assert_eq!(ctx.router.registry().names(), vec!["ann".to_string()]);
    }
}
