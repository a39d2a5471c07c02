use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use super::config::RelayConfig;
use super::driver::{DriverContext, drive};
use super::registry::SessionRegistry;
use super::router::{BroadcastReport, RouteSink, Router};
use super::session::SessionInfo;
use crate::error::{RelayError, Result};
use crate::file_transfer::{ProgressObserver, TransferSummary, TransferTarget, send_file};
use crate::protocol::{Message, TextMessage};
use crate::utils::{chat_timestamp, format_chat_line};

/// Sender name used for messages and files originating at the relay
pub const SERVER_NAME: &str = "Server";

/// Listening relay. Consumed by [`Server::run_until`].
pub struct Server {
    listener: TcpListener,
    handle: RelayHandle,
}

impl Server {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let registry = Arc::new(SessionRegistry::new());
        let ctx = DriverContext {
            router: Router::new(registry, config.codec()),
            options: config.session_options(),
            received_dir: config.received_dir.clone(),
        };
        let (shutdown, _) = watch::channel(false);

        info!(addr = %listener.local_addr()?, "relay listening");
        Ok(Self {
            listener,
            handle: RelayHandle {
                ctx: Arc::new(ctx),
                shutdown: Arc::new(shutdown),
                transfer: Arc::new(Mutex::new(())),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Accept connections until `shutdown` resolves or [`RelayHandle::shutdown`]
    /// is called, then close every admitted session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server { listener, handle } = self;
        let mut stop = handle.shutdown.subscribe();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = stopped(&mut stop) => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => handle.spawn_driver(stream, peer_addr),
                    Err(e) if handle.is_shutting_down() => {
                        debug!(error = %e, "accept failed during shutdown");
                        break Ok(());
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed; stopping relay");
                        break Err(RelayError::Io(e));
                    }
                },
            }
        };

        handle.shutdown.send_replace(true);
        let sessions = handle.ctx.router.registry().drain();
        info!(sessions = sessions.len(), "relay shutting down");
        for session in sessions {
            session.close();
        }
        result
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Admin-side operations on a running relay
#[derive(Debug, Clone)]
pub struct RelayHandle {
    ctx: Arc<DriverContext>,
    shutdown: Arc<watch::Sender<bool>>,
    // one relay-originated transfer on the wire at a time
    transfer: Arc<Mutex<()>>,
}

impl RelayHandle {
    fn spawn_driver(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(peer = %peer_addr, "connection accepted");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "could not set TCP_NODELAY");
        }
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            match drive(reader, writer, peer_addr, &ctx).await {
                Ok(()) => {}
                Err(RelayError::EndOfStream) => debug!(peer = %peer_addr, "closed before joining"),
                Err(e) => warn!(peer = %peer_addr, error = %e, "connection rejected"),
            }
        });
    }

    fn router(&self) -> &Router {
        &self.ctx.router
    }

    fn registry(&self) -> &SessionRegistry {
        self.ctx.router.registry()
    }

    fn server_text(body: &str) -> Message {
        let timestamp = chat_timestamp(Local::now());
        Message::Text(TextMessage {
            body: format_chat_line(&timestamp, SERVER_NAME, body),
            sender: Some(SERVER_NAME.to_string()),
            timestamp: Some(timestamp),
        })
    }

    pub async fn broadcast_text(&self, body: &str) -> BroadcastReport {
        let envelope = Self::server_text(body).into_envelope();
        self.router().broadcast(&envelope, None).await
    }

    /// Private message to one user; false when nobody by that name is reachable
    pub async fn direct_text(&self, name: &str, body: &str) -> bool {
        let envelope = Self::server_text(&format!("[private] {body}")).into_envelope();
        self.router().direct_to(name, &envelope).await
    }

    /// Send a local file to everyone or one user.
    ///
    /// A directed send to an unknown name fails with `LookupMiss` before
    /// anything goes on the wire. Concurrent sends wait for each other.
    pub async fn send_file(
        &self,
        target: TransferTarget,
        path: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<TransferSummary> {
        if let TransferTarget::User(name) = &target
            && self.registry().lookup_by_name(name).is_none()
        {
            return Err(RelayError::LookupMiss(name.clone()));
        }
        let _transfer = self.transfer.lock().await;
        let sink = RouteSink::new(self.router(), target);
        send_file(&sink, path, SERVER_NAME, observer).await
    }

    pub async fn session_list(&self) -> Vec<SessionInfo> {
        let sessions = self.registry().snapshot();
        join_all(sessions.iter().map(|session| session.info())).await
    }

    pub async fn session_info(&self, name: &str) -> Option<SessionInfo> {
        let session = self.registry().lookup_by_name(name)?;
        Some(session.info().await)
    }

    pub fn count_online(&self) -> usize {
        self.registry().count_online()
    }

    /// Sessions whose name contains `pattern`, ignoring case
    pub async fn find_sessions(&self, pattern: &str) -> Vec<SessionInfo> {
        let pattern = pattern.to_lowercase();
        let matches: Vec<_> = self
            .registry()
            .snapshot()
            .into_iter()
            .filter(|session| session.name().to_lowercase().contains(&pattern))
            .collect();
        join_all(matches.iter().map(|session| session.info())).await
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}
