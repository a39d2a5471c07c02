use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::registry::SessionRegistry;
use super::session::{Frame, Session, SessionId};
use crate::error::{RelayError, Result};
use crate::file_transfer::{EnvelopeSink, TransferTarget};
use crate::protocol::{Envelope, FrameCodec, Message, Presence};

pub fn join_notice(name: &str) -> Envelope {
    Message::Join(Presence::notice(name, format!("user '{name}' joined the chat"))).into_envelope()
}

pub fn leave_notice(name: &str) -> Envelope {
    Message::Leave(Presence::notice(name, format!("user '{name}' left the chat"))).into_envelope()
}

/// Outcome of one fan-out
#[derive(Debug, Default, Clone)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<SessionId>,
}

/// Broadcast and directed delivery over the session registry
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<SessionRegistry>,
    codec: FrameCodec,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, codec: FrameCodec) -> Self {
        Self { registry, codec }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send to every admitted session except `exclude`.
    ///
    /// Recipients that cannot be reached are removed and announced as having
    /// left; delivery to the others carries on.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<SessionId>) -> BroadcastReport {
        let report = self.fan_out(envelope, exclude).await;
        if !report.failed.is_empty() {
            self.drop_sessions(report.failed.clone()).await;
        }
        report
    }

    /// Send to the first session named `name`; false on lookup miss or
    /// delivery failure, in which case the recipient is dropped
    pub async fn direct_to(&self, name: &str, envelope: &Envelope) -> bool {
        let Some(session) = self.registry.lookup_by_name(name) else {
            debug!(name, kind = %envelope.kind, "directed send to unknown name");
            return false;
        };
        self.deliver_to(&session, envelope).await
    }

    /// Send to one known session; false (and the session dropped) on failure
    pub async fn deliver_to(&self, session: &Arc<Session>, envelope: &Envelope) -> bool {
        match session.send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session = %session.id(), name = %session.name(), error = %e, "directed send failed");
                self.drop_sessions(vec![session.id()]).await;
                false
            }
        }
    }

    /// Remove a session, close it and tell everyone else it left.
    ///
    /// Returns the session only to the caller that actually removed it, so
    /// each departure is announced once.
    pub async fn disconnect(&self, id: SessionId) -> Option<Arc<Session>> {
        let session = self.registry.remove(id)?;
        session.close();
        let report = self.fan_out(&leave_notice(session.name()), None).await;
        if !report.failed.is_empty() {
            self.drop_sessions(report.failed).await;
        }
        Some(session)
    }

    async fn fan_out(&self, envelope: &Envelope, exclude: Option<SessionId>) -> BroadcastReport {
        let frame: Frame = match self.codec.encode(envelope) {
            Ok(frame) => frame.into(),
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "cannot encode broadcast");
                return BroadcastReport::default();
            }
        };

        let recipients: Vec<Arc<Session>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .collect();

        let results = join_all(recipients.iter().map(|session| {
            let frame = Arc::clone(&frame);
            async move { (session.id(), session.send_frame(frame).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(session = %id, kind = %envelope.kind, error = %e, "broadcast delivery failed");
                    report.failed.push(id);
                }
            }
        }
        report
    }

    /// Drop unreachable sessions; leave notices that fail in turn are
    /// handled by the same queue
    async fn drop_sessions(&self, ids: Vec<SessionId>) {
        let mut pending: VecDeque<SessionId> = ids.into();
        while let Some(id) = pending.pop_front() {
            let Some(session) = self.registry.remove(id) else {
                continue;
            };
            session.close();
            warn!(session = %id, name = %session.name(), "dropping unreachable session");
            let report = self.fan_out(&leave_notice(session.name()), None).await;
            pending.extend(report.failed);
        }
    }
}

/// Outbound transfer target on the relay: everyone, or one named user
pub struct RouteSink<'a> {
    router: &'a Router,
    target: TransferTarget,
    exclude: Option<SessionId>,
}

impl<'a> RouteSink<'a> {
    pub fn new(router: &'a Router, target: TransferTarget) -> Self {
        Self {
            router,
            target,
            exclude: None,
        }
    }

    pub fn excluding(mut self, id: SessionId) -> Self {
        self.exclude = Some(id);
        self
    }
}

#[async_trait]
impl EnvelopeSink for RouteSink<'_> {
    async fn deliver(&self, envelope: Envelope) -> Result<()> {
        match &self.target {
            TransferTarget::All => {
                self.router.broadcast(&envelope, self.exclude).await;
                Ok(())
            }
            TransferTarget::User(name) => {
                if self.router.direct_to(name, &envelope).await {
                    Ok(())
                } else {
                    Err(RelayError::SendFailure(name.clone()))
                }
            }
        }
    }

    fn describe(&self) -> String {
        self.target.to_string()
    }
}
