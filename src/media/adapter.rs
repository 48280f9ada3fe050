//! Binding to the peer-to-peer negotiation primitive.
//!
//! Implementations of [`MediaNegotiator`] wrap the platform's peer connection.
//! They report asynchronous happenings (remote tracks, locally gathered
//! candidates, connection loss) as [`MediaEvent`]s through the
//! [`MediaEventSink`] they are given, which feeds the owning session's mailbox.

use async_trait::async_trait;
use callcore::{CallError, CallRole, IceCandidateInit};
use log::{debug, warn};
use tokio::sync::mpsc;

use super::local::TrackHandle;
use crate::session::SessionEvent;

/// Opaque handle to the remote media stream, forwarded untouched to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: String,
}

impl StreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Remote media arrived.
    RemoteTrack(StreamHandle),
    /// A locally gathered candidate that must reach the peer.
    LocalCandidate(IceCandidateInit),
    /// The connection failed after setup.
    Failed(String),
}

/// Where a peer session reports its [`MediaEvent`]s.
#[derive(Clone)]
pub struct MediaEventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl MediaEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the session is gone.
    pub fn emit(&self, event: MediaEvent) -> bool {
        self.tx.send(SessionEvent::Media(event)).is_ok()
    }

    pub fn remote_track(&self, stream: StreamHandle) -> bool {
        self.emit(MediaEvent::RemoteTrack(stream))
    }

    pub fn local_candidate(&self, candidate: IceCandidateInit) -> bool {
        self.emit(MediaEvent::LocalCandidate(candidate))
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.emit(MediaEvent::Failed(reason.into()))
    }
}

/// Creates peer sessions.
pub trait MediaNegotiator: Send + Sync {
    fn create_session(&self, events: MediaEventSink) -> Result<Box<dyn PeerSession>, anyhow::Error>;
}

/// One peer connection. Descriptions are SDP strings.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&mut self) -> Result<String, anyhow::Error>;

    /// Applies the remote offer and produces the local answer.
    async fn create_answer(&mut self, remote_offer: &str) -> Result<String, anyhow::Error>;

    async fn set_remote_answer(&mut self, answer: &str) -> Result<(), anyhow::Error>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), anyhow::Error>;

    async fn attach_local_track(&mut self, track: &TrackHandle) -> Result<(), anyhow::Error>;

    async fn close(&mut self);
}

/// Role-checked wrapper around a [`PeerSession`].
///
/// Tracks whether the remote description has been applied; it does not queue
/// candidates itself.
pub struct MediaSessionAdapter {
    peer: Box<dyn PeerSession>,
    role: CallRole,
    remote_applied: bool,
    closed: bool,
}

impl MediaSessionAdapter {
    pub fn create(
        negotiator: &dyn MediaNegotiator,
        role: CallRole,
        events: MediaEventSink,
    ) -> Result<Self, CallError> {
        let peer = negotiator
            .create_session(events)
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        Ok(Self {
            peer,
            role,
            remote_applied: false,
            closed: false,
        })
    }

    fn check(&self, expected: Option<CallRole>, op: &str) -> Result<(), CallError> {
        if self.closed {
            return Err(CallError::NegotiationFailed(format!("{op} on closed session")));
        }
        match expected {
            Some(role) if role != self.role => Err(CallError::NegotiationFailed(format!(
                "{op} is not valid for {:?}",
                self.role
            ))),
            _ => Ok(()),
        }
    }

    pub async fn generate_offer(&mut self) -> Result<String, CallError> {
        self.check(Some(CallRole::Caller), "generate_offer")?;
        self.peer
            .create_offer()
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))
    }

    pub async fn generate_answer(&mut self, remote_sdp: &str) -> Result<String, CallError> {
        self.check(Some(CallRole::Callee), "generate_answer")?;
        let answer = self
            .peer
            .create_answer(remote_sdp)
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        self.remote_applied = true;
        Ok(answer)
    }

    pub async fn apply_remote_answer(&mut self, sdp: &str) -> Result<(), CallError> {
        self.check(Some(CallRole::Caller), "apply_remote_answer")?;
        self.peer
            .set_remote_answer(sdp)
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        self.remote_applied = true;
        Ok(())
    }

    /// Callers must hold candidates back until [`Self::has_remote_description`].
    pub async fn add_ice_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), CallError> {
        self.check(None, "add_ice_candidate")?;
        if !self.remote_applied {
            return Err(CallError::NegotiationFailed(
                "candidate added before remote description".into(),
            ));
        }
        self.peer
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))
    }

    pub async fn attach_local_track(&mut self, track: &TrackHandle) -> Result<(), CallError> {
        self.check(None, "attach_local_track")?;
        self.peer
            .attach_local_track(track)
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_applied
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the peer connection. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(target: "Call/Media", "Closing peer session");
        self.peer.close().await;
    }
}

impl Drop for MediaSessionAdapter {
    fn drop(&mut self) {
        if !self.closed {
            warn!(target: "Call/Media", "Peer session dropped without close");
        }
    }
}
