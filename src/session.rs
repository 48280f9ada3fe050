//! The call session actor.
//!
//! A [`CallSession`] owns everything belonging to one call attempt: its
//! identity and role, the state machine, the local tracks, the peer session,
//! the per-call signaling channel and the timers. All of it is mutated from a
//! single task that drains the session mailbox, so local intents, remote
//! signaling, media callbacks and timer expiries are handled strictly one at a
//! time, in the order they were observed.
//!
//! Media acquisition is the only step that can wait on the user. It runs in a
//! separate task and reports back through the mailbox, which keeps the
//! session responsive: a hang-up issued during a permission prompt ends the
//! call immediately and the tracks are released once they arrive.

use callcore::{
    CallError, CallFailure, CallIdentity, CallRecord, CallRecordStatus, CallRole, CallState,
    CallTransition, EndCode, EndReason, IceCandidateInit, SignalMessage,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::events::EventBus;
use crate::media::{
    LocalMediaManager, MediaDevices, MediaEvent, MediaEventSink, MediaNegotiator,
    MediaSessionAdapter, StreamHandle, TrackSet,
};
use crate::records::{CallRecordSink, RecordWriter};
use crate::signaling::SignalingChannel;

/// Something the local user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalIntent {
    Accept,
    Reject,
    HangUp,
    SetMuted(bool),
    SetVideoEnabled(bool),
}

pub type IntentReply = oneshot::Sender<Result<(), CallError>>;

/// Everything a session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Local(LocalIntent, Option<IntentReply>),
    Remote(SignalMessage),
    MediaAcquired(Result<TrackSet, CallError>),
    Media(MediaEvent),
    RingTimeout,
}

/// Collaborators shared by every session of a registry.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: CallConfig,
    pub negotiator: Arc<dyn MediaNegotiator>,
    pub devices: Arc<dyn MediaDevices>,
    pub records: Arc<dyn CallRecordSink>,
    pub events: Arc<EventBus>,
}

pub struct CallSession {
    identity: CallIdentity,
    role: CallRole,
    state: CallState,
    deps: SessionDeps,
    signaling: SignalingChannel,
    media: Option<MediaSessionAdapter>,
    local_media: LocalMediaManager,
    remote_offer: Option<String>,
    remote_stream: Option<StreamHandle>,
    pending_candidates: VecDeque<IceCandidateInit>,
    ring_timer: Option<JoinHandle<()>>,
    duration_timer: Option<JoinHandle<()>>,
    connected_at: Option<Instant>,
    torn_down: bool,
    records: RecordWriter,
    mailbox: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<CallState>,
}

impl CallSession {
    pub(crate) fn new(
        identity: CallIdentity,
        role: CallRole,
        signaling: SignalingChannel,
        deps: SessionDeps,
        mailbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, watch::Receiver<CallState>) {
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let local_media = LocalMediaManager::new(deps.devices.clone());
        let records = RecordWriter::spawn(deps.records.clone());
        let session = Self {
            identity,
            role,
            state: CallState::Idle,
            deps,
            signaling,
            media: None,
            local_media,
            remote_offer: None,
            remote_stream: None,
            pending_candidates: VecDeque::new(),
            ring_timer: None,
            duration_timer: None,
            connected_at: None,
            torn_down: false,
            records,
            mailbox,
            state_tx,
        };
        (session, state_rx)
    }

    pub fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn remote_stream(&self) -> Option<&StreamHandle> {
        self.remote_stream.as_ref()
    }

    pub fn local_tracks(&self) -> Option<&TrackSet> {
        self.local_media.tracks()
    }

    /// Drains the mailbox until the session is terminal and no acquisition
    /// is outstanding.
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        if self.role == CallRole::Caller {
            self.initiate().await;
        }
        while !self.is_finished() {
            let Some(event) = events.recv().await else {
                break;
            };
            self.handle(event).await;
        }
        self.teardown().await;
        debug!(target: "Call/Session", "Session actor for call {} stopped", self.identity.call_id);
    }

    fn is_finished(&self) -> bool {
        self.state.is_terminal() && !self.local_media.is_pending()
    }

    pub async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Local(intent, reply) => {
                let result = self.on_local(intent).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                } else if let Err(e) = result {
                    debug!(target: "Call/Session", "{intent:?} rejected: {e}");
                }
            }
            SessionEvent::Remote(message) => self.on_remote(message).await,
            SessionEvent::MediaAcquired(result) => self.on_media_acquired(result).await,
            SessionEvent::Media(event) => self.on_media_event(event).await,
            SessionEvent::RingTimeout => {
                if self.state == CallState::Ringing {
                    info!(target: "Call/Session", "Call {} was not answered in time", self.identity.call_id);
                    self.fail(CallFailure::Timeout).await;
                }
            }
        }
    }

    // --- outgoing ---

    async fn initiate(&mut self) {
        if !self.advance(CallTransition::Initiate).await {
            return;
        }
        info!(
            target: "Call/Session",
            "Calling {} ({}), call {}",
            self.identity.callee_id, self.identity.kind, self.identity.call_id
        );
        if let Err(e) = self.create_media() {
            self.fail_with(&e).await;
            return;
        }
        self.local_media
            .begin_acquire(self.identity.kind, self.mailbox.clone());
    }

    async fn send_offer(&mut self) -> Result<(), CallError> {
        let sdp = self.media_mut()?.generate_offer().await?;
        self.signaling
            .send(SignalMessage::Offer {
                sdp,
                kind: self.identity.kind,
            })
            .await?;
        if self.advance(CallTransition::OfferSent).await {
            self.start_ring_timer();
            self.record(CallRecordStatus::Ringing);
        }
        Ok(())
    }

    async fn on_answer(&mut self, sdp: String) {
        if self.role != CallRole::Caller || self.state != CallState::Ringing {
            warn!(target: "Call/Session", "Ignoring answer in state {}", self.state);
            return;
        }
        self.stop_ring_timer();
        let applied = match self.media_mut() {
            Ok(media) => media.apply_remote_answer(&sdp).await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            self.fail_with(&e).await;
            return;
        }
        if self.advance(CallTransition::AnswerReceived).await {
            self.flush_candidates().await;
            self.connect_if_ready().await;
        }
    }

    // --- incoming ---

    async fn on_offer(&mut self, sdp: String) {
        if self.role != CallRole::Callee || self.state != CallState::Idle {
            debug!(target: "Call/Session", "Ignoring repeated offer in state {}", self.state);
            return;
        }
        self.remote_offer = Some(sdp);
        if self.advance(CallTransition::OfferReceived).await {
            info!(
                target: "Call/Session",
                "Incoming {} call {} from {}",
                self.identity.kind, self.identity.call_id, self.identity.caller_id
            );
            self.deps.events.emit_incoming(self.identity.clone());
        }
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        if !self.state.can_accept() {
            return Err(self.invalid("accept"));
        }
        self.advance(CallTransition::Accepted).await;
        self.record(CallRecordStatus::Accepted);
        if let Err(e) = self.create_media() {
            self.fail_with(&e).await;
            return Err(e);
        }
        self.local_media
            .begin_acquire(self.identity.kind, self.mailbox.clone());
        Ok(())
    }

    async fn send_answer(&mut self) -> Result<(), CallError> {
        let offer = self
            .remote_offer
            .clone()
            .ok_or_else(|| CallError::NegotiationFailed("no remote offer".into()))?;
        let sdp = self.media_mut()?.generate_answer(&offer).await?;
        self.flush_candidates().await;
        self.signaling.send(SignalMessage::Answer { sdp }).await?;
        self.connect_if_ready().await;
        Ok(())
    }

    async fn reject(&mut self) -> Result<(), CallError> {
        if !self.state.can_accept() {
            return Err(self.invalid("reject"));
        }
        self.send_end(EndCode::Rejected).await;
        self.record(CallRecordStatus::Rejected);
        self.advance(CallTransition::Rejected).await;
        Ok(())
    }

    // --- shared ---

    async fn on_local(&mut self, intent: LocalIntent) -> Result<(), CallError> {
        match intent {
            LocalIntent::Accept => self.accept().await,
            LocalIntent::Reject => self.reject().await,
            LocalIntent::HangUp => self.hang_up().await,
            LocalIntent::SetMuted(muted) => {
                if self.state.is_terminal() || !self.local_media.set_audio_enabled(!muted) {
                    return Err(self.invalid("mute"));
                }
                Ok(())
            }
            LocalIntent::SetVideoEnabled(enabled) => {
                if self.state.is_terminal() || !self.local_media.set_video_enabled(enabled) {
                    return Err(self.invalid("toggle video"));
                }
                Ok(())
            }
        }
    }

    async fn hang_up(&mut self) -> Result<(), CallError> {
        if self.state.is_terminal() {
            // A racing remote `end` got here first.
            return Ok(());
        }
        if self.state.is_incoming() {
            return self.reject().await;
        }
        if !self.state.can_hang_up() {
            return Err(self.invalid("hang up"));
        }
        self.send_end(EndCode::Hangup).await;
        self.advance(CallTransition::HangUp).await;
        Ok(())
    }

    async fn on_remote(&mut self, message: SignalMessage) {
        if self.state.is_terminal() {
            debug!(
                target: "Call/Session",
                "Ignoring {} for finished call {}",
                message.signal_type(),
                self.identity.call_id
            );
            return;
        }
        match message {
            SignalMessage::Offer { sdp, .. } => self.on_offer(sdp).await,
            SignalMessage::Answer { sdp } => self.on_answer(sdp).await,
            SignalMessage::IceCandidate(candidate) => self.on_remote_candidate(candidate).await,
            SignalMessage::End(code) => {
                info!(target: "Call/Session", "Peer ended call {} ({code:?})", self.identity.call_id);
                self.advance(CallTransition::RemoteEnded(code)).await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidateInit) {
        match self.media.as_mut() {
            Some(media) if media.has_remote_description() => {
                if let Err(e) = media.add_ice_candidate(&candidate).await {
                    warn!(target: "Call/Session", "Failed to add remote candidate: {e}");
                }
            }
            _ => self.pending_candidates.push_back(candidate),
        }
    }

    /// Applies queued candidates in receipt order. Only valid once the remote
    /// description is in place.
    async fn flush_candidates(&mut self) {
        let Some(media) = self.media.as_mut() else {
            return;
        };
        if !media.has_remote_description() {
            return;
        }
        if !self.pending_candidates.is_empty() {
            debug!(
                target: "Call/Session",
                "Applying {} queued candidate(s)",
                self.pending_candidates.len()
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = media.add_ice_candidate(&candidate).await {
                warn!(target: "Call/Session", "Failed to add queued candidate: {e}");
            }
        }
    }

    async fn on_media_acquired(&mut self, result: Result<TrackSet, CallError>) {
        let tracks = match self.local_media.on_acquired(result) {
            Ok(Some(tracks)) => tracks,
            // Late arrival after teardown, already released.
            Ok(None) => return,
            Err(e) => {
                if !self.state.is_terminal() {
                    warn!(target: "Call/Session", "Local media unavailable: {e}");
                    self.fail_with(&e).await;
                }
                return;
            }
        };

        if let Err(e) = self.attach_tracks(&tracks).await {
            self.fail_with(&e).await;
            return;
        }

        let sent = match self.role {
            CallRole::Caller => self.send_offer().await,
            CallRole::Callee => self.send_answer().await,
        };
        if let Err(e) = sent {
            self.fail_with(&e).await;
        }
    }

    async fn attach_tracks(&mut self, tracks: &TrackSet) -> Result<(), CallError> {
        let media = self.media_mut()?;
        for track in tracks.tracks() {
            media.attach_local_track(track).await?;
        }
        Ok(())
    }

    async fn on_media_event(&mut self, event: MediaEvent) {
        if self.state.is_terminal() {
            return;
        }
        match event {
            MediaEvent::RemoteTrack(stream) => {
                debug!(target: "Call/Session", "Remote stream {} arrived", stream.id);
                self.remote_stream = Some(stream);
                self.connect_if_ready().await;
            }
            MediaEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.signaling.send(SignalMessage::IceCandidate(candidate)).await {
                    warn!(target: "Call/Session", "Failed to send local candidate: {e}");
                }
            }
            MediaEvent::Failed(reason) => {
                warn!(target: "Call/Session", "Media connection failed: {reason}");
                self.fail(CallFailure::NegotiationFailed).await;
            }
        }
    }

    async fn connect_if_ready(&mut self) {
        if self.state != CallState::Negotiating {
            return;
        }
        let Some(stream) = self.remote_stream.clone() else {
            return;
        };
        if self.advance(CallTransition::RemoteTrack).await {
            info!(target: "Call/Session", "Call {} connected", self.identity.call_id);
            self.connected_at = Some(Instant::now());
            self.start_duration_timer();
            self.deps
                .events
                .emit_remote_stream(&self.identity.call_id, stream);
        }
    }

    // --- failure & teardown ---

    async fn fail_with(&mut self, err: &CallError) {
        self.fail(CallFailure::from_error(err)).await;
    }

    /// Best-effort `end` to the peer, then `Failed`.
    async fn fail(&mut self, failure: CallFailure) {
        if self.state.is_terminal() {
            return;
        }
        warn!(target: "Call/Session", "Call {} failed: {failure:?}", self.identity.call_id);
        self.send_end(failure.end_code()).await;
        self.advance(CallTransition::Fail(failure)).await;
    }

    async fn send_end(&self, code: EndCode) {
        if let Err(e) = self.signaling.send(SignalMessage::End(code)).await {
            warn!(
                target: "Call/Session",
                "Could not notify {} that call {} ended: {e}",
                self.signaling.peer(),
                self.identity.call_id
            );
        }
    }

    /// Applies `transition`. Entering a terminal state publishes it, tears the
    /// session down and reports the end. Returns whether the state changed.
    async fn advance(&mut self, transition: CallTransition) -> bool {
        let previous = self.state;
        let next = match previous.apply(transition) {
            Ok(next) => next,
            Err(e) => {
                warn!(target: "Call/Session", "Call {}: {e}", self.identity.call_id);
                return false;
            }
        };
        debug!(
            target: "Call/Session",
            "Call {}: {previous} -> {next}",
            self.identity.call_id
        );
        self.state = next;
        self.state_tx.send_replace(next);
        self.deps.events.emit_state(&self.identity.call_id, next);

        if let Some(reason) = next.end_reason() {
            let duration_secs = self.connected_at.map(|t| t.elapsed().as_secs());
            self.teardown().await;
            if self.should_record_end(previous, reason) {
                self.record(CallRecordStatus::Ended);
            }
            info!(
                target: "Call/Session",
                "Call {} ended: {reason:?}",
                self.identity.call_id
            );
            self.deps
                .events
                .emit_ended(&self.identity.call_id, reason, duration_secs);
        }
        true
    }

    fn should_record_end(&self, previous: CallState, reason: EndReason) -> bool {
        match previous {
            CallState::Negotiating | CallState::Connected => true,
            CallState::Ringing => matches!(reason, EndReason::LocalHangUp | EndReason::Failure(_)),
            _ => false,
        }
    }

    /// Releases local tracks, closes the peer session and unsubscribes from
    /// signaling, in that order. Timers stop first. Idempotent.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.stop_ring_timer();
        if let Some(timer) = self.duration_timer.take() {
            timer.abort();
        }
        self.local_media.release();
        if let Some(media) = self.media.as_mut() {
            media.close().await;
        }
        self.signaling.close();
        self.pending_candidates.clear();
        debug!(target: "Call/Session", "Call {} torn down", self.identity.call_id);
    }

    // --- helpers ---

    fn create_media(&mut self) -> Result<(), CallError> {
        if self.media.is_some() {
            return Ok(());
        }
        let sink = MediaEventSink::new(self.mailbox.clone());
        self.media = Some(MediaSessionAdapter::create(
            self.deps.negotiator.as_ref(),
            self.role,
            sink,
        )?);
        Ok(())
    }

    fn media_mut(&mut self) -> Result<&mut MediaSessionAdapter, CallError> {
        self.media
            .as_mut()
            .ok_or_else(|| CallError::NegotiationFailed("no peer session".into()))
    }

    fn invalid(&self, action: &'static str) -> CallError {
        CallError::InvalidState {
            state: self.state,
            action,
        }
    }

    fn record(&self, status: CallRecordStatus) {
        self.records
            .write(CallRecord::from_identity(&self.identity, status));
    }

    fn start_ring_timer(&mut self) {
        let mailbox = self.mailbox.clone();
        let timeout = self.deps.config.ring_timeout;
        self.ring_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = mailbox.send(SessionEvent::RingTimeout);
        }));
    }

    fn stop_ring_timer(&mut self) {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
    }

    fn start_duration_timer(&mut self) {
        let events = self.deps.events.clone();
        let call_id = self.identity.call_id.clone();
        let tick = self.deps.config.duration_tick;
        let started = Instant::now();
        self.duration_timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                events.emit_duration(&call_id, started.elapsed().as_secs());
            }
        }));
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.stop_ring_timer();
        if let Some(timer) = self.duration_timer.take() {
            timer.abort();
        }
        self.local_media.release();
        self.signaling.close();
    }
}
