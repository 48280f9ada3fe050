//! Binding between call sessions and the external publish/subscribe transport.
//!
//! Each local user listens on a single inbox channel (`calls:<user_id>`). The
//! [`SignalingHub`] owns that subscription and routes every decoded envelope by
//! call id to the mailbox of the session handling it. A [`SignalingChannel`]
//! is the per-call view: it publishes to the peer's inbox and, when closed,
//! removes the call's route.
//!
//! The first `offer` for an unknown call id gets a fresh mailbox before the
//! registry has decided what to do with it, so candidates trickling in right
//! behind the offer are queued instead of dropped. Candidates that overtake
//! their offer are parked in a small per-call buffer and replayed into the
//! mailbox right after the offer.

use async_trait::async_trait;
use callcore::{
    CallError, CallId, CallKind, EndCode, IceCandidateInit, SignalEnvelope, SignalMessage, UserId,
};
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::session::SessionEvent;

/// Callback invoked for every payload published on a subscribed channel.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by [`PubSub::subscribe`].
pub trait Subscription: Send + Sync {
    /// Stops delivery to the handler. Calling it more than once is a no-op.
    fn unsubscribe(&self);
}

/// The hosted realtime channel primitive.
///
/// Delivery is at-most-once; within one channel, messages are expected in
/// publish order.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), anyhow::Error>;

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, anyhow::Error>;
}

/// Name of the channel a user receives signaling on.
pub fn inbox_channel(user: &UserId) -> String {
    format!("calls:{user}")
}

type Routes = DashMap<CallId, mpsc::UnboundedSender<SessionEvent>>;

/// Candidates kept per call id while its offer is still in flight.
const MAX_EARLY_CANDIDATES: usize = 16;
/// Call ids with parked candidates at any one time.
const MAX_EARLY_CALLS: usize = 8;
/// Parked candidates older than this are discarded.
const EARLY_CANDIDATE_TTL: Duration = Duration::from_secs(10);

struct EarlyCandidates {
    first_seen: Instant,
    candidates: Vec<IceCandidateInit>,
}

/// Candidates that arrived before the offer of their call.
#[derive(Default)]
pub(crate) struct EarlyCandidateBuffer {
    calls: DashMap<CallId, EarlyCandidates>,
}

impl EarlyCandidateBuffer {
    fn park(&self, call_id: CallId, candidate: IceCandidateInit) {
        self.prune();
        if !self.calls.contains_key(&call_id) && self.calls.len() >= MAX_EARLY_CALLS {
            debug!(target: "Call/Signaling", "Too many unknown calls, dropping candidate for {call_id}");
            return;
        }
        let mut entry = self.calls.entry(call_id.clone()).or_insert_with(|| EarlyCandidates {
            first_seen: Instant::now(),
            candidates: Vec::new(),
        });
        if entry.candidates.len() >= MAX_EARLY_CANDIDATES {
            debug!(target: "Call/Signaling", "Candidate buffer for {call_id} is full");
            return;
        }
        entry.candidates.push(candidate);
    }

    /// Removes and returns what is parked for `call_id`, oldest first.
    fn take(&self, call_id: &CallId) -> Vec<IceCandidateInit> {
        match self.calls.remove(call_id) {
            Some((_, early)) if early.first_seen.elapsed() <= EARLY_CANDIDATE_TTL => {
                early.candidates
            }
            _ => Vec::new(),
        }
    }

    fn discard(&self, call_id: &CallId) {
        self.calls.remove(call_id);
    }

    fn prune(&self) {
        self.calls
            .retain(|_, early| early.first_seen.elapsed() <= EARLY_CANDIDATE_TTL);
    }

    fn clear(&self) {
        self.calls.clear();
    }

    pub(crate) fn parked(&self, call_id: &CallId) -> usize {
        self.calls.get(call_id).map_or(0, |e| e.candidates.len())
    }
}

/// A first offer for a call id nobody is handling yet.
#[derive(Debug)]
pub(crate) struct InboundOffer {
    pub call_id: CallId,
    pub caller: UserId,
    pub kind: CallKind,
    pub mailbox: mpsc::UnboundedSender<SessionEvent>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub struct SignalingHub {
    local_user: UserId,
    pubsub: Arc<dyn PubSub>,
    routes: Arc<Routes>,
    early: Arc<EarlyCandidateBuffer>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
}

impl SignalingHub {
    /// Subscribes to the local user's inbox. New offers are handed to
    /// `offers_tx`; everything else is routed to open calls.
    pub(crate) async fn start(
        local_user: UserId,
        pubsub: Arc<dyn PubSub>,
        offers_tx: mpsc::UnboundedSender<InboundOffer>,
    ) -> Result<Arc<Self>, CallError> {
        let routes: Arc<Routes> = Arc::new(DashMap::new());
        let early = Arc::new(EarlyCandidateBuffer::default());
        let handler = {
            let routes = routes.clone();
            let early = early.clone();
            let local_user = local_user.clone();
            Arc::new(move |payload: &str| {
                route_payload(&routes, &early, &local_user, &offers_tx, payload);
            }) as MessageHandler
        };

        let channel = inbox_channel(&local_user);
        let subscription = pubsub
            .subscribe(&channel, handler)
            .await
            .map_err(|e| CallError::SignalingUnavailable(e.to_string()))?;
        debug!(target: "Call/Signaling", "Subscribed to {channel}");

        Ok(Arc::new(Self {
            local_user,
            pubsub,
            routes,
            early,
            subscription: Mutex::new(Some(subscription)),
        }))
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Opens the per-call channel. Registering the same call id again keeps
    /// the mailbox that is already routed.
    pub(crate) fn open(
        &self,
        call_id: CallId,
        peer: UserId,
        mailbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> SignalingChannel {
        self.routes.entry(call_id.clone()).or_insert(mailbox);
        SignalingChannel {
            pubsub: self.pubsub.clone(),
            routes: self.routes.clone(),
            call_id,
            local_user: self.local_user.clone(),
            peer,
            closed: AtomicBool::new(false),
        }
    }

    /// Tells a caller we cannot take their call and forgets the call id.
    pub(crate) async fn reply_busy(&self, call_id: &CallId, caller: &UserId) {
        let envelope = SignalEnvelope::new(
            call_id.clone(),
            self.local_user.clone(),
            SignalMessage::End(EndCode::Busy),
        );
        self.routes.remove(call_id);
        self.early.discard(call_id);
        if let Err(e) = self
            .pubsub
            .publish(&inbox_channel(caller), envelope.encode())
            .await
        {
            warn!(target: "Call/Signaling", "Failed to send busy to {caller} for call {call_id}: {e}");
        }
    }

    pub fn open_calls(&self) -> usize {
        self.routes.len()
    }

    pub(crate) fn early_candidates(&self) -> &EarlyCandidateBuffer {
        &self.early
    }

    /// Unsubscribes from the inbox and drops all routes.
    pub fn close(&self) {
        let subscription = match self.subscription.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            debug!(target: "Call/Signaling", "Unsubscribed from {}", inbox_channel(&self.local_user));
        }
        self.routes.clear();
        self.early.clear();
    }
}

impl Drop for SignalingHub {
    fn drop(&mut self) {
        self.close();
    }
}

fn route_payload(
    routes: &Routes,
    early: &EarlyCandidateBuffer,
    local_user: &UserId,
    offers_tx: &mpsc::UnboundedSender<InboundOffer>,
    payload: &str,
) {
    let envelope = match SignalEnvelope::decode(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!(target: "Call/Signaling", "Dropping undecodable signaling message: {e}");
            return;
        }
    };
    if &envelope.sender_id == local_user {
        return;
    }

    let SignalEnvelope {
        call_id,
        sender_id,
        message,
    } = envelope;

    // Clone the sender out so no map guard is held across removal.
    let route = routes.get(&call_id).map(|r| r.clone());
    if let Some(route) = route {
        if route.send(SessionEvent::Remote(message)).is_err() {
            debug!(target: "Call/Signaling", "Session for call {call_id} is gone, dropping route");
            routes.remove(&call_id);
        }
        return;
    }

    match message {
        SignalMessage::Offer { sdp, kind } => {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(SessionEvent::Remote(SignalMessage::Offer { sdp, kind }));
            let parked = early.take(&call_id);
            if !parked.is_empty() {
                debug!(
                    target: "Call/Signaling",
                    "Replaying {} early candidate(s) for call {call_id}",
                    parked.len()
                );
            }
            for candidate in parked {
                let _ = tx.send(SessionEvent::Remote(SignalMessage::IceCandidate(candidate)));
            }
            routes.insert(call_id.clone(), tx.clone());
            let offer = InboundOffer {
                call_id: call_id.clone(),
                caller: sender_id,
                kind,
                mailbox: tx,
                events: rx,
            };
            if offers_tx.send(offer).is_err() {
                warn!(target: "Call/Signaling", "Registry stopped, ignoring offer for call {call_id}");
                routes.remove(&call_id);
            }
        }
        SignalMessage::IceCandidate(candidate) => {
            debug!(
                target: "Call/Signaling",
                "Parking candidate for unknown call {call_id} from {sender_id}"
            );
            early.park(call_id, candidate);
        }
        other => {
            debug!(
                target: "Call/Signaling",
                "Dropping {} for unknown call {call_id} from {sender_id}",
                other.signal_type()
            );
        }
    }
}

/// Per-call signaling view, scoped to one call id and the local user.
pub struct SignalingChannel {
    pubsub: Arc<dyn PubSub>,
    routes: Arc<Routes>,
    call_id: CallId,
    local_user: UserId,
    peer: UserId,
    closed: AtomicBool,
}

impl SignalingChannel {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    /// Publishes `message` to `to`'s inbox.
    pub async fn send_to(&self, to: &UserId, message: SignalMessage) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::SignalingUnavailable("channel closed".into()));
        }
        let envelope = SignalEnvelope::new(self.call_id.clone(), self.local_user.clone(), message);
        self.pubsub
            .publish(&inbox_channel(to), envelope.encode())
            .await
            .map_err(|e| CallError::SignalingUnavailable(e.to_string()))
    }

    pub async fn send(&self, message: SignalMessage) -> Result<(), CallError> {
        let peer = self.peer.clone();
        self.send_to(&peer, message).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops routing this call's messages. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.routes.remove(&self.call_id);
            debug!(target: "Call/Signaling", "Closed signaling for call {}", self.call_id);
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}
