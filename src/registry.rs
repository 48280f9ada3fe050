//! The per-user call registry.
//!
//! Owns the one session slot a user has, the inbox subscription and the event
//! bus the UI listens on. It is the only place sessions are created, and a
//! session only leaves the slot once it has published a terminal state.

use callcore::{CallError, CallId, CallIdentity, CallKind, CallRole, CallState, UserId};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::CallConfig;
use crate::events::EventBus;
use crate::media::{MediaDevices, MediaNegotiator};
use crate::records::CallRecordSink;
use crate::session::{CallSession, LocalIntent, SessionDeps, SessionEvent};
use crate::signaling::{InboundOffer, PubSub, SignalingHub};

/// External collaborators a registry is wired to.
#[derive(Clone)]
pub struct CallDependencies {
    pub pubsub: Arc<dyn PubSub>,
    pub negotiator: Arc<dyn MediaNegotiator>,
    pub devices: Arc<dyn MediaDevices>,
    pub records: Arc<dyn CallRecordSink>,
}

/// What the UI should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryStatus {
    Idle,
    /// An offer is waiting for accept or reject.
    Incoming(CallIdentity),
    InCall(CallIdentity),
}

struct Slot {
    identity: CallIdentity,
    role: CallRole,
    mailbox: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<CallState>,
}

impl Slot {
    fn current(&self) -> CallState {
        *self.state.borrow()
    }

    fn is_live(&self) -> bool {
        !self.current().is_terminal() && !self.mailbox.is_closed()
    }
}

type SharedSlot = Arc<Mutex<Option<Slot>>>;

/// Drops the slot's session once it is terminal.
fn vacate_finished(slot: &mut Option<Slot>) {
    if slot.as_ref().is_some_and(|s| !s.is_live()) {
        if let Some(done) = slot.take() {
            debug!(
                target: "Call/Registry",
                "Releasing slot of call {} ({})",
                done.identity.call_id,
                done.current()
            );
        }
    }
}

pub struct CallSessionRegistry {
    local_user: UserId,
    hub: Arc<SignalingHub>,
    deps: SessionDeps,
    slot: SharedSlot,
    router: std::sync::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl CallSessionRegistry {
    /// Subscribes to `local_user`'s inbox and starts accepting calls.
    pub async fn start(
        local_user: UserId,
        config: CallConfig,
        deps: CallDependencies,
    ) -> Result<Arc<Self>, CallError> {
        let (offers_tx, offers_rx) = mpsc::unbounded_channel();
        let hub = SignalingHub::start(local_user.clone(), deps.pubsub, offers_tx).await?;
        let session_deps = SessionDeps {
            events: Arc::new(EventBus::new(config.event_capacity)),
            config,
            negotiator: deps.negotiator,
            devices: deps.devices,
            records: deps.records,
        };
        let registry = Arc::new(Self {
            local_user,
            hub,
            deps: session_deps,
            slot: Arc::new(Mutex::new(None)),
            router: std::sync::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let router = tokio::spawn(route_offers(
            offers_rx,
            registry.hub.clone(),
            registry.slot.clone(),
            registry.deps.clone(),
        ));
        if let Ok(mut guard) = registry.router.lock() {
            *guard = Some(router);
        }
        info!(target: "Call/Registry", "Call registry started for {}", registry.local_user);
        Ok(registry)
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn events(&self) -> &EventBus {
        &self.deps.events
    }

    pub fn config(&self) -> &CallConfig {
        &self.deps.config
    }

    /// Starts an outgoing call. Fails with `Busy` while another session is
    /// live; in that case no session is created.
    pub async fn initiate(&self, callee: UserId, kind: CallKind) -> Result<CallIdentity, CallError> {
        self.ensure_running()?;
        if callee == self.local_user {
            return Err(CallError::InvalidTarget);
        }

        let mut slot = self.slot.lock().await;
        vacate_finished(&mut slot);
        if let Some(active) = slot.as_ref() {
            info!(
                target: "Call/Registry",
                "Refusing call to {callee}: call {} is {}",
                active.identity.call_id,
                active.current()
            );
            return Err(CallError::Busy);
        }

        let identity = CallIdentity::new_outgoing(self.local_user.clone(), callee.clone(), kind);
        let (tx, rx) = mpsc::unbounded_channel();
        let signaling = self.hub.open(identity.call_id.clone(), callee, tx.clone());
        let (session, state) = CallSession::new(
            identity.clone(),
            CallRole::Caller,
            signaling,
            self.deps.clone(),
            tx.clone(),
        );
        tokio::spawn(session.run(rx));
        *slot = Some(Slot {
            identity: identity.clone(),
            role: CallRole::Caller,
            mailbox: tx,
            state,
        });
        Ok(identity)
    }

    pub async fn accept(&self, call_id: &CallId) -> Result<(), CallError> {
        self.dispatch(call_id, LocalIntent::Accept).await
    }

    pub async fn reject(&self, call_id: &CallId) -> Result<(), CallError> {
        self.dispatch(call_id, LocalIntent::Reject).await
    }

    /// Ends the call. On a pending incoming call this is a reject.
    pub async fn hang_up(&self, call_id: &CallId) -> Result<(), CallError> {
        self.dispatch(call_id, LocalIntent::HangUp).await
    }

    pub async fn set_muted(&self, call_id: &CallId, muted: bool) -> Result<(), CallError> {
        self.dispatch(call_id, LocalIntent::SetMuted(muted)).await
    }

    pub async fn set_video_enabled(&self, call_id: &CallId, enabled: bool) -> Result<(), CallError> {
        self.dispatch(call_id, LocalIntent::SetVideoEnabled(enabled))
            .await
    }

    /// Current state of `call_id`, if it is the call in the slot.
    pub async fn state(&self, call_id: &CallId) -> Option<CallState> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .filter(|s| &s.identity.call_id == call_id)
            .map(Slot::current)
    }

    /// Watch on the state of `call_id`, if it is the call in the slot.
    pub async fn watch_state(&self, call_id: &CallId) -> Option<watch::Receiver<CallState>> {
        let slot = self.slot.lock().await;
        slot.as_ref()
            .filter(|s| &s.identity.call_id == call_id)
            .map(|s| s.state.clone())
    }

    pub async fn status(&self) -> RegistryStatus {
        let mut slot = self.slot.lock().await;
        vacate_finished(&mut slot);
        match slot.as_ref() {
            None => RegistryStatus::Idle,
            Some(s) if s.role == CallRole::Callee && s.current().is_incoming() => {
                RegistryStatus::Incoming(s.identity.clone())
            }
            // A callee session that has not processed its offer yet is not
            // shown to the user.
            Some(s) if s.role == CallRole::Callee && s.current() == CallState::Idle => {
                RegistryStatus::Idle
            }
            Some(s) => RegistryStatus::InCall(s.identity.clone()),
        }
    }

    /// Hangs up the live call, if any, and stops listening for new ones.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut guard) = self.router.lock() {
            if let Some(router) = guard.take() {
                router.abort();
            }
        }
        let live = {
            let mut slot = self.slot.lock().await;
            vacate_finished(&mut slot);
            slot.as_ref().map(|s| s.identity.call_id.clone())
        };
        if let Some(call_id) = live {
            if let Err(e) = self.hang_up(&call_id).await {
                warn!(target: "Call/Registry", "Hang-up of {call_id} during shutdown failed: {e}");
            }
        }
        self.hub.close();
        info!(target: "Call/Registry", "Call registry for {} shut down", self.local_user);
    }

    fn ensure_running(&self) -> Result<(), CallError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(CallError::SignalingUnavailable("registry shut down".into()));
        }
        Ok(())
    }

    async fn dispatch(&self, call_id: &CallId, intent: LocalIntent) -> Result<(), CallError> {
        let mailbox = {
            let slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(s) if &s.identity.call_id == call_id => s.mailbox.clone(),
                _ => return Err(CallError::NoSuchCall(call_id.clone())),
            }
        };
        // The actor only stops after reaching a terminal state, so hanging up
        // a stopped session already has the requested outcome.
        let stopped = || match intent {
            LocalIntent::HangUp => Ok(()),
            _ => Err(CallError::NoSuchCall(call_id.clone())),
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if mailbox
            .send(SessionEvent::Local(intent, Some(reply_tx)))
            .is_err()
        {
            return stopped();
        }
        reply_rx.await.unwrap_or_else(|_| stopped())
    }
}

impl Drop for CallSessionRegistry {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.router.lock() {
            if let Some(router) = guard.take() {
                router.abort();
            }
        }
    }
}

/// Turns first offers into callee sessions, or answers `busy` when the slot
/// is taken.
async fn route_offers(
    mut offers: mpsc::UnboundedReceiver<InboundOffer>,
    hub: Arc<SignalingHub>,
    slot: SharedSlot,
    deps: SessionDeps,
) {
    while let Some(offer) = offers.recv().await {
        let mut guard = slot.lock().await;
        vacate_finished(&mut guard);
        if let Some(active) = guard.as_ref() {
            info!(
                target: "Call/Registry",
                "Busy with call {}, declining call {} from {}",
                active.identity.call_id, offer.call_id, offer.caller
            );
            drop(guard);
            hub.reply_busy(&offer.call_id, &offer.caller).await;
            continue;
        }

        let InboundOffer {
            call_id,
            caller,
            kind,
            mailbox,
            events,
        } = offer;
        let identity = CallIdentity::new_incoming(call_id, caller.clone(), hub.local_user().clone(), kind);
        let signaling = hub.open(identity.call_id.clone(), caller, mailbox.clone());
        let (session, state) = CallSession::new(
            identity.clone(),
            CallRole::Callee,
            signaling,
            deps.clone(),
            mailbox.clone(),
        );
        tokio::spawn(session.run(events));
        *guard = Some(Slot {
            identity,
            role: CallRole::Callee,
            mailbox,
            state,
        });
    }
    debug!(target: "Call/Registry", "Offer router stopped");
}
