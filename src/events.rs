use callcore::{CallId, CallIdentity, CallState, EndReason};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::media::StreamHandle;

/// An offer was received and is waiting for the local user.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub identity: CallIdentity,
}

#[derive(Debug, Clone)]
pub struct StateChanged {
    pub call_id: CallId,
    pub state: CallState,
}

/// Remote media became available; hand the stream to the renderer.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub call_id: CallId,
    pub stream: StreamHandle,
}

/// Emitted exactly once per session, when it reaches `Ended` or `Failed`.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: EndReason,
    pub duration_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DurationTick {
    pub call_id: CallId,
    pub secs: u64,
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per UI-facing event.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new(capacity: usize) -> Self {
                Self {
                    $(
                        $field: broadcast::channel(capacity).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (incoming_call, Arc<IncomingCall>),
    (state_changed, Arc<StateChanged>),
    (remote_stream, Arc<RemoteStream>),
    (call_ended, Arc<CallEnded>),
    (duration, Arc<DurationTick>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl EventBus {
    // Sending fails only when nobody is subscribed, which is fine for a UI bus.
    pub(crate) fn emit_incoming(&self, identity: CallIdentity) {
        let _ = self.incoming_call.send(Arc::new(IncomingCall { identity }));
    }

    pub(crate) fn emit_state(&self, call_id: &CallId, state: CallState) {
        let _ = self.state_changed.send(Arc::new(StateChanged {
            call_id: call_id.clone(),
            state,
        }));
    }

    pub(crate) fn emit_remote_stream(&self, call_id: &CallId, stream: StreamHandle) {
        let _ = self.remote_stream.send(Arc::new(RemoteStream {
            call_id: call_id.clone(),
            stream,
        }));
    }

    pub(crate) fn emit_ended(&self, call_id: &CallId, reason: EndReason, duration_secs: Option<u64>) {
        let _ = self.call_ended.send(Arc::new(CallEnded {
            call_id: call_id.clone(),
            reason,
            duration_secs,
        }));
    }

    pub(crate) fn emit_duration(&self, call_id: &CallId, secs: u64) {
        let _ = self.duration.send(Arc::new(DurationTick {
            call_id: call_id.clone(),
            secs,
        }));
    }
}
