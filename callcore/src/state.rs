//! Call state machine.
//!
//! ```text
//! Idle → Initiating → Ringing ─────────┐
//!   └──→ IncomingPending ──────────────┴→ Negotiating → Connected → Ended
//! (any non-terminal) ──────────────────────────────────────────────→ Failed
//! ```
//!
//! [`CallState::apply`] is pure; side effects belong to the session that
//! drives it.

use serde::Serialize;
use std::fmt;

use crate::error::CallError;
use crate::signal::EndCode;

/// Terminal failure kinds surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallFailure {
    PermissionDenied,
    DeviceUnavailable,
    NegotiationFailed,
    SignalingUnavailable,
    Busy,
    Timeout,
}

impl CallFailure {
    /// Maps an error onto the failure taxonomy. Errors outside the taxonomy
    /// (bookkeeping errors such as `NoSuchCall`) count as negotiation failures.
    pub fn from_error(err: &CallError) -> Self {
        match err {
            CallError::PermissionDenied => Self::PermissionDenied,
            CallError::DeviceUnavailable(_) => Self::DeviceUnavailable,
            CallError::SignalingUnavailable(_) => Self::SignalingUnavailable,
            CallError::Busy => Self::Busy,
            CallError::Timeout => Self::Timeout,
            _ => Self::NegotiationFailed,
        }
    }

    /// Code sent to the peer in the best-effort `end` message.
    pub fn end_code(&self) -> EndCode {
        match self {
            Self::Timeout => EndCode::Timeout,
            Self::Busy => EndCode::Busy,
            _ => EndCode::Failed,
        }
    }
}

impl From<&CallError> for CallFailure {
    fn from(err: &CallError) -> Self {
        Self::from_error(err)
    }
}

/// Why a call ended, as reported through `on_ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// We hung up.
    LocalHangUp,
    /// The peer hung up or gave up.
    RemoteHangUp,
    /// We rejected an incoming call.
    Rejected,
    /// The peer rejected our call.
    Declined,
    Failure(CallFailure),
}

/// Current state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing: acquiring local media before the offer goes out.
    Initiating,
    /// Outgoing: offer sent, waiting for an answer.
    Ringing,
    /// Incoming: offer buffered, waiting for the local user.
    IncomingPending,
    /// Descriptions are being exchanged/applied.
    Negotiating,
    /// Remote media is flowing.
    Connected,
    Ended(EndReason),
    Failed(CallFailure),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended(_) | Self::Failed(_))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_incoming(&self) -> bool {
        matches!(self, Self::IncomingPending)
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::IncomingPending)
    }

    pub fn can_hang_up(&self) -> bool {
        matches!(
            self,
            Self::Initiating | Self::Ringing | Self::Negotiating | Self::Connected
        )
    }

    /// Reason reported to the UI once the state is terminal.
    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            Self::Ended(reason) => Some(*reason),
            Self::Failed(failure) => Some(EndReason::Failure(*failure)),
            _ => None,
        }
    }

    /// Computes the next state for `transition`, or rejects it.
    pub fn apply(&self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        use CallState::*;
        use CallTransition as T;

        let next = match (*self, transition) {
            (Idle, T::Initiate) => Initiating,
            (Idle, T::OfferReceived) => IncomingPending,
            (Initiating, T::OfferSent) => Ringing,
            (Ringing, T::AnswerReceived) => Negotiating,
            (IncomingPending, T::Accepted) => Negotiating,
            (Negotiating, T::RemoteTrack) => Connected,
            (IncomingPending, T::Rejected) => Ended(EndReason::Rejected),
            (Initiating | Ringing | Negotiating | Connected, T::HangUp) => {
                Ended(EndReason::LocalHangUp)
            }
            (Ringing, T::RemoteEnded(EndCode::Rejected)) => Ended(EndReason::Declined),
            (Ringing, T::RemoteEnded(EndCode::Busy)) => Failed(CallFailure::Busy),
            (
                Initiating | Ringing | IncomingPending | Negotiating | Connected,
                T::RemoteEnded(_),
            ) => Ended(EndReason::RemoteHangUp),
            (state, T::Fail(failure)) if !state.is_terminal() => Failed(failure),
            (current, attempted) => {
                return Err(InvalidTransition { current, attempted });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Initiating => f.write_str("initiating"),
            Self::Ringing => f.write_str("ringing"),
            Self::IncomingPending => f.write_str("incoming"),
            Self::Negotiating => f.write_str("negotiating"),
            Self::Connected => f.write_str("connected"),
            Self::Ended(reason) => write!(f, "ended ({reason:?})"),
            Self::Failed(failure) => write!(f, "failed ({failure:?})"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    Initiate,
    OfferSent,
    OfferReceived,
    AnswerReceived,
    Accepted,
    Rejected,
    RemoteTrack,
    HangUp,
    RemoteEnded(EndCode),
    Fail(CallFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current: CallState,
    pub attempted: CallTransition,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {:?} in state {}",
            self.attempted, self.current
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(start: CallState, steps: &[CallTransition]) -> Result<CallState, InvalidTransition> {
        steps.iter().try_fold(start, |state, t| state.apply(*t))
    }

    /// Flow: Idle → Initiating → Ringing → Negotiating → Connected → Ended
    #[test]
    fn test_outgoing_call_flow() {
        use CallTransition::*;
        let mut state = CallState::Idle;
        for (t, expected) in [
            (Initiate, CallState::Initiating),
            (OfferSent, CallState::Ringing),
            (AnswerReceived, CallState::Negotiating),
            (RemoteTrack, CallState::Connected),
            (HangUp, CallState::Ended(EndReason::LocalHangUp)),
        ] {
            state = state.apply(t).unwrap();
            assert_eq!(state, expected);
        }
        assert!(state.is_terminal());
    }

    /// Flow: Idle → IncomingPending → Negotiating → Connected → Ended (remote)
    #[test]
    fn test_incoming_call_flow() {
        use CallTransition::*;
        let state = walk(
            CallState::Idle,
            &[OfferReceived, Accepted, RemoteTrack, RemoteEnded(EndCode::Hangup)],
        )
        .unwrap();
        assert_eq!(state, CallState::Ended(EndReason::RemoteHangUp));
    }

    #[test]
    fn test_incoming_reject_and_remote_cancel() {
        use CallTransition::*;
        let pending = CallState::Idle.apply(OfferReceived).unwrap();
        assert!(pending.can_accept());
        assert_eq!(
            pending.apply(Rejected).unwrap(),
            CallState::Ended(EndReason::Rejected)
        );
        assert_eq!(
            pending.apply(RemoteEnded(EndCode::Hangup)).unwrap(),
            CallState::Ended(EndReason::RemoteHangUp)
        );
    }

    #[test]
    fn test_ringing_remote_end_codes() {
        use CallTransition::*;
        let ringing = walk(CallState::Idle, &[Initiate, OfferSent]).unwrap();
        assert_eq!(
            ringing.apply(RemoteEnded(EndCode::Rejected)).unwrap(),
            CallState::Ended(EndReason::Declined)
        );
        assert_eq!(
            ringing.apply(RemoteEnded(EndCode::Busy)).unwrap(),
            CallState::Failed(CallFailure::Busy)
        );
        assert_eq!(
            ringing.apply(RemoteEnded(EndCode::Timeout)).unwrap(),
            CallState::Ended(EndReason::RemoteHangUp)
        );
    }

    #[test]
    fn test_failure_reachable_from_every_non_terminal_state() {
        for state in [
            CallState::Idle,
            CallState::Initiating,
            CallState::Ringing,
            CallState::IncomingPending,
            CallState::Negotiating,
            CallState::Connected,
        ] {
            assert_eq!(
                state.apply(CallTransition::Fail(CallFailure::Timeout)).unwrap(),
                CallState::Failed(CallFailure::Timeout),
                "from {state}"
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        use CallTransition::*;
        for terminal in [
            CallState::Ended(EndReason::LocalHangUp),
            CallState::Failed(CallFailure::NegotiationFailed),
        ] {
            for t in [
                Initiate,
                OfferSent,
                OfferReceived,
                AnswerReceived,
                Accepted,
                Rejected,
                RemoteTrack,
                HangUp,
                RemoteEnded(EndCode::Hangup),
                Fail(CallFailure::Timeout),
            ] {
                assert!(terminal.apply(t).is_err(), "{t:?} accepted in {terminal}");
            }
        }
    }

    #[test]
    fn test_invalid_transitions() {
        use CallTransition::*;
        assert!(CallState::Idle.apply(AnswerReceived).is_err());
        assert!(CallState::Initiating.apply(RemoteTrack).is_err());
        assert!(CallState::Ringing.apply(Accepted).is_err());
        assert!(CallState::IncomingPending.apply(HangUp).is_err());
        let err = CallState::Connected.apply(OfferSent).unwrap_err();
        assert_eq!(err.current, CallState::Connected);
        assert!(err.to_string().contains("OfferSent"));
    }

    #[test]
    fn test_end_reason_and_failure_mapping() {
        assert_eq!(CallState::Connected.end_reason(), None);
        assert_eq!(
            CallState::Failed(CallFailure::Timeout).end_reason(),
            Some(EndReason::Failure(CallFailure::Timeout))
        );
        assert_eq!(
            CallFailure::from_error(&CallError::PermissionDenied),
            CallFailure::PermissionDenied
        );
        assert_eq!(
            CallFailure::from_error(&CallError::DeviceUnavailable("no camera".into())),
            CallFailure::DeviceUnavailable
        );
        assert_eq!(CallFailure::Timeout.end_code(), EndCode::Timeout);
        assert_eq!(CallFailure::PermissionDenied.end_code(), EndCode::Failed);
    }
}
