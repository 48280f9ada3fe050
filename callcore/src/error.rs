//! Call-related error types.

use thiserror::Error;

use crate::state::{CallState, InvalidTransition};
use crate::types::CallId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("media negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("another call is already in progress")]
    Busy,

    #[error("call was not answered in time")]
    Timeout,

    #[error("call not found: {0}")]
    NoSuchCall(CallId),

    #[error("{action} is not allowed in state {state:?}")]
    InvalidState {
        state: CallState,
        action: &'static str,
    },

    #[error("cannot call yourself")]
    InvalidTarget,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("malformed signaling message: {0}")]
    Decode(#[from] SignalDecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalDecodeError {
    #[error("invalid json: {0}")]
    Json(String),

    #[error("unknown signal type: {0}")]
    UnknownType(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}
