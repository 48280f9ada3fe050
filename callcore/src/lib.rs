//! Runtime-agnostic building blocks for two-party call signaling.
//!
//! Nothing in here performs I/O. The tokio-based session and registry live in
//! the `farmcall` crate and are built on these types.

pub mod error;
pub mod record;
pub mod signal;
pub mod state;
pub mod types;

pub use error::{CallError, SignalDecodeError};
pub use record::{CallRecord, CallRecordStatus};
pub use signal::{EndCode, IceCandidateInit, SignalEnvelope, SignalMessage, SignalType};
pub use state::{CallFailure, CallState, CallTransition, EndReason, InvalidTransition};
pub use types::{CallId, CallIdentity, CallKind, CallRole, UserId};
