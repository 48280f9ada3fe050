// Shared call types live in `callcore`; everything async lives here.
pub use callcore::{
    CallError, CallFailure, CallId, CallIdentity, CallKind, CallRecord, CallRecordStatus,
    CallRole, CallState, CallTransition, EndCode, EndReason, IceCandidateInit, SignalEnvelope,
    SignalMessage, SignalType, UserId,
};

pub mod config;
pub mod events;
pub mod media;
pub mod memory;
pub mod records;
pub mod registry;
pub mod session;
pub mod signaling;

pub use config::CallConfig;
pub use events::EventBus;
pub use registry::{CallDependencies, CallSessionRegistry, RegistryStatus};

#[cfg(test)]
pub mod test_utils;
