//! Media capabilities used by a call session.
//!
//! - [`adapter`]: the peer-to-peer negotiation primitive (offer/answer,
//!   candidates, remote tracks).
//! - [`local`]: local capture devices and their tracks.

pub mod adapter;
pub mod local;

pub use adapter::{
    MediaEvent, MediaEventSink, MediaNegotiator, MediaSessionAdapter, PeerSession, StreamHandle,
};
pub use local::{DeviceError, LocalMediaManager, MediaDevices, TrackHandle, TrackKind, TrackSet};
