//! Local capture devices.

use async_trait::async_trait;
use callcore::{CallError, CallKind};
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A live capture track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackHandle {
    pub id: String,
    pub kind: TrackKind,
}

/// Tracks acquired together for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSet {
    pub audio: TrackHandle,
    pub video: Option<TrackHandle>,
}

impl TrackSet {
    pub fn tracks(&self) -> impl Iterator<Item = &TrackHandle> {
        std::iter::once(&self.audio).chain(self.video.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

impl From<DeviceError> for CallError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied => CallError::PermissionDenied,
            DeviceError::Unavailable(msg) => CallError::DeviceUnavailable(msg),
        }
    }
}

/// The platform's capture capability.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Opens the microphone, plus the camera for video calls. May wait on a
    /// permission prompt for as long as the user takes.
    async fn acquire(&self, kind: CallKind) -> Result<TrackSet, DeviceError>;

    /// Mutes/unmutes or turns the camera off/on without re-acquiring.
    fn set_enabled(&self, track: &TrackHandle, enabled: bool);

    /// Stops every track in the set.
    fn release(&self, tracks: &TrackSet);
}

/// Owns the local tracks of one session and guarantees they are released
/// exactly once, including when acquisition finishes after teardown.
pub struct LocalMediaManager {
    devices: Arc<dyn MediaDevices>,
    held: Option<TrackSet>,
    pending: bool,
    released: bool,
    audio_enabled: bool,
    video_enabled: bool,
}

impl LocalMediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            held: None,
            pending: false,
            released: false,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Starts acquisition in the background. The outcome arrives in the
    /// session mailbox as [`SessionEvent::MediaAcquired`].
    pub(crate) fn begin_acquire(&mut self, kind: CallKind, mailbox: mpsc::UnboundedSender<SessionEvent>) {
        if self.pending || self.held.is_some() || self.released {
            warn!(target: "Call/Media", "Ignoring duplicate acquire request");
            return;
        }
        self.pending = true;
        let devices = self.devices.clone();
        tokio::spawn(async move {
            let result = devices.acquire(kind).await.map_err(CallError::from);
            if let Err(mpsc::error::SendError(event)) = mailbox.send(SessionEvent::MediaAcquired(result)) {
                // Nobody left to own the tracks.
                if let SessionEvent::MediaAcquired(Ok(tracks)) = event {
                    devices.release(&tracks);
                }
            }
        });
    }

    /// Takes ownership of an acquisition result.
    ///
    /// Returns the tracks only if the session should use them. If the session
    /// was already torn down, the tracks are released right away.
    pub fn on_acquired(
        &mut self,
        result: Result<TrackSet, CallError>,
    ) -> Result<Option<TrackSet>, CallError> {
        self.pending = false;
        let tracks = result?;
        if self.released {
            info!(target: "Call/Media", "Acquisition finished after teardown, releasing");
            self.devices.release(&tracks);
            return Ok(None);
        }
        self.held = Some(tracks.clone());
        Ok(Some(tracks))
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn tracks(&self) -> Option<&TrackSet> {
        self.held.as_ref()
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Returns `false` when there is no live audio track to act on.
    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        let Some(tracks) = self.held.as_ref() else {
            return false;
        };
        self.devices.set_enabled(&tracks.audio, enabled);
        self.audio_enabled = enabled;
        true
    }

    /// Returns `false` when there is no live camera track to act on.
    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        let Some(video) = self.held.as_ref().and_then(|t| t.video.as_ref()) else {
            return false;
        };
        self.devices.set_enabled(video, enabled);
        self.video_enabled = enabled;
        true
    }

    /// Releases held tracks. Safe to call repeatedly; tracks still being
    /// acquired are released when they arrive.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(tracks) = self.held.take() {
            debug!(target: "Call/Media", "Releasing {} local track(s)", tracks.tracks().count());
            self.devices.release(&tracks);
        } else if self.pending {
            debug!(target: "Call/Media", "Release requested while acquisition pending, deferring");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}
