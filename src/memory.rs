//! In-process stand-ins for the external collaborators: a pub/sub bus, a
//! loopback peer connection and simulated capture devices.
//!
//! They back the `call_demo` binary and the test suites.

use async_trait::async_trait;
use callcore::{CallKind, IceCandidateInit};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::media::{
    DeviceError, MediaDevices, MediaEventSink, MediaNegotiator, PeerSession, StreamHandle,
    TrackHandle, TrackKind, TrackSet,
};
use crate::signaling::{MessageHandler, PubSub, Subscription};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- pub/sub ---

#[derive(Default)]
struct PubSubInner {
    subscribers: Mutex<HashMap<String, Vec<(u64, MessageHandler)>>>,
    published: Mutex<HashMap<String, Vec<String>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

impl PubSubInner {
    fn deliver(&self, channel: &str, payload: &str) {
        // Snapshot so handlers run without the lock held.
        let handlers: Vec<MessageHandler> = lock(&self.subscribers)
            .get(channel)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(payload);
        }
    }
}

/// Synchronous fan-out bus. Each publish is delivered to every subscriber of
/// the channel, in subscription order, before `publish` returns.
#[derive(Default, Clone)]
pub struct InMemoryPubSub {
    inner: Arc<PubSubInner>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a raw payload without recording it, as if it came from
    /// elsewhere on the network.
    pub fn deliver(&self, channel: &str, payload: &str) {
        self.inner.deliver(channel, payload);
    }

    /// Everything published on `channel` so far.
    pub fn published(&self, channel: &str) -> Vec<String> {
        lock(&self.inner.published)
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.inner.subscribers)
            .get(channel)
            .map_or(0, |subs| subs.len())
    }

    /// While offline, every publish fails.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }
}

struct MemorySubscription {
    inner: Weak<PubSubInner>,
    channel: String,
    id: u64,
}

impl Subscription for MemorySubscription {
    fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(subs) = lock(&inner.subscribers).get_mut(&self.channel) {
                subs.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), anyhow::Error> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("pub/sub offline"));
        }
        lock(&self.inner.published)
            .entry(channel.to_string())
            .or_default()
            .push(payload.clone());
        self.inner.deliver(channel, &payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, anyhow::Error> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("pub/sub offline"));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers)
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        Ok(Box::new(MemorySubscription {
            inner: Arc::downgrade(&self.inner),
            channel: channel.to_string(),
            id,
        }))
    }
}

// --- capture devices ---

/// Capture devices with a spy on every call.
#[derive(Default)]
pub struct SimulatedDevices {
    delay: Option<Duration>,
    failure: Option<DeviceError>,
    camera_denied: bool,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    next_track: AtomicU64,
    enabled: Mutex<HashMap<String, bool>>,
    released_tracks: Mutex<Vec<String>>,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every acquisition wait, like a permission prompt.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every acquisition fail with `error`.
    pub fn failing(mut self, error: DeviceError) -> Self {
        self.failure = Some(error);
        self
    }

    /// Video acquisitions fail with `PermissionDenied`; voice still works.
    pub fn deny_camera(mut self) -> Self {
        self.camera_denied = true;
        self
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn released_tracks(&self) -> Vec<String> {
        lock(&self.released_tracks).clone()
    }

    pub fn is_enabled(&self, track_id: &str) -> Option<bool> {
        lock(&self.enabled).get(track_id).copied()
    }

    fn track(&self, kind: TrackKind) -> TrackHandle {
        let n = self.next_track.fetch_add(1, Ordering::Relaxed);
        let prefix = match kind {
            TrackKind::Audio => "mic",
            TrackKind::Video => "cam",
        };
        let handle = TrackHandle {
            id: format!("{prefix}-{n}"),
            kind,
        };
        lock(&self.enabled).insert(handle.id.clone(), true);
        handle
    }
}

#[async_trait]
impl MediaDevices for SimulatedDevices {
    async fn acquire(&self, kind: CallKind) -> Result<TrackSet, DeviceError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if kind.has_video() && self.camera_denied {
            return Err(DeviceError::PermissionDenied);
        }
        Ok(TrackSet {
            audio: self.track(TrackKind::Audio),
            video: kind.has_video().then(|| self.track(TrackKind::Video)),
        })
    }

    fn set_enabled(&self, track: &TrackHandle, enabled: bool) {
        lock(&self.enabled).insert(track.id.clone(), enabled);
    }

    fn release(&self, tracks: &TrackSet) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        let mut released = lock(&self.released_tracks);
        for track in tracks.tracks() {
            released.push(track.id.clone());
        }
    }
}

// --- peer connection ---

#[derive(Default)]
#[derive(Clone, Copy)]
struct LoopbackOptions {
    remote_track: bool,
    candidates: usize,
    refuse_sessions: bool,
}

/// Peer connections that "connect" as soon as both descriptions are known.
///
/// Every operation on every session it creates is appended to a shared
/// journal, e.g. `offer`, `answer`, `remote_answer`, `candidate:<line>`,
/// `attach:audio`, `close`.
#[derive(Clone)]
pub struct LoopbackNegotiator {
    options: Arc<LoopbackOptions>,
    journal: Arc<Mutex<Vec<String>>>,
    sessions: Arc<AtomicU64>,
}

impl Default for LoopbackNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNegotiator {
    pub fn new() -> Self {
        Self {
            options: Arc::new(LoopbackOptions {
                remote_track: true,
                candidates: 2,
                refuse_sessions: false,
            }),
            journal: Arc::new(Mutex::new(Vec::new())),
            sessions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Never delivers remote media, so calls stall in `Negotiating`.
    pub fn without_remote_track(self) -> Self {
        Self {
            options: Arc::new(LoopbackOptions {
                remote_track: false,
                ..*self.options
            }),
            ..self
        }
    }

    /// Number of local candidates each session gathers.
    pub fn with_candidates(self, candidates: usize) -> Self {
        Self {
            options: Arc::new(LoopbackOptions {
                candidates,
                ..*self.options
            }),
            ..self
        }
    }

    /// Fails every `create_session`, like a platform without peer
    /// connection support.
    pub fn refusing_sessions(self) -> Self {
        Self {
            options: Arc::new(LoopbackOptions {
                refuse_sessions: true,
                ..*self.options
            }),
            ..self
        }
    }

    pub fn journal(&self) -> Vec<String> {
        lock(&self.journal).clone()
    }
}

impl MediaNegotiator for LoopbackNegotiator {
    fn create_session(&self, events: MediaEventSink) -> Result<Box<dyn PeerSession>, anyhow::Error> {
        if self.options.refuse_sessions {
            return Err(anyhow::anyhow!("peer connections are not supported"));
        }
        let n = self.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(LoopbackPeer {
            id: n,
            events,
            remote_track: self.options.remote_track,
            candidates: self.options.candidates,
            journal: self.journal.clone(),
            has_video: false,
        }))
    }
}

struct LoopbackPeer {
    id: u64,
    events: MediaEventSink,
    remote_track: bool,
    candidates: usize,
    journal: Arc<Mutex<Vec<String>>>,
    has_video: bool,
}

impl LoopbackPeer {
    fn note(&self, entry: impl Into<String>) {
        lock(&self.journal).push(entry.into());
    }

    fn describe(&self) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n",
            self.id
        );
        if self.has_video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        }
        sdp
    }

    fn gather(&self) {
        for i in 0..self.candidates {
            let candidate = IceCandidateInit::new(format!(
                "candidate:{i} 1 UDP 2130706431 127.0.0.1 {} typ host",
                40000 + self.id * 10 + i as u64
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);
            self.events.local_candidate(candidate);
        }
    }

    fn connect(&self) {
        if self.remote_track {
            self.events
                .remote_track(StreamHandle::new(format!("loopback-stream-{}", self.id)));
        }
    }

    fn validate(sdp: &str) -> Result<(), anyhow::Error> {
        if sdp.starts_with("v=0") {
            Ok(())
        } else {
            Err(anyhow::anyhow!("malformed session description"))
        }
    }
}

#[async_trait]
impl PeerSession for LoopbackPeer {
    async fn create_offer(&mut self) -> Result<String, anyhow::Error> {
        self.note("offer");
        let sdp = self.describe();
        self.gather();
        Ok(sdp)
    }

    async fn create_answer(&mut self, remote_offer: &str) -> Result<String, anyhow::Error> {
        Self::validate(remote_offer)?;
        self.note("answer");
        let sdp = self.describe();
        self.gather();
        self.connect();
        Ok(sdp)
    }

    async fn set_remote_answer(&mut self, answer: &str) -> Result<(), anyhow::Error> {
        Self::validate(answer)?;
        self.note("remote_answer");
        self.connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidateInit) -> Result<(), anyhow::Error> {
        self.note(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn attach_local_track(&mut self, track: &TrackHandle) -> Result<(), anyhow::Error> {
        match track.kind {
            TrackKind::Audio => self.note("attach:audio"),
            TrackKind::Video => {
                self.has_video = true;
                self.note("attach:video");
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        debug!("loopback peer {} closed", self.id);
        self.note("close");
    }
}
