//! Local capture resources: acquisition, release and track toggling.

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::calls::CallError;

/// What to capture. Fixed to audio+video for calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single capture track. `enabled` mutes without stopping; `stop` ends it.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct CaptureInner {
    id: String,
    tracks: Vec<MediaTrack>,
    stopped: AtomicBool,
}

/// A set of capture tracks, local or remote. Clones share the same tracks.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    inner: Arc<CaptureInner>,
}

impl CaptureHandle {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                id: id.into(),
                tracks,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.inner.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks_of(TrackKind::Video)
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &MediaTrack> {
        self.inner.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// Stop every track. Returns `true` only for the call that actually
    /// stopped them.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        for track in &self.inner.tracks {
            track.stop();
        }
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn same_as(&self, other: &CaptureHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Platform capture backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open capture for the given constraints. Denied or missing devices fail
    /// with [`CallError::MediaUnavailable`].
    async fn get_user_media(&self, constraints: MediaConstraints)
    -> Result<CaptureHandle, CallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaStats {
    pub acquisitions: usize,
    pub releases: usize,
}

impl MediaStats {
    /// Handles acquired and not yet released.
    pub fn held(&self) -> usize {
        self.acquisitions - self.releases
    }
}

/// Acquires and releases local capture on behalf of the call worker.
pub struct MediaGuard {
    devices: Arc<dyn MediaDevices>,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
}

impl MediaGuard {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            acquisitions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<CaptureHandle, CallError> {
        match self.devices.get_user_media(constraints).await {
            Ok(handle) => {
                self.acquisitions.fetch_add(1, Ordering::SeqCst);
                debug!(target: "Call/Media", "Acquired capture {}", handle.id());
                Ok(handle)
            }
            Err(e) => {
                warn!(target: "Call/Media", "Could not access camera/microphone: {e}");
                Err(match e {
                    CallError::MediaUnavailable(_) => e,
                    other => CallError::MediaUnavailable(other.to_string()),
                })
            }
        }
    }

    /// Stop all tracks of `handle`. Absent or already released handles are a
    /// no-op.
    pub fn release(&self, handle: Option<&CaptureHandle>) {
        if let Some(handle) = handle
            && handle.stop()
        {
            self.releases.fetch_add(1, Ordering::SeqCst);
            debug!(target: "Call/Media", "Released capture {}", handle.id());
        }
    }

    /// Enable or disable every track of `kind` without stopping it.
    /// Returns the number of tracks touched.
    pub fn set_track_enabled(
        &self,
        handle: &CaptureHandle,
        kind: TrackKind,
        enabled: bool,
    ) -> usize {
        let mut touched = 0;
        for track in handle.tracks_of(kind).filter(|t| t.is_live()) {
            track.set_enabled(enabled);
            touched += 1;
        }
        touched
    }

    pub fn stats(&self) -> MediaStats {
        MediaStats {
            acquisitions: self.acquisitions.load(Ordering::SeqCst),
            releases: self.releases.load(Ordering::SeqCst),
        }
    }
}

/// In-process capture backend producing one audio and one video track.
///
/// It can deny access, delay, or hold every request until [`grant`] is
/// called, which lets callers drive acquisition races deterministically.
///
/// [`grant`]: SyntheticDevices::grant
pub struct SyntheticDevices {
    label: String,
    denied: AtomicBool,
    delay_ms: AtomicU64,
    held: AtomicBool,
    gate: Semaphore,
    requests: AtomicUsize,
    next_id: AtomicU64,
    issued: Mutex<Vec<CaptureHandle>>,
}

impl SyntheticDevices {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            denied: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            requests: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            issued: Mutex::new(Vec::new()),
        })
    }

    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make subsequent requests wait for [`grant`](Self::grant).
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Let `n` held requests complete.
    pub fn grant(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Number of times the device was asked for capture.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Captures handed out whose tracks are still running.
    pub fn live_captures(&self) -> usize {
        self.issued
            .lock()
            .map(|issued| issued.iter().filter(|h| !h.is_stopped()).count())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<CaptureHandle, CallError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self.held.load(Ordering::SeqCst) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| CallError::MediaUnavailable("device gate closed".into()))?;
            permit.forget();
        }

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.denied.load(Ordering::SeqCst) {
            return Err(CallError::MediaUnavailable("permission denied".into()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(MediaTrack::new(
                format!("{}-audio-{n}", self.label),
                TrackKind::Audio,
            ));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(
                format!("{}-video-{n}", self.label),
                TrackKind::Video,
            ));
        }
        let handle = CaptureHandle::new(format!("{}-capture-{n}", self.label), tracks);
        if let Ok(mut issued) = self.issued.lock() {
            issued.push(handle.clone());
        }
        Ok(handle)
    }
}
