//! Voice calls: one call slot, one local audio track on one Open peer.
//!
//! ```text
//!  start_call ──► Ringing ──attach ok──► Active ──end_call/peer_closed──► Idle
//!                    │
//!                    └──attach failed──► Failed ──► Idle
//! ```
//!
//! The microphone is an [`AudioSource`]; while a call holds it, a feeder
//! task copies encoded frames into an Opus track every frame period.
//! Releasing the call drops the capture on every path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::identity::PeerKey;

/// Duration of one audio frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Opus frame that decodes to 20 ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Call slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Idle,
    Ringing,
    Active,
    Failed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Call errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,
    #[error("peer is not connected")]
    NotConnected,
    #[error("no audio input device")]
    NoAudioDevice,
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
}

/// Call state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub peer: PeerKey,
    pub state: CallState,
}

/// Snapshot of the current call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: u64,
    pub peer: PeerKey,
    pub state: CallState,
}

/// The part of a peer connection a call needs.
#[async_trait]
pub trait MediaLink: Send + Sync {
    async fn is_open(&self, peer: PeerKey) -> bool;

    /// Add the track and renegotiate; resolves once the remote answered.
    async fn attach_audio(&self, peer: PeerKey, track: Arc<TrackLocalStaticSample>) -> Result<(), CallError>;

    /// Remove the track, best effort.
    async fn detach_audio(&self, peer: PeerKey);
}

/// A microphone that may or may not be available.
pub trait AudioSource: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn AudioCapture>, CallError>;
}

/// An acquired microphone. Dropping it releases the device.
pub trait AudioCapture: Send {
    /// Next encoded frame, `None` when the device went away.
    fn read_frame(&mut self) -> Option<Bytes>;
}

/// Always-available source producing Opus silence.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceSource;

impl AudioSource for SilenceSource {
    fn acquire(&self) -> Result<Box<dyn AudioCapture>, CallError> {
        Ok(Box::new(SilenceCapture))
    }
}

struct SilenceCapture;

impl AudioCapture for SilenceCapture {
    fn read_frame(&mut self) -> Option<Bytes> {
        Some(Bytes::from_static(&OPUS_SILENCE))
    }
}

/// Opus track for the local microphone.
pub fn opus_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        "ryton".to_owned(),
    ))
}

type SharedCapture = Arc<std::sync::Mutex<Option<Box<dyn AudioCapture>>>>;

/// Held capture plus the task feeding it into the track.
struct LocalAudio {
    capture: SharedCapture,
    cancel: CancellationToken,
}

impl LocalAudio {
    fn start(capture: Box<dyn AudioCapture>, track: Arc<TrackLocalStaticSample>) -> Self {
        let capture: SharedCapture = Arc::new(std::sync::Mutex::new(Some(capture)));
        let cancel = CancellationToken::new();

        let feed = capture.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let frame = {
                    let Ok(mut guard) = feed.lock() else { break };
                    match guard.as_mut() {
                        Some(capture) => capture.read_frame(),
                        None => break,
                    }
                };
                let Some(data) = frame else {
                    log::warn!("Audio capture ended");
                    break;
                };
                let sample = Sample {
                    data,
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    log::debug!("Audio sample dropped: {e}");
                }
            }
        });

        Self { capture, cancel }
    }
}

impl Drop for LocalAudio {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut guard) = self.capture.lock() {
            guard.take();
        }
    }
}

struct CallSession {
    id: u64,
    peer: PeerKey,
    state: CallState,
    _audio: LocalAudio,
}

struct CallInner {
    link: Arc<dyn MediaLink>,
    audio: Arc<dyn AudioSource>,
    slot: Mutex<Option<CallSession>>,
    next_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<CallEvent>,
}

impl CallInner {
    fn emit(&self, peer: PeerKey, state: CallState) {
        let _ = self.events_tx.send(CallEvent { peer, state });
    }

    async fn finish_ringing(&self, id: u64, result: Result<(), CallError>) {
        let mut slot = self.slot.lock().await;
        let Some(call) = slot.as_mut().filter(|c| c.id == id && c.state == CallState::Ringing) else {
            // Ended while ringing; end_call already queued the detach.
            return;
        };
        let peer = call.peer;
        match result {
            Ok(()) => {
                call.state = CallState::Active;
                log::info!("Call {id} with {peer} active");
                self.emit(peer, CallState::Active);
            }
            Err(e) => {
                log::warn!("Call {id} with {peer} failed: {e}");
                *slot = None;
                self.emit(peer, CallState::Failed);
                self.emit(peer, CallState::Idle);
            }
        }
    }
}

/// Owner of the single call slot.
pub struct CallSessionManager {
    inner: Arc<CallInner>,
    events_rx: Option<mpsc::UnboundedReceiver<CallEvent>>,
}

impl CallSessionManager {
    pub fn new(link: Arc<dyn MediaLink>, audio: Arc<dyn AudioSource>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(CallInner {
                link,
                audio,
                slot: Mutex::new(None),
                next_id: AtomicU64::new(1),
                events_tx,
            }),
            events_rx: Some(events_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<CallEvent>> {
        self.events_rx.take()
    }

    /// Ring `peer`. Checks fail without touching the slot; on success the
    /// call is Ringing and media negotiation continues in the background.
    pub async fn start_call(&self, peer: PeerKey) -> Result<(), CallError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.is_some() {
            return Err(CallError::Busy);
        }
        if !self.inner.link.is_open(peer).await {
            return Err(CallError::NotConnected);
        }
        let capture = self.inner.audio.acquire()?;

        let track = opus_track();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(CallSession {
            id,
            peer,
            state: CallState::Ringing,
            _audio: LocalAudio::start(capture, track.clone()),
        });
        log::info!("Call {id} ringing {peer}");
        self.inner.emit(peer, CallState::Ringing);
        drop(slot);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.link.attach_audio(peer, track).await;
            inner.finish_ringing(id, result).await;
        });
        Ok(())
    }

    /// Hang up. No-op when idle.
    pub async fn end_call(&self) {
        let Some(call) = self.inner.slot.lock().await.take() else {
            return;
        };
        log::info!("Call {} with {} ended", call.id, call.peer);
        let peer = call.peer;
        drop(call);
        self.inner.emit(peer, CallState::Idle);

        let link = self.inner.link.clone();
        tokio::spawn(async move { link.detach_audio(peer).await });
    }

    /// Force-end a call whose connection went away.
    pub async fn peer_closed(&self, peer: PeerKey) {
        let mut slot = self.inner.slot.lock().await;
        if !slot.as_ref().is_some_and(|c| c.peer == peer) {
            return;
        }
        if let Some(call) = slot.take() {
            log::info!("Call {} ended: connection to {peer} closed", call.id);
        }
        drop(slot);
        self.inner.emit(peer, CallState::Idle);
    }

    pub async fn current(&self) -> Option<CallInfo> {
        self.inner.slot.lock().await.as_ref().map(|c| CallInfo {
            id: c.id,
            peer: c.peer,
            state: c.state,
        })
    }
}
